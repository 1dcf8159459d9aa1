//! Connection-initialization handshake
//!
//! Drives a connection from first contact to `Success` before any game
//! traffic flows.
//!
//! # Protocol Flow
//!
//! ```text
//! Client                                   Host
//!   |                                        |
//!   |--- AuthInfoAndVersion ---------------->|  (version, content, ticket)
//!   |                                        |  ... async ticket verification
//!   |<-- Password(salt, retries) ------------|  (only if a password is set)
//!   |--- Password(hash) -------------------->|
//!   |                                        |
//!   |<-- ContentPackageOrder(packages) ------|
//!   |--- ContentPackageOrder(ack) ---------->|
//!   |                                        |
//!   |<-- Success ----------------------------|
//!   +========= game traffic ================+
//! ```
//!
//! Both sides resend or re-prompt on duplicates, so the exchange completes
//! over a lossy, reordering transport.

pub mod client;
pub mod host;
pub mod messages;
pub mod validation;

#[cfg(test)]
mod tests;

use tidewire_shared::{AuthTicket, ContentPackageInfo};

pub use client::{ClientAction, ClientHandshake};
pub use host::{HostAction, HostHandshake, HostPhase};
pub use messages::{
    AuthInfoAndVersion, ClientInit, ContentPackageAck, ContentPackageOrder, HostInit, InitMessageError,
    MAX_PLAYER_NAME_LEN, PasswordPrompt, PasswordResponse, hash_password,
};
pub use validation::validate_hello;

/// What the hosting side requires of joining clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    /// Clients must report exactly this version
    pub game_version: String,
    /// Packages every client must have, in load order
    pub content_packages: Vec<ContentPackageInfo>,
    /// Session password, if any
    pub password: Option<String>,
}

/// What a joining client presents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub player_name: String,
    pub game_version: String,
    pub ticket: Option<AuthTicket>,
    pub content_packages: Vec<ContentPackageInfo>,
}

impl ClientIdentity {
    pub fn hello(&self) -> AuthInfoAndVersion {
        AuthInfoAndVersion {
            player_name: self.player_name.clone(),
            game_version: self.game_version.clone(),
            ticket: self.ticket.clone(),
            content_packages: self.content_packages.clone(),
        }
    }
}
