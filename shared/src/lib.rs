//! Shared value types for tidewire sessions.
//!
//! Everything in here is plain data: endpoint addressing, account identity,
//! authentication tickets and content package metadata. No I/O happens in
//! this crate so both the relay and any server subprocess can depend on it.

pub mod account;
pub mod content;
pub mod endpoint;

pub use account::{AccountId, AccountIdParseError, AccountInfo, AccountProvider, AuthTicket, TicketKind};
pub use content::{ContentMismatch, ContentPackageInfo, check_content_compatibility};
pub use endpoint::{Endpoint, EndpointParseError, P2pProvider};
