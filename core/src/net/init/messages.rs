//! Init-step message bodies
//!
//! The packet header carries the step tag; the body is the bitcode encoding
//! of the struct for that step. Client and host bodies for the same tag
//! differ, so each side decodes with its own enum.

use bitcode::{Decode, Encode};
use sha2::{Digest, Sha256};
use tidewire_shared::{AuthTicket, ContentPackageInfo};

use crate::net::header::InitStep;

/// Longest accepted player name in bytes
pub const MAX_PLAYER_NAME_LEN: usize = 32;

/// First message from the client
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AuthInfoAndVersion {
    pub player_name: String,
    pub game_version: String,
    /// Absent when the client has no identity provider
    pub ticket: Option<AuthTicket>,
    /// Packages the client has enabled
    pub content_packages: Vec<ContentPackageInfo>,
}

/// Host asks for the session password
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct PasswordPrompt {
    pub salt: u32,
    pub retries_left: u8,
}

/// Salted password hash from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct PasswordResponse {
    pub hash: [u8; 32],
}

/// Host's package list in load order
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ContentPackageOrder {
    pub packages: Vec<ContentPackageInfo>,
}

/// Client echoes the hashes of the order it adopted
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ContentPackageAck {
    pub hashes: Vec<u64>,
}

/// Hash a password with the host-provided salt
pub fn hash_password(salt: u32, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.to_le_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Init message decode errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitMessageError {
    #[error("malformed {0:?} message")]
    Malformed(InitStep),

    #[error("no message of this direction exists for step {0:?}")]
    UnexpectedStep(InitStep),
}

fn decode<T: for<'a> Decode<'a>>(step: InitStep, body: &[u8]) -> Result<T, InitMessageError> {
    bitcode::decode(body).map_err(|_| InitMessageError::Malformed(step))
}

/// Messages sent by the client, tagged with the client's current step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInit {
    AuthInfoAndVersion(AuthInfoAndVersion),
    Password(PasswordResponse),
    ContentPackageOrder(ContentPackageAck),
}

impl ClientInit {
    pub fn step(&self) -> InitStep {
        match self {
            Self::AuthInfoAndVersion(_) => InitStep::AuthInfoAndVersion,
            Self::Password(_) => InitStep::Password,
            Self::ContentPackageOrder(_) => InitStep::ContentPackageOrder,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::AuthInfoAndVersion(m) => bitcode::encode(m),
            Self::Password(m) => bitcode::encode(m),
            Self::ContentPackageOrder(m) => bitcode::encode(m),
        }
    }

    pub fn decode(step: InitStep, body: &[u8]) -> Result<Self, InitMessageError> {
        Ok(match step {
            InitStep::AuthInfoAndVersion => Self::AuthInfoAndVersion(decode(step, body)?),
            InitStep::Password => Self::Password(decode(step, body)?),
            InitStep::ContentPackageOrder => Self::ContentPackageOrder(decode(step, body)?),
            InitStep::Success => return Err(InitMessageError::UnexpectedStep(step)),
        })
    }
}

/// Messages sent by the host, tagged with the step it wants the client in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostInit {
    Password(PasswordPrompt),
    ContentPackageOrder(ContentPackageOrder),
    Success,
}

impl HostInit {
    pub fn step(&self) -> InitStep {
        match self {
            Self::Password(_) => InitStep::Password,
            Self::ContentPackageOrder(_) => InitStep::ContentPackageOrder,
            Self::Success => InitStep::Success,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Password(m) => bitcode::encode(m),
            Self::ContentPackageOrder(m) => bitcode::encode(m),
            Self::Success => Vec::new(),
        }
    }

    pub fn decode(step: InitStep, body: &[u8]) -> Result<Self, InitMessageError> {
        Ok(match step {
            InitStep::Password => Self::Password(decode(step, body)?),
            InitStep::ContentPackageOrder => Self::ContentPackageOrder(decode(step, body)?),
            InitStep::Success => Self::Success,
            InitStep::AuthInfoAndVersion => return Err(InitMessageError::UnexpectedStep(step)),
        })
    }
}
