//! Disconnect packets
//!
//! ```text
//! [reason:u8][has_message:u8][len:u16][utf8 message...]
//! ```

use std::fmt;
use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    Unknown = 0,
    Disconnected = 1,
    Banned = 2,
    Kicked = 3,
    ServerShutdown = 4,
    ServerCrashed = 5,
    ServerFull = 6,
    AuthenticationRequired = 7,
    AuthenticationFailed = 8,
    InvalidVersion = 9,
    MissingContentPackage = 10,
    WrongPassword = 11,
    MalformedData = 12,
    TimedOut = 13,
    ExcessivePacketRate = 14,
}

impl DisconnectReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Unknown,
            1 => Self::Disconnected,
            2 => Self::Banned,
            3 => Self::Kicked,
            4 => Self::ServerShutdown,
            5 => Self::ServerCrashed,
            6 => Self::ServerFull,
            7 => Self::AuthenticationRequired,
            8 => Self::AuthenticationFailed,
            9 => Self::InvalidVersion,
            10 => Self::MissingContentPackage,
            11 => Self::WrongPassword,
            12 => Self::MalformedData,
            13 => Self::TimedOut,
            14 => Self::ExcessivePacketRate,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Disconnected => "disconnected",
            Self::Banned => "banned",
            Self::Kicked => "kicked",
            Self::ServerShutdown => "server shut down",
            Self::ServerCrashed => "server crashed",
            Self::ServerFull => "server full",
            Self::AuthenticationRequired => "authentication required",
            Self::AuthenticationFailed => "authentication failed",
            Self::InvalidVersion => "invalid version",
            Self::MissingContentPackage => "missing content package",
            Self::WrongPassword => "wrong password",
            Self::MalformedData => "malformed data",
            Self::TimedOut => "timed out",
            Self::ExcessivePacketRate => "excessive packet rate",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disconnect packet decode errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DisconnectDecodeError {
    #[error("disconnect packet truncated")]
    Truncated,

    #[error("unknown disconnect reason {0}")]
    UnknownReason(u8),

    #[error("disconnect message is not valid UTF-8")]
    InvalidUtf8,

    #[error("trailing bytes after disconnect packet")]
    TrailingBytes,
}

/// Reason plus optional human-readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason: DisconnectReason,
    pub message: Option<String>,
}

impl DisconnectPacket {
    pub fn new(reason: DisconnectReason) -> Self {
        Self { reason, message: None }
    }

    pub fn with_message(reason: DisconnectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: Some(message.into()),
        }
    }

    /// Append the wire form to `out`. Messages longer than `u16::MAX` bytes
    /// are cut at a character boundary.
    pub fn encode(&self, out: &mut Vec<u8>) {
        // Writing into a Vec cannot fail
        let _ = out.write_u8(self.reason as u8);
        match &self.message {
            Some(message) => {
                let mut end = message.len().min(u16::MAX as usize);
                while !message.is_char_boundary(end) {
                    end -= 1;
                }
                let _ = out.write_u8(1);
                let _ = out.write_u16::<LittleEndian>(end as u16);
                out.extend_from_slice(&message.as_bytes()[..end]);
            }
            None => {
                let _ = out.write_u8(0);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decode a packet that occupies the whole buffer
    pub fn decode(bytes: &[u8]) -> Result<Self, DisconnectDecodeError> {
        let mut cursor = bytes;
        let packet = Self::read_from(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(DisconnectDecodeError::TrailingBytes);
        }
        Ok(packet)
    }

    /// Decode a packet from the front of a cursor, advancing it
    pub fn read_from(cursor: &mut &[u8]) -> Result<Self, DisconnectDecodeError> {
        let reason_byte = cursor.read_u8().map_err(|_| DisconnectDecodeError::Truncated)?;
        let reason = DisconnectReason::from_u8(reason_byte).ok_or(DisconnectDecodeError::UnknownReason(reason_byte))?;

        let message = match cursor.read_u8().map_err(|_| DisconnectDecodeError::Truncated)? {
            0 => None,
            _ => {
                let len = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| DisconnectDecodeError::Truncated)? as usize;
                let mut bytes = vec![0u8; len];
                cursor
                    .read_exact(&mut bytes)
                    .map_err(|_| DisconnectDecodeError::Truncated)?;
                Some(String::from_utf8(bytes).map_err(|_| DisconnectDecodeError::InvalidUtf8)?)
            }
        };

        Ok(Self { reason, message })
    }
}

impl fmt::Display for DisconnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.reason, message),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl From<DisconnectReason> for DisconnectPacket {
    fn from(reason: DisconnectReason) -> Self {
        Self::new(reason)
    }
}
