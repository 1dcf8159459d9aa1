//! Packet header codec
//!
//! Every packet starts with a small header:
//!
//! ```text
//! [delivery:u8][flags:u8][init_step:u8 if INIT_STEP]
//! ```
//!
//! At most one framing flag (INIT_STEP, FRAGMENT, HEARTBEAT, DISCONNECT) may be
//! set. A packet with none of them carries game data.

use byteorder::{ReadBytesExt, WriteBytesExt};

/// Largest encoded header
pub const MAX_HEADER_SIZE: usize = 3;

/// Delivery guarantee requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryMethod {
    Unreliable = 0,
    Reliable = 1,
    ReliableOrdered = 2,
}

impl DeliveryMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unreliable),
            1 => Some(Self::Reliable),
            2 => Some(Self::ReliableOrdered),
            _ => None,
        }
    }

    pub fn is_reliable(self) -> bool {
        !matches!(self, Self::Unreliable)
    }

    /// Reliable method to use when this one is not reliable enough
    pub fn reliable(self) -> Self {
        match self {
            Self::Unreliable => Self::Reliable,
            other => other,
        }
    }
}

bitflags::bitflags! {
    /// Packet header flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        /// Body is lz4 compressed with a prepended size
        const COMPRESSED = 0x01;
        /// Body is a connection-initialization message
        const INIT_STEP = 0x02;
        /// Body is one fragment of a larger packet
        const FRAGMENT = 0x04;
        /// Keepalive with an empty body
        const HEARTBEAT = 0x08;
        /// Body is a disconnect packet
        const DISCONNECT = 0x10;
        /// Sent by the host side of the connection
        const SERVER_MESSAGE = 0x20;
    }
}

impl PacketFlags {
    /// Flags that select how the body is framed; mutually exclusive
    pub const FRAMING: Self = Self::INIT_STEP
        .union(Self::FRAGMENT)
        .union(Self::HEARTBEAT)
        .union(Self::DISCONNECT);
}

/// Stage of the connection-initialization handshake.
///
/// Ordered by the sequence a connection moves through. Password is skipped
/// when the host has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum InitStep {
    AuthInfoAndVersion = 1,
    Password = 2,
    ContentPackageOrder = 3,
    Success = 4,
}

impl InitStep {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::AuthInfoAndVersion),
            2 => Some(Self::Password),
            3 => Some(Self::ContentPackageOrder),
            4 => Some(Self::Success),
            _ => None,
        }
    }
}

/// How a packet body must be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Data,
    InitStep(InitStep),
    Fragment,
    Heartbeat,
    Disconnect,
}

/// Header decode/encode errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("packet too short for header")]
    TooShort,

    #[error("invalid delivery method {0}")]
    InvalidDelivery(u8),

    #[error("unknown flag bits {0:#04x}")]
    UnknownFlags(u8),

    #[error("conflicting framing flags {0:?}")]
    ConflictingFlags(PacketFlags),

    #[error("invalid init step {0}")]
    InvalidInitStep(u8),

    #[error("init step flag and init step tag disagree")]
    InitStepMismatch,
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub delivery: DeliveryMethod,
    pub flags: PacketFlags,
    pub init_step: Option<InitStep>,
}

impl PacketHeader {
    /// Header for a packet without an init step
    pub fn new(delivery: DeliveryMethod, flags: PacketFlags) -> Self {
        Self {
            delivery,
            flags,
            init_step: None,
        }
    }

    /// Header for an init-step message
    pub fn init_step(delivery: DeliveryMethod, step: InitStep, from_server: bool) -> Self {
        let mut flags = PacketFlags::INIT_STEP;
        flags.set(PacketFlags::SERVER_MESSAGE, from_server);
        Self {
            delivery,
            flags,
            init_step: Some(step),
        }
    }

    pub fn is_server_message(&self) -> bool {
        self.flags.contains(PacketFlags::SERVER_MESSAGE)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(PacketFlags::COMPRESSED)
    }

    /// Check the framing invariants
    pub fn validate(&self) -> Result<(), HeaderError> {
        let framing = self.flags & PacketFlags::FRAMING;
        if framing.bits().count_ones() > 1 {
            return Err(HeaderError::ConflictingFlags(framing));
        }
        if self.flags.contains(PacketFlags::INIT_STEP) != self.init_step.is_some() {
            return Err(HeaderError::InitStepMismatch);
        }
        Ok(())
    }

    /// Body framing selected by the flags
    pub fn framing(&self) -> Framing {
        if let Some(step) = self.init_step {
            Framing::InitStep(step)
        } else if self.flags.contains(PacketFlags::FRAGMENT) {
            Framing::Fragment
        } else if self.flags.contains(PacketFlags::HEARTBEAT) {
            Framing::Heartbeat
        } else if self.flags.contains(PacketFlags::DISCONNECT) {
            Framing::Disconnect
        } else {
            Framing::Data
        }
    }

    pub fn encoded_len(&self) -> usize {
        if self.init_step.is_some() { 3 } else { 2 }
    }

    /// Append the encoded header to `out`
    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), HeaderError> {
        self.validate()?;
        // Writing into a Vec cannot fail
        let _ = out.write_u8(self.delivery as u8);
        let _ = out.write_u8(self.flags.bits());
        if let Some(step) = self.init_step {
            let _ = out.write_u8(step as u8);
        }
        Ok(())
    }

    /// Decode a header, returning it and the remaining body
    pub fn read(packet: &[u8]) -> Result<(Self, &[u8]), HeaderError> {
        let mut cursor = packet;
        let delivery_byte = cursor.read_u8().map_err(|_| HeaderError::TooShort)?;
        let flag_bits = cursor.read_u8().map_err(|_| HeaderError::TooShort)?;

        let delivery = DeliveryMethod::from_u8(delivery_byte).ok_or(HeaderError::InvalidDelivery(delivery_byte))?;
        let flags = PacketFlags::from_bits(flag_bits).ok_or(HeaderError::UnknownFlags(flag_bits))?;

        let framing = flags & PacketFlags::FRAMING;
        if framing.bits().count_ones() > 1 {
            return Err(HeaderError::ConflictingFlags(framing));
        }

        let init_step = if flags.contains(PacketFlags::INIT_STEP) {
            let tag = cursor.read_u8().map_err(|_| HeaderError::TooShort)?;
            Some(InitStep::from_u8(tag).ok_or(HeaderError::InvalidInitStep(tag))?)
        } else {
            None
        };

        Ok((
            Self {
                delivery,
                flags,
                init_step,
            },
            cursor,
        ))
    }
}
