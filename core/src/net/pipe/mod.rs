//! Local link between the owner relay and the dedicated server subprocess
//!
//! Every message is one length-prefixed frame:
//!
//! ```text
//! ┌──────────────┬──────┬──────────────────────────────┐
//! │ len: u32 LE  │ kind │ fields (per kind, see below) │
//! └──────────────┴──────┴──────────────────────────────┘
//! ```
//!
//! Strings (endpoints, account ids) are `u16 LE` length + UTF-8. Payloads are
//! `u32 LE` length + bytes. Optional fields carry a presence byte first.
//! Disconnect packets use the same encoding as on the wire to peers.

mod child;
mod memory;

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tidewire_shared::{AccountId, Endpoint};

use super::disconnect::DisconnectPacket;
use super::header::DeliveryMethod;

pub use child::ChildProcessPipe;
pub use memory::{MemoryPipe, MemoryServer, memory_pipe};

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

const KIND_PEER_CONNECTED: u8 = 1;
const KIND_PEER_DATA: u8 = 2;
const KIND_PEER_DISCONNECTED: u8 = 3;
const KIND_OWNER_DATA: u8 = 4;
const KIND_TO_PEER: u8 = 5;
const KIND_TO_OWNER: u8 = 6;
const KIND_DISCONNECT_PEER: u8 = 7;
const KIND_SHUTDOWN: u8 = 8;

/// Server pipe errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("frame of {size} bytes exceeds {max}")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("field of {0} bytes is too long to encode")]
    FieldTooLong(usize),

    #[error("server pipe is closed")]
    Closed,
}

impl From<io::Error> for PipeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A message on the server pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeMessage {
    // Relay -> server
    /// A remote finished initialization
    PeerConnected { endpoint: Endpoint, account: Option<AccountId> },
    /// Game payload from an initialized remote
    PeerData {
        endpoint: Endpoint,
        account: Option<AccountId>,
        delivery: DeliveryMethod,
        payload: Vec<u8>,
    },
    /// A previously connected remote is gone
    PeerDisconnected {
        endpoint: Endpoint,
        account: Option<AccountId>,
        packet: DisconnectPacket,
    },
    /// Game payload from the owning local player
    OwnerData { delivery: DeliveryMethod, payload: Vec<u8> },

    // Server -> relay
    /// Game payload for one remote
    ToPeer {
        endpoint: Endpoint,
        delivery: DeliveryMethod,
        payload: Vec<u8>,
    },
    /// Game payload for the owning local player
    ToOwner { delivery: DeliveryMethod, payload: Vec<u8> },
    /// Ask the relay to drop a remote
    DisconnectPeer { endpoint: Endpoint, packet: DisconnectPacket },

    // Either direction
    /// The sender is going away
    Shutdown(DisconnectPacket),
}

impl PipeMessage {
    pub fn kind(&self) -> u8 {
        match self {
            Self::PeerConnected { .. } => KIND_PEER_CONNECTED,
            Self::PeerData { .. } => KIND_PEER_DATA,
            Self::PeerDisconnected { .. } => KIND_PEER_DISCONNECTED,
            Self::OwnerData { .. } => KIND_OWNER_DATA,
            Self::ToPeer { .. } => KIND_TO_PEER,
            Self::ToOwner { .. } => KIND_TO_OWNER,
            Self::DisconnectPeer { .. } => KIND_DISCONNECT_PEER,
            Self::Shutdown(_) => KIND_SHUTDOWN,
        }
    }

    /// Encode the frame body (without the length prefix)
    pub fn encode(&self) -> Result<Vec<u8>, PipeError> {
        let mut out = vec![self.kind()];
        match self {
            Self::PeerConnected { endpoint, account } => {
                put_str(&mut out, &endpoint.to_string())?;
                put_account(&mut out, account.as_ref())?;
            }
            Self::PeerData {
                endpoint,
                account,
                delivery,
                payload,
            } => {
                put_str(&mut out, &endpoint.to_string())?;
                put_account(&mut out, account.as_ref())?;
                out.push(*delivery as u8);
                put_bytes(&mut out, payload)?;
            }
            Self::ToPeer {
                endpoint,
                delivery,
                payload,
            } => {
                put_str(&mut out, &endpoint.to_string())?;
                out.push(*delivery as u8);
                put_bytes(&mut out, payload)?;
            }
            Self::PeerDisconnected {
                endpoint,
                account,
                packet,
            } => {
                put_str(&mut out, &endpoint.to_string())?;
                put_account(&mut out, account.as_ref())?;
                packet.encode(&mut out);
            }
            Self::DisconnectPeer { endpoint, packet } => {
                put_str(&mut out, &endpoint.to_string())?;
                packet.encode(&mut out);
            }
            Self::OwnerData { delivery, payload } | Self::ToOwner { delivery, payload } => {
                out.push(*delivery as u8);
                put_bytes(&mut out, payload)?;
            }
            Self::Shutdown(packet) => packet.encode(&mut out),
        }
        Ok(out)
    }

    /// Decode a complete frame body
    pub fn decode(body: &[u8]) -> Result<Self, PipeError> {
        let mut cursor = body;
        let kind = cursor.read_u8().map_err(|_| PipeError::Malformed("empty frame"))?;

        let message = match kind {
            KIND_PEER_CONNECTED => {
                let endpoint = get_endpoint(&mut cursor)?;
                let account = get_account(&mut cursor)?;
                Self::PeerConnected { endpoint, account }
            }
            KIND_PEER_DATA => Self::PeerData {
                endpoint: get_endpoint(&mut cursor)?,
                account: get_account(&mut cursor)?,
                delivery: get_delivery(&mut cursor)?,
                payload: get_bytes(&mut cursor)?,
            },
            KIND_TO_PEER => Self::ToPeer {
                endpoint: get_endpoint(&mut cursor)?,
                delivery: get_delivery(&mut cursor)?,
                payload: get_bytes(&mut cursor)?,
            },
            KIND_PEER_DISCONNECTED => Self::PeerDisconnected {
                endpoint: get_endpoint(&mut cursor)?,
                account: get_account(&mut cursor)?,
                packet: get_disconnect(&mut cursor)?,
            },
            KIND_DISCONNECT_PEER => Self::DisconnectPeer {
                endpoint: get_endpoint(&mut cursor)?,
                packet: get_disconnect(&mut cursor)?,
            },
            KIND_OWNER_DATA | KIND_TO_OWNER => {
                let delivery = get_delivery(&mut cursor)?;
                let payload = get_bytes(&mut cursor)?;
                if kind == KIND_OWNER_DATA {
                    Self::OwnerData { delivery, payload }
                } else {
                    Self::ToOwner { delivery, payload }
                }
            }
            KIND_SHUTDOWN => Self::Shutdown(get_disconnect(&mut cursor)?),
            other => return Err(PipeError::UnknownKind(other)),
        };

        if !cursor.is_empty() {
            return Err(PipeError::Malformed("trailing bytes"));
        }
        Ok(message)
    }
}

/// Write one length-prefixed frame
pub fn write_frame<W: Write>(writer: &mut W, message: &PipeMessage) -> Result<(), PipeError> {
    let body = message.encode()?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(PipeError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_u32::<LittleEndian>(body.len() as u32)?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<PipeMessage>, PipeError> {
    let len = match reader.read_u32::<LittleEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(PipeError::FrameTooLarge {
            size: len as usize,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    PipeMessage::decode(&body).map(Some)
}

/// Link to the dedicated server
///
/// All methods are non-blocking.
pub trait ServerPipe {
    fn send(&mut self, message: &PipeMessage) -> Result<(), PipeError>;

    fn poll(&mut self) -> Option<PipeMessage>;

    /// False once the server has exited or the link broke
    fn is_alive(&mut self) -> bool;

    fn close(&mut self);
}

fn put_str(out: &mut Vec<u8>, value: &str) -> Result<(), PipeError> {
    let len = u16::try_from(value.len()).map_err(|_| PipeError::FieldTooLong(value.len()))?;
    out.write_u16::<LittleEndian>(len)?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_account(out: &mut Vec<u8>, account: Option<&AccountId>) -> Result<(), PipeError> {
    match account {
        Some(account) => {
            out.push(1);
            put_str(out, &account.to_string())
        }
        None => {
            out.push(0);
            Ok(())
        }
    }
}

fn put_bytes(out: &mut Vec<u8>, value: &[u8]) -> Result<(), PipeError> {
    let len = u32::try_from(value.len()).map_err(|_| PipeError::FieldTooLong(value.len()))?;
    out.write_u32::<LittleEndian>(len)?;
    out.extend_from_slice(value);
    Ok(())
}

fn get_u8(cursor: &mut &[u8]) -> Result<u8, PipeError> {
    cursor.read_u8().map_err(|_| PipeError::Malformed("truncated"))
}

fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8], PipeError> {
    let (head, rest) = cursor.split_at_checked(len).ok_or(PipeError::Malformed("truncated"))?;
    *cursor = rest;
    Ok(head)
}

fn get_str(cursor: &mut &[u8]) -> Result<String, PipeError> {
    let len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| PipeError::Malformed("truncated"))? as usize;
    let bytes = take(cursor, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| PipeError::Malformed("invalid UTF-8"))
}

fn get_bytes(cursor: &mut &[u8]) -> Result<Vec<u8>, PipeError> {
    let len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| PipeError::Malformed("truncated"))? as usize;
    Ok(take(cursor, len)?.to_vec())
}

fn get_endpoint(cursor: &mut &[u8]) -> Result<Endpoint, PipeError> {
    get_str(cursor)?
        .parse()
        .map_err(|_| PipeError::Malformed("invalid endpoint"))
}

fn get_account(cursor: &mut &[u8]) -> Result<Option<AccountId>, PipeError> {
    match get_u8(cursor)? {
        0 => Ok(None),
        _ => get_str(cursor)?
            .parse()
            .map(Some)
            .map_err(|_| PipeError::Malformed("invalid account id")),
    }
}

fn get_delivery(cursor: &mut &[u8]) -> Result<DeliveryMethod, PipeError> {
    DeliveryMethod::from_u8(get_u8(cursor)?).ok_or(PipeError::Malformed("invalid delivery method"))
}

fn get_disconnect(cursor: &mut &[u8]) -> Result<DisconnectPacket, PipeError> {
    DisconnectPacket::read_from(cursor).map_err(|_| PipeError::Malformed("invalid disconnect packet"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::disconnect::DisconnectReason;
    use std::io::Cursor;

    fn endpoint() -> Endpoint {
        "STEAM_76561198000000001".parse().unwrap()
    }

    #[test]
    fn test_frame_layout() {
        let message = PipeMessage::ToOwner {
            delivery: DeliveryMethod::Reliable,
            payload: vec![0xAA, 0xBB],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &message).unwrap();

        // len (4) + kind + delivery + payload len (4) + payload
        assert_eq!(buf, vec![8, 0, 0, 0, KIND_TO_OWNER, 1, 2, 0, 0, 0, 0xAA, 0xBB]);
    }

    #[test]
    fn test_peer_frames_carry_the_account() {
        let endpoint: Endpoint = "EOS_7".parse().unwrap();
        let message = PipeMessage::PeerData {
            endpoint: endpoint.clone(),
            account: Some("EOS_7".parse().unwrap()),
            delivery: DeliveryMethod::Reliable,
            payload: vec![0xAA],
        };
        let body = message.encode().unwrap();

        // kind, endpoint, presence + account, delivery, payload
        let mut expected = vec![KIND_PEER_DATA, 5, 0];
        expected.extend_from_slice(b"EOS_7");
        expected.extend_from_slice(&[1, 5, 0]);
        expected.extend_from_slice(b"EOS_7");
        expected.extend_from_slice(&[1, 1, 0, 0, 0, 0xAA]);
        assert_eq!(body, expected);

        let anonymous = PipeMessage::PeerDisconnected {
            endpoint,
            account: None,
            packet: DisconnectPacket::new(DisconnectReason::Disconnected),
        };
        let body = anonymous.encode().unwrap();
        assert_eq!(body[8], 0);
        assert_eq!(PipeMessage::decode(&body), Ok(anonymous));
    }

    #[test]
    fn test_frames_in_sequence() {
        let messages = vec![
            PipeMessage::PeerConnected {
                endpoint: endpoint(),
                account: Some("STEAM_76561198000000001".parse().unwrap()),
            },
            PipeMessage::PeerConnected {
                endpoint: "DIRECT_127.0.0.1:7777".parse().unwrap(),
                account: None,
            },
            PipeMessage::PeerData {
                endpoint: endpoint(),
                account: Some("STEAM_76561198000000001".parse().unwrap()),
                delivery: DeliveryMethod::ReliableOrdered,
                payload: b"move 1 2".to_vec(),
            },
            PipeMessage::PeerData {
                endpoint: "DIRECT_127.0.0.1:7777".parse().unwrap(),
                account: None,
                delivery: DeliveryMethod::Unreliable,
                payload: b"ping".to_vec(),
            },
            PipeMessage::PeerDisconnected {
                endpoint: endpoint(),
                account: Some("STEAM_76561198000000001".parse().unwrap()),
                packet: DisconnectPacket::with_message(DisconnectReason::Kicked, "bye"),
            },
            PipeMessage::OwnerData {
                delivery: DeliveryMethod::Unreliable,
                payload: Vec::new(),
            },
            PipeMessage::DisconnectPeer {
                endpoint: endpoint(),
                packet: DisconnectPacket::new(DisconnectReason::Banned),
            },
            PipeMessage::Shutdown(DisconnectPacket::new(DisconnectReason::ServerShutdown)),
        ];

        let mut buf = Vec::new();
        for message in &messages {
            write_frame(&mut buf, message).unwrap();
        }

        let mut reader = Cursor::new(buf);
        for expected in &messages {
            assert_eq!(read_frame(&mut reader).unwrap().as_ref(), Some(expected));
        }
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut reader = Cursor::new((MAX_FRAME_SIZE + 1).to_le_bytes().to_vec());
        assert!(matches!(read_frame(&mut reader), Err(PipeError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut reader = Cursor::new(vec![10, 0, 0, 0, KIND_SHUTDOWN]);
        assert!(matches!(read_frame(&mut reader), Err(PipeError::Io(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(PipeMessage::decode(&[]), Err(PipeError::Malformed("empty frame")));
        assert_eq!(PipeMessage::decode(&[99]), Err(PipeError::UnknownKind(99)));
        assert_eq!(
            PipeMessage::decode(&[KIND_TO_OWNER, 7, 0, 0, 0, 0]),
            Err(PipeError::Malformed("invalid delivery method"))
        );
        assert_eq!(
            PipeMessage::decode(&[KIND_TO_OWNER, 0, 5, 0, 0, 0, 1]),
            Err(PipeError::Malformed("truncated"))
        );

        let mut body = PipeMessage::Shutdown(DisconnectPacket::new(DisconnectReason::Unknown))
            .encode()
            .unwrap();
        body.push(0);
        assert_eq!(PipeMessage::decode(&body), Err(PipeError::Malformed("trailing bytes")));
    }

    #[test]
    fn test_decode_rejects_bad_endpoint() {
        let mut body = vec![KIND_TO_PEER];
        put_str(&mut body, "NOPE_1").unwrap();
        body.push(0);
        put_bytes(&mut body, &[]).unwrap();
        assert_eq!(PipeMessage::decode(&body), Err(PipeError::Malformed("invalid endpoint")));
    }
}
