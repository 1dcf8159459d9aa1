//! Per-connection packet codec
//!
//! Outbound: header, optional lz4 compression, then fragmentation of the whole
//! encoded packet when it exceeds the MTU. Inbound: header validation,
//! reassembly, then decompression with a size check before allocating.
//!
//! Each connection owns its own codec, so a remote can only ever fill its own
//! reassembly buffers.

use std::time::Duration;

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::config::NetConfig;

use super::disconnect::{DisconnectDecodeError, DisconnectPacket};
use super::fragment::{Defragmenter, FRAGMENT_HEADER_SIZE, Fragment, FragmentError, FragmentLimits, Fragmenter};
use super::header::{DeliveryMethod, Framing, HeaderError, InitStep, PacketFlags, PacketHeader};

/// Header bytes in front of every fragment
const FRAGMENT_PACKET_OVERHEAD: usize = 2 + FRAGMENT_HEADER_SIZE;

/// Packet level errors. Any of these from a remote is treated as malformed data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("header: {0}")]
    Header(#[from] HeaderError),

    #[error("fragment: {0}")]
    Fragment(#[from] FragmentError),

    #[error("disconnect packet: {0}")]
    Disconnect(#[from] DisconnectDecodeError),

    #[error("reassembled packet is itself a fragment")]
    NestedFragment,

    #[error("compressed body is missing its size prefix")]
    MissingSizePrefix,

    #[error("decompressed size {size} exceeds limit {max}")]
    DecompressedTooLarge { size: usize, max: usize },

    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// A datagram ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    pub data: Vec<u8>,
    pub delivery: DeliveryMethod,
}

/// A fully reassembled and decompressed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPacket {
    pub header: PacketHeader,
    pub body: Vec<u8>,
}

impl IncomingPacket {
    pub fn framing(&self) -> Framing {
        self.header.framing()
    }

    /// Decode the body as a disconnect packet
    pub fn disconnect_packet(&self) -> Result<DisconnectPacket, PacketError> {
        Ok(DisconnectPacket::decode(&self.body)?)
    }
}

/// Encoder/decoder for one connection
#[derive(Debug)]
pub struct PacketCodec {
    mtu: usize,
    compression: bool,
    max_message_size: usize,
    from_server: bool,
    fragmenter: Fragmenter,
    defragmenter: Defragmenter,
}

impl PacketCodec {
    /// `from_server` selects whether outgoing packets carry SERVER_MESSAGE
    pub fn new(config: &NetConfig, from_server: bool) -> Self {
        let mtu = config.packet.mtu;
        Self {
            mtu,
            compression: config.packet.compression,
            max_message_size: config.packet.max_message_size,
            from_server,
            fragmenter: Fragmenter::new(mtu.saturating_sub(FRAGMENT_PACKET_OVERHEAD), config.packet.max_fragments),
            defragmenter: Defragmenter::new(FragmentLimits::from_config(config)),
        }
    }

    fn base_flags(&self) -> PacketFlags {
        if self.from_server {
            PacketFlags::SERVER_MESSAGE
        } else {
            PacketFlags::empty()
        }
    }

    /// Encode a game data payload
    pub fn encode_data(
        &mut self,
        body: &[u8],
        delivery: DeliveryMethod,
        allow_compression: bool,
    ) -> Result<Vec<OutgoingPacket>, PacketError> {
        let header = PacketHeader::new(delivery, self.base_flags());
        self.encode(header, body, allow_compression)
    }

    /// Encode an init-step message
    pub fn encode_init(
        &mut self,
        step: InitStep,
        body: &[u8],
    ) -> Result<Vec<OutgoingPacket>, PacketError> {
        let header = PacketHeader::init_step(DeliveryMethod::Reliable, step, self.from_server);
        self.encode(header, body, false)
    }

    /// Encode a keepalive
    pub fn encode_heartbeat(&mut self) -> Result<Vec<OutgoingPacket>, PacketError> {
        let header = PacketHeader::new(DeliveryMethod::Unreliable, self.base_flags() | PacketFlags::HEARTBEAT);
        self.encode(header, &[], false)
    }

    /// Encode a disconnect packet
    pub fn encode_disconnect(&mut self, packet: &DisconnectPacket) -> Result<Vec<OutgoingPacket>, PacketError> {
        let header = PacketHeader::new(DeliveryMethod::Reliable, self.base_flags() | PacketFlags::DISCONNECT);
        self.encode(header, &packet.to_bytes(), false)
    }

    /// Encode a packet, compressing and fragmenting as needed
    pub fn encode(
        &mut self,
        mut header: PacketHeader,
        body: &[u8],
        allow_compression: bool,
    ) -> Result<Vec<OutgoingPacket>, PacketError> {
        let compressed = if allow_compression && self.compression && header.framing() == Framing::Data && !body.is_empty()
        {
            let candidate = compress_prepend_size(body);
            (candidate.len() < body.len()).then_some(candidate)
        } else {
            None
        };
        header.flags.set(PacketFlags::COMPRESSED, compressed.is_some());
        let body = compressed.as_deref().unwrap_or(body);

        let mut packet = Vec::with_capacity(header.encoded_len() + body.len());
        header.write(&mut packet)?;
        packet.extend_from_slice(body);

        if packet.len() <= self.mtu {
            return Ok(vec![OutgoingPacket {
                data: packet,
                delivery: header.delivery,
            }]);
        }

        let fragments = self.fragmenter.fragment(&packet)?;
        tracing::trace!(
            size = packet.len(),
            fragments = fragments.len(),
            "Fragmenting oversized packet"
        );

        // Losing one fragment stalls the whole message
        let delivery = header.delivery.reliable();
        let fragment_header = PacketHeader::new(delivery, self.base_flags() | PacketFlags::FRAGMENT);

        let mut out = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let mut data = Vec::with_capacity(FRAGMENT_PACKET_OVERHEAD + fragment.payload.len());
            fragment_header.write(&mut data)?;
            fragment.encode(&mut data);
            out.push(OutgoingPacket { data, delivery });
        }
        Ok(out)
    }

    /// Decode one received datagram. Returns `None` while a fragmented packet
    /// is still incomplete or when a fragment was a harmless duplicate.
    pub fn decode(&mut self, datagram: &[u8]) -> Result<Option<IncomingPacket>, PacketError> {
        let (header, body) = PacketHeader::read(datagram)?;
        if header.framing() != Framing::Fragment {
            return self.decode_inner(header, body).map(Some);
        }

        let fragment = Fragment::decode(body)?;
        let Some(packet) = self.defragmenter.process(fragment)? else {
            return Ok(None);
        };

        let (inner, inner_body) = PacketHeader::read(&packet)?;
        if inner.framing() == Framing::Fragment {
            return Err(PacketError::NestedFragment);
        }
        self.decode_inner(inner, inner_body).map(Some)
    }

    fn decode_inner(&self, header: PacketHeader, body: &[u8]) -> Result<IncomingPacket, PacketError> {
        if !header.is_compressed() {
            return Ok(IncomingPacket {
                header,
                body: body.to_vec(),
            });
        }

        let prefix: [u8; 4] = body
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(PacketError::MissingSizePrefix)?;
        let size = u32::from_le_bytes(prefix) as usize;
        if size > self.max_message_size {
            return Err(PacketError::DecompressedTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        let body = decompress_size_prepended(body).map_err(|e| PacketError::Decompress(e.to_string()))?;
        Ok(IncomingPacket { header, body })
    }

    /// Age out stale partial assemblies
    pub fn update(&mut self, dt: Duration) {
        self.defragmenter.update(dt);
    }

    /// Forget partial assemblies, used when a session restarts
    pub fn reset(&mut self) {
        self.defragmenter.clear();
    }
}
