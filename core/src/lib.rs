//! Tidewire Core - peer connections and the owner relay
//!
//! This crate moves game messages between players over an unreliable
//! datagram transport and fronts a dedicated server subprocess for the
//! hosting player.
//!
//! # Architecture
//!
//! - [`Peer`] - Client connection to a host, with handshake and keepalive
//! - [`OwnerRelay`] - Host-side hub that admits remotes and talks to the server
//! - [`PacketCodec`] - Header, compression and fragmentation for one connection
//! - [`Transport`] - Datagram transport abstraction (UDP or in-memory)
//! - [`NetConfig`] - Tunables loaded from `tidewire.toml`

pub mod config;
pub mod net;

pub use config::{ConfigError, NetConfig};
pub use net::{
    Authenticator, ClientIdentity, DeliveryMethod, DisconnectPacket, DisconnectReason, HostSettings, NetError,
    OwnerRelay, PacketCodec, Peer, PeerEvent, RelayEvent, ServerPipe, Transport,
};
