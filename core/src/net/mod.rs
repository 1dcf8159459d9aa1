//! Peer connection and relay layer
//!
//! Everything between a game's message API and an unreliable datagram
//! transport: packet framing, fragmentation, connection initialization,
//! ticket authentication, and the owner relay that fronts a dedicated
//! server subprocess.
//!
//! # Architecture
//!
//! ```text
//!          Peer (client)                       OwnerRelay (host)
//!     ┌────────────────────┐             ┌────────────────────────────┐
//!     │ ClientHandshake    │             │ HostHandshake per remote   │
//!     │ PacketCodec        │             │ PacketCodec per remote     │
//!     └─────────┬──────────┘             │ Authenticator, DosGuard    │
//!               │                        └──────┬──────────────┬──────┘
//!     ┌─────────▼──────────┐   datagrams  ┌─────▼──────┐ ┌─────▼──────┐
//!     │     Transport      │◄────────────►│ Transport  │ │ ServerPipe │
//!     └────────────────────┘              └────────────┘ └─────┬──────┘
//!                                                               │ frames
//!                                                     server subprocess
//! ```
//!
//! The layer is single-threaded: state changes only inside `update` calls.
//! Ticket verification runs on a tokio runtime and is drained at the start
//! of each relay tick.

pub mod auth;
pub mod codec;
pub mod disconnect;
pub mod fragment;
pub mod guard;
pub mod header;
pub mod init;
pub mod peer;
pub mod pipe;
pub mod relay;
pub mod transport;
pub mod types;


pub use auth::{AuthCompletion, AuthError, Authenticator, HmacTicketIssuer, HmacTicketVerifier, TicketVerifier};
pub use codec::{IncomingPacket, OutgoingPacket, PacketCodec, PacketError};
pub use disconnect::{DisconnectPacket, DisconnectReason};
pub use guard::DosGuard;
pub use header::{DeliveryMethod, Framing, InitStep, PacketFlags, PacketHeader};
pub use init::{ClientIdentity, HostSettings};
pub use peer::{Peer, PeerEvent};
pub use pipe::{ChildProcessPipe, MemoryPipe, MemoryServer, PipeError, PipeMessage, ServerPipe, memory_pipe};
pub use relay::{AuthStatus, OwnerRelay, RelayEvent, RemotePeerState};
pub use transport::{
    DEFAULT_PORT, MemoryNetwork, MemoryTransport, Transport, TransportError, TransportEvent, UdpTransport,
};
pub use types::{NetError, TrafficStats};
