//! Echo server - the smallest program that speaks the server pipe protocol
//!
//! Reads frames from stdin and writes frames to stdout. Every peer payload
//! is sent back to the same peer, and owner payloads back to the owner.

use std::io::{BufReader, BufWriter};

use anyhow::{Context, Result};
use tidewire_core::net::pipe::{PipeMessage, read_frame, write_frame};

/// Execute the echo-server command
pub fn execute() -> Result<()> {
    let mut input = BufReader::new(std::io::stdin().lock());
    let mut output = BufWriter::new(std::io::stdout().lock());

    while let Some(message) = read_frame(&mut input).context("Failed to read from relay")? {
        let reply = match message {
            PipeMessage::PeerConnected { endpoint, account } => {
                tracing::info!(%endpoint, account = ?account.map(|a| a.to_string()), "Peer joined");
                None
            }
            PipeMessage::PeerData {
                endpoint,
                delivery,
                payload,
                ..
            } => Some(PipeMessage::ToPeer {
                endpoint,
                delivery,
                payload,
            }),
            PipeMessage::PeerDisconnected {
                endpoint,
                account,
                packet,
            } => {
                tracing::info!(%endpoint, account = ?account.map(|a| a.to_string()), %packet, "Peer left");
                None
            }
            PipeMessage::OwnerData { delivery, payload } => Some(PipeMessage::ToOwner { delivery, payload }),
            PipeMessage::Shutdown(packet) => {
                tracing::info!(%packet, "Relay shut down");
                break;
            }
            other => {
                tracing::warn!(kind = other.kind(), "Unexpected message from relay");
                None
            }
        };

        if let Some(reply) = reply {
            write_frame(&mut output, &reply).context("Failed to write to relay")?;
        }
    }
    Ok(())
}
