//! Join command - connect to a host and chat over stdin/stdout
//!
//! Each stdin line is sent as one reliable ordered message once the
//! handshake completes. Every message received is printed as a line.

use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::{self, TryRecvError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;
use tidewire_core::net::{
    ClientIdentity, DeliveryMethod, DisconnectPacket, DisconnectReason, HmacTicketIssuer, Peer, PeerEvent,
    UdpTransport,
};
use tidewire_shared::{AccountId, AccountProvider, ContentPackageInfo, Endpoint};

use crate::{load_config, parse_key, parse_package};

/// Arguments for the join command
#[derive(Args)]
pub struct JoinArgs {
    /// Host address, e.g. 192.168.1.50:7777
    pub host: SocketAddr,

    /// Player name shown to the host
    #[arg(short, long, default_value = "player")]
    pub name: String,

    /// Game version to report
    #[arg(long, default_value = "1.0")]
    pub game_version: String,

    /// Installed content package, as NAME=HEXHASH (repeatable)
    #[arg(long = "package", value_parser = parse_package)]
    pub packages: Vec<ContentPackageInfo>,

    /// Password to answer prompts with
    #[arg(long)]
    pub password: Option<String>,

    /// Hex shared key; signs a LOCAL ticket for --name
    #[arg(long, value_parser = parse_key)]
    pub ticket_key: Option<Vec<u8>>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Tick interval in milliseconds
    #[arg(long, default_value_t = 10)]
    pub tick_ms: u64,
}

/// Execute the join command
pub fn execute(args: JoinArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;

    let ticket = match &args.ticket_key {
        Some(key) => {
            let account = AccountId::new(AccountProvider::Local, args.name.clone());
            Some(HmacTicketIssuer::new(key.clone()).issue(&account)?)
        }
        None => None,
    };
    let identity = ClientIdentity {
        player_name: args.name.clone(),
        game_version: args.game_version,
        ticket,
        content_packages: args.packages,
    };

    let transport = UdpTransport::bind_any().context("Failed to bind UDP socket")?;
    let mut peer = Peer::new(Endpoint::Direct(args.host), transport, config, identity);
    peer.start()?;

    let lines = spawn_stdin_reader()?;
    let tick = Duration::from_millis(args.tick_ms.max(1));
    let mut last = Instant::now();
    loop {
        let now = Instant::now();
        for event in peer.update(now - last) {
            match event {
                PeerEvent::MessageReceived(payload) => println!("{}", String::from_utf8_lossy(&payload)),
                PeerEvent::PasswordRequested { retries_left, .. } => match &args.password {
                    Some(password) => {
                        tracing::info!(retries_left, "Answering password prompt");
                        peer.send_password(password)?;
                    }
                    None => {
                        peer.close(DisconnectPacket::new(DisconnectReason::Disconnected));
                        bail!("Host requires a password; pass --password");
                    }
                },
                PeerEvent::InitializationComplete => tracing::info!(host = %args.host, "Joined"),
                PeerEvent::Disconnected(packet) => {
                    tracing::info!(%packet, "Disconnected");
                    return Ok(());
                }
            }
        }
        last = now;

        loop {
            match lines.try_recv() {
                Ok(line) if peer.is_initialized() => {
                    peer.send(line.as_bytes(), DeliveryMethod::ReliableOrdered, true)?;
                }
                Ok(_) => tracing::warn!("Not joined yet, dropping input"),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    peer.close(DisconnectPacket::new(DisconnectReason::Disconnected));
                    return Ok(());
                }
            }
        }
        std::thread::sleep(tick);
    }
}

/// Forward stdin lines to a channel from a background thread
fn spawn_stdin_reader() -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("tidewire-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn stdin reader")?;
    Ok(rx)
}
