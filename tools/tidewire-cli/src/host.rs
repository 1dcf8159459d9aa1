//! Host command - owner relay in front of a server subprocess

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;
use tidewire_core::net::{
    Authenticator, ChildProcessPipe, DEFAULT_PORT, HmacTicketVerifier, HostSettings, OwnerRelay, RelayEvent,
    UdpTransport,
};
use tidewire_shared::ContentPackageInfo;

use crate::{load_config, parse_key, parse_package};

/// Arguments for the host command
#[derive(Args)]
pub struct HostArgs {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Game version remotes must match
    #[arg(long, default_value = "1.0")]
    pub game_version: String,

    /// Content package in load order, as NAME=HEXHASH (repeatable)
    #[arg(long = "package", value_parser = parse_package)]
    pub packages: Vec<ContentPackageInfo>,

    /// Session password
    #[arg(long)]
    pub password: Option<String>,

    /// Hex shared key for LOCAL tickets
    #[arg(long, value_parser = parse_key)]
    pub ticket_key: Option<Vec<u8>>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Relay tick interval in milliseconds
    #[arg(long, default_value_t = 10)]
    pub tick_ms: u64,

    /// Server program and its arguments
    #[arg(last = true, required = true)]
    pub server: Vec<String>,
}

/// Execute the host command
pub fn execute(args: HostArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let Some((program, server_args)) = args.server.split_first() else {
        bail!("No server program given");
    };

    let mut authenticator = Authenticator::with_runtime().context("Failed to start auth runtime")?;
    match args.ticket_key {
        Some(key) => authenticator.register(Arc::new(HmacTicketVerifier::new(key))),
        None if config.relay.require_authentication => {
            tracing::warn!("No ticket verifier configured; every ticketed remote will be refused");
        }
        None => {}
    }

    let transport = UdpTransport::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)))
        .with_context(|| format!("Failed to bind UDP port {}", args.port))?;
    let pipe = ChildProcessPipe::spawn(program, server_args).context("Failed to start server")?;
    let settings = HostSettings {
        game_version: args.game_version,
        content_packages: args.packages,
        password: args.password,
    };

    tracing::info!(addr = %transport.local_addr(), server = %program, "Hosting");
    let mut relay = OwnerRelay::new(transport, pipe, authenticator, config, settings);
    relay.start()?;

    let tick = Duration::from_millis(args.tick_ms.max(1));
    let mut last = Instant::now();
    loop {
        let now = Instant::now();
        let events = relay.update(now - last);
        last = now;

        for event in events {
            match event {
                RelayEvent::RemoteConnected { endpoint, account } => match account {
                    Some(account) => println!("+ {} ({})", endpoint, account),
                    None => println!("+ {}", endpoint),
                },
                RelayEvent::RemoteDisconnected { endpoint, packet } => println!("- {} ({})", endpoint, packet),
                RelayEvent::OwnerMessage { payload, .. } => {
                    println!("server: {}", String::from_utf8_lossy(&payload));
                }
                RelayEvent::RemoteFlagged { endpoint, banned } => {
                    println!("! {} flooding{}", endpoint, if banned { ", banned" } else { "" });
                }
                RelayEvent::Closed(packet) => {
                    println!("relay closed ({})", packet);
                    return Ok(());
                }
            }
        }

        if !relay.is_active() {
            return Ok(());
        }
        std::thread::sleep(tick);
    }
}
