//! Tidewire CLI - run a relay, join one, or stand in for a game server
//!
//! # Commands
//!
//! - `tidewire host` - Spawn a server subprocess and relay UDP peers to it
//! - `tidewire join` - Connect to a host and exchange lines over stdin/stdout
//! - `tidewire echo-server` - Minimal server speaking the pipe protocol
//!
//! # Usage
//!
//! ```bash
//! # Host a session backed by the built-in echo server
//! tidewire host --package Vanilla=1 -- tidewire echo-server
//!
//! # Join it from another machine
//! tidewire join 192.168.1.50:7777 --name bob --package Vanilla=1
//! ```
//!
//! Logs go to stderr. Set `RUST_LOG` to change the level.

mod echo_server;
mod host;
mod join;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tidewire_core::NetConfig;
use tidewire_shared::ContentPackageInfo;

/// Tidewire CLI - peer connections and owner relay
#[derive(Parser)]
#[command(name = "tidewire")]
#[command(about = "Host or join tidewire sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a server subprocess and relay remote peers to it
    Host(host::HostArgs),

    /// Connect to a host and exchange lines over stdin/stdout
    Join(join::JoinArgs),

    /// Echo peer traffic back over the server pipe (stdin/stdout)
    EchoServer,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Host(args) => host::execute(args),
        Commands::Join(args) => join::execute(args),
        Commands::EchoServer => echo_server::execute(),
    }
}

/// Load `path`, or the platform config file when none is given
fn load_config(path: Option<&PathBuf>) -> Result<NetConfig> {
    match path {
        Some(path) => NetConfig::load(path).with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(NetConfig::load_default()),
    }
}

/// Parse `NAME=HASH` with a hex hash
fn parse_package(value: &str) -> Result<ContentPackageInfo, String> {
    let (name, hash) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=HASH, got '{}'", value))?;
    if name.is_empty() {
        return Err("package name is empty".to_string());
    }
    let hash = u64::from_str_radix(hash.trim_start_matches("0x"), 16)
        .map_err(|e| format!("invalid hash '{}': {}", hash, e))?;
    Ok(ContentPackageInfo::new(name, hash))
}

/// Decode a hex shared key
fn parse_key(value: &str) -> Result<Vec<u8>, String> {
    let key = hex::decode(value).map_err(|e| format!("invalid hex key: {}", e))?;
    if key.len() < 16 {
        return Err("shared key must be at least 16 bytes".to_string());
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_package() {
        let package = parse_package("Vanilla=ff").unwrap();
        assert_eq!(package.name, "Vanilla");
        assert_eq!(package.hash, 0xff);

        assert_eq!(parse_package("Mod=0x10").unwrap().hash, 0x10);
        assert!(parse_package("Vanilla").is_err());
        assert!(parse_package("=1").is_err());
        assert!(parse_package("Vanilla=zz").is_err());
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("00112233445566778899aabbccddeeff").unwrap().len(), 16);
        assert!(parse_key("0011").is_err());
        assert!(parse_key("not hex").is_err());
    }

    #[test]
    fn test_cli_parses_host_command() {
        let cli = Cli::try_parse_from([
            "tidewire", "host", "--port", "9000", "--package", "Vanilla=1", "--", "server", "--flag",
        ])
        .unwrap();
        let Commands::Host(args) = cli.command else {
            panic!("expected host command");
        };
        assert_eq!(args.port, 9000);
        assert_eq!(args.server, vec!["server".to_string(), "--flag".to_string()]);
    }
}
