//! Network configuration (tidewire.toml)
//!
//! Every tunable consumed by the connection layer lives here: MTU and
//! fragmentation limits, heartbeat and timeout durations, DoS guard
//! thresholds, and relay capacity. Settings are stored in TOML; any missing
//! field falls back to its default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest MTU the packet codec can work with
pub const MIN_MTU: usize = 64;

/// Default config file name
pub const CONFIG_FILE_NAME: &str = "tidewire.toml";

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NetConfig {
    /// Packet size, fragmentation and compression settings
    #[serde(default)]
    pub packet: PacketConfig,
    /// Heartbeat, timeout and resend intervals
    #[serde(default)]
    pub timing: TimingConfig,
    /// Connection-initialization limits
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Per-endpoint packet rate limiting
    #[serde(default)]
    pub dos: DosConfig,
    /// Owner relay settings
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Packet size and compression configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketConfig {
    /// Largest datagram handed to the transport (default: 1200)
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Largest reassembled or decompressed message (default: 1 MiB)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Hard cap on fragments per message (default: 1024)
    #[serde(default = "default_max_fragments")]
    pub max_fragments: u16,
    /// Partial assemblies kept per sender before the oldest is evicted (default: 64)
    #[serde(default = "default_max_pending_assemblies")]
    pub max_pending_assemblies: usize,
    /// Whether outgoing payloads may be lz4 compressed (default: true)
    #[serde(default = "default_true")]
    pub compression: bool,
}

/// Timing configuration. All values are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Idle time before a heartbeat is sent (default: 1000)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence tolerated outside a round (default: 20000)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Silence tolerated while a round is running (default: 60000)
    #[serde(default = "default_in_round_timeout_ms")]
    pub in_round_timeout_ms: u64,
    /// Time allowed to reach the Success step (default: 30000)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Interval between resends of the current init step (default: 1000)
    #[serde(default = "default_init_resend_interval_ms")]
    pub init_resend_interval_ms: u64,
    /// Delay between telling a remote and telling the server it left (default: 1000)
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    /// Age at which a partial fragment assembly is dropped (default: 10000)
    #[serde(default = "default_fragment_assembly_timeout_ms")]
    pub fragment_assembly_timeout_ms: u64,
    /// Upper bound on a single ticket verification (default: 10000)
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
}

/// Connection-initialization limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Init messages accepted from one remote before giving up (default: 64)
    #[serde(default = "default_max_init_messages")]
    pub max_init_messages: u32,
    /// Wrong password attempts allowed (default: 3)
    #[serde(default = "default_password_retries")]
    pub password_retries: u8,
}

/// DoS guard configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosConfig {
    /// Whether packet rate limiting is active (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Counting window length (default: 1000)
    #[serde(default = "default_dos_window_ms")]
    pub window_ms: u64,
    /// Packets allowed per endpoint per window (default: 400)
    #[serde(default = "default_packet_threshold")]
    pub packet_threshold: u32,
    /// Offending windows before a ban is requested (default: 3)
    #[serde(default = "default_strikes_before_ban")]
    pub strikes_before_ban: u32,
    /// Clean windows after which strikes are forgotten (default: 30)
    #[serde(default = "default_strike_memory_windows")]
    pub strike_memory_windows: u32,
}

/// Owner relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Concurrent remote peers before new requests get ServerFull (default: 16)
    #[serde(default = "default_max_remote_peers")]
    pub max_remote_peers: usize,
    /// Reject remotes that send no ticket (default: true)
    #[serde(default = "default_true")]
    pub require_authentication: bool,
}

fn default_true() -> bool {
    true
}
fn default_mtu() -> usize {
    1200
}
fn default_max_message_size() -> usize {
    1024 * 1024
}
fn default_max_fragments() -> u16 {
    1024
}
fn default_max_pending_assemblies() -> usize {
    64
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_idle_timeout_ms() -> u64 {
    20_000
}
fn default_in_round_timeout_ms() -> u64 {
    60_000
}
fn default_handshake_timeout_ms() -> u64 {
    30_000
}
fn default_init_resend_interval_ms() -> u64 {
    1000
}
fn default_disconnect_grace_ms() -> u64 {
    1000
}
fn default_fragment_assembly_timeout_ms() -> u64 {
    10_000
}
fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_max_init_messages() -> u32 {
    64
}
fn default_password_retries() -> u8 {
    3
}

fn default_dos_window_ms() -> u64 {
    1000
}
fn default_packet_threshold() -> u32 {
    400
}
fn default_strikes_before_ban() -> u32 {
    3
}
fn default_strike_memory_windows() -> u32 {
    30
}

fn default_max_remote_peers() -> usize {
    16
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            max_message_size: default_max_message_size(),
            max_fragments: default_max_fragments(),
            max_pending_assemblies: default_max_pending_assemblies(),
            compression: default_true(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            in_round_timeout_ms: default_in_round_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            init_resend_interval_ms: default_init_resend_interval_ms(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            fragment_assembly_timeout_ms: default_fragment_assembly_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_init_messages: default_max_init_messages(),
            password_retries: default_password_retries(),
        }
    }
}

impl Default for DosConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            window_ms: default_dos_window_ms(),
            packet_threshold: default_packet_threshold(),
            strikes_before_ban: default_strikes_before_ban(),
            strike_memory_windows: default_strike_memory_windows(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_remote_peers: default_max_remote_peers(),
            require_authentication: default_true(),
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn in_round_timeout(&self) -> Duration {
        Duration::from_millis(self.in_round_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn init_resend_interval(&self) -> Duration {
        Duration::from_millis(self.init_resend_interval_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn fragment_assembly_timeout(&self) -> Duration {
        Duration::from_millis(self.fragment_assembly_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Timeout that applies given whether a round is running
    pub fn timeout(&self, round_active: bool) -> Duration {
        if round_active {
            self.in_round_timeout()
        } else {
            self.idle_timeout()
        }
    }
}

impl DosConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Configuration load/save errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read or write config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NetConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load from the platform config directory, falling back to defaults
    /// when the file is absent or unreadable.
    pub fn load_default() -> Self {
        let Some(path) = default_config_path() else {
            return Self::default();
        };
        match Self::load(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unusable config file");
                Self::default()
            }
        }
    }

    /// Write the config, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Reject settings the protocol cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.packet.mtu < MIN_MTU {
            return invalid("packet.mtu is below the minimum of 64 bytes");
        }
        if self.packet.max_fragments == 0 {
            return invalid("packet.max_fragments must be at least 1");
        }
        if self.packet.max_message_size == 0 {
            return invalid("packet.max_message_size must be non-zero");
        }
        if self.packet.max_pending_assemblies == 0 {
            return invalid("packet.max_pending_assemblies must be at least 1");
        }

        let t = &self.timing;
        let intervals = [
            (t.heartbeat_interval_ms, "timing.heartbeat_interval_ms"),
            (t.idle_timeout_ms, "timing.idle_timeout_ms"),
            (t.in_round_timeout_ms, "timing.in_round_timeout_ms"),
            (t.handshake_timeout_ms, "timing.handshake_timeout_ms"),
            (t.init_resend_interval_ms, "timing.init_resend_interval_ms"),
            (t.fragment_assembly_timeout_ms, "timing.fragment_assembly_timeout_ms"),
            (t.auth_timeout_ms, "timing.auth_timeout_ms"),
        ];
        for (value, name) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }

        if self.handshake.max_init_messages == 0 {
            return invalid("handshake.max_init_messages must be at least 1");
        }

        if self.dos.enabled {
            if self.dos.window_ms == 0 {
                return invalid("dos.window_ms must be non-zero");
            }
            if self.dos.packet_threshold == 0 {
                return invalid("dos.packet_threshold must be non-zero");
            }
            if self.dos.strikes_before_ban == 0 {
                return invalid("dos.strikes_before_ban must be at least 1");
            }
        }

        Ok(())
    }
}

/// Returns the platform-specific configuration directory.
///
/// On Linux: `~/.config/tidewire`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("io.tidewire", "", "tidewire").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Path of the default config file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}
