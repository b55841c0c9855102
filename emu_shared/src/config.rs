//! Configuration system.
//!
//! Loads networking configuration from JSON strings (file IO left to the
//! loader shim). Every field has a default so an empty `{}` is a valid
//! configuration.

use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// UDP/TCP port the discovery plane uses when nothing is configured.
pub const DEFAULT_DISCOVERY_PORT: u16 = 47584;

/// How many consecutive ports to try when the base port is taken.
pub const PORT_SCAN_RANGE: u16 = 1000;

/// Sentinel app id carried by peers doing a lobby handoff; always treated
/// as compatible with the local app id.
pub const LOBBY_HANDOFF_APP_ID: u32 = 0xFFFF_FFFE;

/// Networking configuration shared by user and gameserver facades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Application identifier; peers only pair up under a matching one.
    pub app_id: u32,
    /// Base discovery port; the next [`PORT_SCAN_RANGE`] ports are tried
    /// when it is already bound.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra broadcast targets, `"host"` or `"host:port"`. Port 0 (or a
    /// bare host) means the base port.
    #[serde(default)]
    pub custom_broadcasts: Vec<String>,
    /// Start with networking fully disabled; `run()` becomes a no-op and
    /// every send reports failure.
    #[serde(default)]
    pub disable_networking: bool,
    /// Gap between discovery PING broadcasts, in milliseconds.
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,
    /// Silence after which a TCP stream is considered dead; heartbeats go
    /// out at half this, in milliseconds.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Silence after which a peer record is dropped and the user is
    /// reported offline, in milliseconds.
    #[serde(default = "default_user_timeout_ms")]
    pub user_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_broadcast_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    20_000
}

fn default_user_timeout_ms() -> u64 {
    20_000
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            port: default_port(),
            custom_broadcasts: Vec::new(),
            disable_networking: false,
            broadcast_interval_ms: default_broadcast_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            user_timeout_ms: default_user_timeout_ms(),
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn user_timeout(&self) -> Duration {
        Duration::from_millis(self.user_timeout_ms)
    }

    /// Resolves the configured custom broadcast targets. Hostnames go
    /// through the system resolver; entries that do not resolve to an
    /// IPv4 address are skipped.
    pub fn resolved_custom_broadcasts(&self) -> Vec<SocketAddrV4> {
        self.custom_broadcasts
            .iter()
            .filter_map(|s| resolve_broadcast_target(s, self.port))
            .collect()
    }
}

/// Resolves one `"host"` / `"host:port"` broadcast entry to an IPv4
/// endpoint, substituting `default_port` when no port (or port 0) is
/// given.
pub fn resolve_broadcast_target(entry: &str, default_port: u16) -> Option<SocketAddrV4> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }

    // `ToSocketAddrs` needs a port; add one for bare hosts.
    let with_port = if entry.contains(':') {
        entry.to_string()
    } else {
        format!("{}:{}", entry, default_port)
    };

    let resolved = with_port.to_socket_addrs().ok()?.find_map(|a| match a {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    })?;

    let port = if resolved.port() == 0 {
        default_port
    } else {
        resolved.port()
    };
    Some(SocketAddrV4::new(*resolved.ip(), port))
}
