//! Resolved gateway configuration: CLI values plus defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Default state directory name under the user's home.
const DEFAULT_STATE_DIR: &str = ".phbgateway";

/// Handshake timeout from socket accept to authenticated.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// How long a pairing socket may wait for the desktop's verdict.
const PAIRING_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address for the WebSocket listener.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Directory holding the gateway identity and desktop binding.
    pub state_dir: PathBuf,
    /// Optional cap on concurrent connections. `None` means unlimited.
    pub max_connections: Option<usize>,
    /// Optional per-session idle timeout. `None` means disabled.
    pub idle_timeout: Option<Duration>,
    /// Handshake timeout from accept to authenticated.
    pub handshake_timeout: Duration,
    /// Pairing wait limit.
    pub pairing_timeout: Duration,
}

impl GatewayConfig {
    pub fn resolve(
        host: String,
        port: u16,
        state_dir: Option<PathBuf>,
        max_connections: Option<usize>,
        idle_timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            host,
            port,
            state_dir: state_dir.unwrap_or_else(default_state_dir),
            max_connections,
            idle_timeout: idle_timeout_secs.map(Duration::from_secs),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            pairing_timeout: PAIRING_TIMEOUT,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(DEFAULT_STATE_DIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}
