//! Service configuration.

use serde::{Deserialize, Serialize};

use std::path::PathBuf;

/// Default Unix-domain socket the service listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/detd/detd_service.sock";

/// Default cap on a frame's payload length.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Default log sink.
pub const DEFAULT_LOG_PATH: &str = "/var/log/detd.log";

/// Tunables of the intake service.
///
/// # Examples
///
/// ```rust
/// use detd::ServiceConfig;
///
/// let config = ServiceConfig::default()
///     .with_socket_path("/tmp/detd-test.sock")
///     .with_max_connections(4);
/// assert_eq!(config.max_connections, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Filesystem path of the listening socket
    pub socket_path: PathBuf,
    /// Largest accepted frame payload; longer frames drop the connection
    pub max_frame_bytes: usize,
    /// Connections served in parallel; admission stays serialised per
    /// interface regardless
    pub max_connections: usize,
    /// Log sink, used when writable
    pub log_path: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_connections: 1,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
        }
    }
}

impl ServiceConfig {
    #[must_use = "builder methods consume self and return a new configuration"]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    #[must_use = "builder methods consume self and return a new configuration"]
    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    #[must_use = "builder methods consume self and return a new configuration"]
    pub fn with_max_connections(mut self, connections: usize) -> Self {
        self.max_connections = connections.max(1);
        self
    }

    #[must_use = "builder methods consume self and return a new configuration"]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }
}
