//! Tunables for the connection manager and its sessions.

use std::time::Duration;

/// Default read buffer: one `DataReceived` event carries at most this many bytes.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Manager configuration. Every deadline defaults to none: accept, dial, read and write
/// then wait until the transport itself reports an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub read_buffer_size: usize,
    /// Upper bound on an outbound dial, including the service handshake.
    pub dial_timeout: Option<Duration>,
    /// Upper bound on a single write; expiry closes the session.
    pub write_timeout: Option<Duration>,
    /// Close the session when nothing arrives for this long.
    pub read_idle_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            dial_timeout: None,
            write_timeout: None,
            read_idle_timeout: None,
        }
    }
}

impl ManagerConfig {
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        // A zero-length read buffer would look like EOF on every read.
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.read_idle_timeout = Some(timeout);
        self
    }
}
