//! Identities: this device's ID (advertised in discovery) and opaque peer addresses.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device ID: random per process. Lets discovery drop its own beacons and key the peer table.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn generate() -> Self {
        DeviceId(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell peers apart on screen.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Opaque address of a remote endpoint, as handed over by the discovery layer.
/// The core never parses it; only the transport does.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        PeerAddress(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        PeerAddress(s.to_owned())
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        PeerAddress(s)
    }
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        PeerAddress(addr.to_string())
    }
}
