//! Discovery messages and protocol version.
//! The session stream itself carries raw bytes; only discovery datagrams are structured.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::DeviceId;

/// Current protocol version. Sent in beacons and in the transport service preamble.
pub const PROTOCOL_VERSION: u8 = 1;

/// Discovery datagrams. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Periodic advertisement: who we are and where the service listens.
    Beacon {
        protocol_version: u8,
        device_id: DeviceId,
        device_name: String,
        service: Uuid,
        listen_port: u16,
    },
    /// Unicast reply to a beacon so the sender learns about us without waiting a full interval.
    DiscoveryResponse {
        protocol_version: u8,
        device_id: DeviceId,
        device_name: String,
        service: Uuid,
        listen_port: u16,
    },
    /// Graceful leave; peers drop us from their table immediately.
    Leave { device_id: DeviceId },
}

impl Message {
    pub fn device_id(&self) -> DeviceId {
        match self {
            Message::Beacon { device_id, .. }
            | Message::DiscoveryResponse { device_id, .. }
            | Message::Leave { device_id } => *device_id,
        }
    }
}
