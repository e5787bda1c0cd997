//! OffMesh connection core.
//! One live point-to-point byte stream at a time: an inbound listener or an outbound
//! connector establishes it, a stream session pumps it, the manager coordinates all three
//! and forwards their events to a single consumer.

pub mod config;
pub mod event;
pub mod identity;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod wire;

pub mod connector;
pub mod listener;
pub mod manager;
pub mod session;

pub use config::ManagerConfig;
pub use connector::{ConnectorState, OutboundConnector};
pub use event::{ConnectionEvent, EventForwarder, EventSink, Origin};
pub use identity::{DeviceId, PeerAddress};
pub use listener::{InboundListener, ListenerState};
pub use manager::{ConnectionManager, ManagerStatus, SessionInfo};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use service::{ServiceId, SERVICE_ID};
pub use session::{SessionId, SessionState, StreamSession};
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::tcp::TcpTransport;
pub use transport::{DiscoveryControl, Transport, TransportError, TransportListener};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
