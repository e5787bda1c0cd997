//! Events reported to the consumer, and the forwarder that delivers them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::identity::PeerAddress;

/// Which side set up the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted by the inbound listener.
    Inbound,
    /// Dialed by the outbound connector.
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// One physical read. `length` is the byte count the read returned.
    DataReceived { payload: Vec<u8>, length: usize },
    /// A write completed; echoes the payload.
    DataSent { payload: Vec<u8> },
    /// A stream was promoted to the live session.
    Connected { origin: Origin, peer: PeerAddress },
    /// Listener or connector setup failed. Never sent for an established session.
    ConnectionFailed { origin: Origin, reason: String },
    /// The live session ended on its own (remote closed, read or write error, timeout).
    Disconnected { peer: PeerAddress, reason: String },
}

/// Consumer side of the event queue.
pub type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

/// Replaceable registration of the single consumer. Cloned into every subordinate component.
/// With no sink registered, events are dropped.
#[derive(Debug, Clone, Default)]
pub struct EventForwarder {
    sink: Arc<Mutex<Option<EventSink>>>,
}

impl EventForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sink, returning the previous one.
    pub fn set(&self, sink: Option<EventSink>) -> Option<EventSink> {
        std::mem::replace(&mut *self.sink.lock(), sink)
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let sink = self.sink.lock();
        match sink.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    trace!("event consumer gone; event dropped");
                }
            }
            None => trace!(?event, "no consumer registered; event dropped"),
        }
    }
}
