//! Connection manager: owns at most one listener or connector and at most one live session.
//!
//! All slot mutation goes through one lock. A listener or connector promotes its stream only
//! if it has not been cancelled, checked under that lock, so `stop()` can never be followed by
//! a late promotion and two promotions can never both become the live session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::connector::{ConnectorState, OutboundConnector};
use crate::event::{ConnectionEvent, EventForwarder, EventSink, Origin};
use crate::identity::PeerAddress;
use crate::listener::{InboundListener, ListenerState};
use crate::session::{SessionId, SessionState, StreamSession};
use crate::transport::{BoxStream, Transport};

#[derive(Default)]
struct Slots {
    listener: Option<InboundListener>,
    connector: Option<OutboundConnector>,
    session: Option<Arc<StreamSession>>,
}

/// What subordinate components get from the manager: promotion into the live slot,
/// the event forwarder, and the configuration.
#[derive(Clone)]
pub(crate) struct Hub {
    slots: Arc<Mutex<Slots>>,
    events: EventForwarder,
    config: Arc<ManagerConfig>,
    next_session: Arc<AtomicU64>,
}

impl Hub {
    pub(crate) fn new(config: ManagerConfig) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots::default())),
            events: EventForwarder::new(),
            config: Arc::new(config),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn events(&self) -> &EventForwarder {
        &self.events
    }

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Make `stream` the live session, superseding the current one, and report `Connected`.
    /// Returns `None` (and drops the stream) if `claimant` was cancelled first.
    pub(crate) fn promote(
        &self,
        claimant: &CancellationToken,
        origin: Origin,
        peer: PeerAddress,
        stream: BoxStream,
    ) -> Option<SessionId> {
        let mut slots = self.slots.lock();
        if claimant.is_cancelled() {
            debug!(%peer, "promotion refused: component was cancelled");
            return None;
        }
        if let Some(old) = slots.session.take() {
            info!(session = %old.id(), peer = %old.peer(), "superseding live session");
            old.cancel();
        }
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        // Reported before the read loop starts, so no data can precede it.
        self.events.emit(ConnectionEvent::Connected {
            origin,
            peer: peer.clone(),
        });
        let slots_ref = Arc::downgrade(&self.slots);
        let session = StreamSession::spawn(
            id,
            origin,
            peer,
            stream,
            self.events.clone(),
            &self.config,
            move |id| {
                if let Some(slots) = slots_ref.upgrade() {
                    let mut slots = slots.lock();
                    if slots.session.as_ref().is_some_and(|s| s.id() == id) {
                        slots.session = None;
                    }
                }
            },
        );
        info!(session = %id, peer = %session.peer(), ?origin, "session live");
        slots.session = Some(session);
        Some(id)
    }

    pub(crate) fn live_session(&self) -> Option<Arc<StreamSession>> {
        self.slots.lock().session.clone()
    }
}

/// The live session as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub origin: Origin,
    pub peer: PeerAddress,
    /// `Closed` only in the short window before an ended session leaves its slot.
    pub state: SessionState,
}

/// Snapshot of the manager's slots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManagerStatus {
    pub listener: Option<ListenerState>,
    pub connector: Option<(PeerAddress, ConnectorState)>,
    pub session: Option<SessionInfo>,
}

pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    hub: Hub,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ManagerConfig::default())
    }

    pub fn with_config(transport: T, config: ManagerConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            hub: Hub::new(config),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        self.hub.config()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Cancel any outbound dial, then start a listener unless one is already running.
    /// A live session is left alone.
    ///
    /// # Panics
    /// Outside a Tokio runtime.
    pub fn start(&self) {
        let mut slots = self.hub.slots.lock();
        if let Some(connector) = slots.connector.take() {
            connector.cancel();
        }
        if slots.listener.as_ref().is_some_and(InboundListener::is_running) {
            debug!("listener already running");
            return;
        }
        slots.listener = Some(InboundListener::spawn(
            self.transport.clone(),
            self.hub.clone(),
        ));
    }

    /// Cancel connector, listener and session, in that order. Never fails.
    pub fn stop(&self) {
        let mut slots = self.hub.slots.lock();
        if let Some(connector) = slots.connector.take() {
            connector.cancel();
        }
        if let Some(listener) = slots.listener.take() {
            listener.cancel();
        }
        if let Some(session) = slots.session.take() {
            info!(session = %session.id(), peer = %session.peer(), "closing live session");
            session.cancel();
        }
    }

    /// Cancel any outbound dial and dial `peer`. The live session, if any, stays until the
    /// new stream is promoted.
    ///
    /// # Panics
    /// Outside a Tokio runtime.
    pub fn connect(&self, peer: impl Into<PeerAddress>) {
        let peer = peer.into();
        let mut slots = self.hub.slots.lock();
        if let Some(connector) = slots.connector.take() {
            connector.cancel();
        }
        slots.connector = Some(OutboundConnector::spawn(
            self.transport.clone(),
            self.hub.clone(),
            peer,
        ));
    }

    /// Send `bytes` over the live session. A no-op without one.
    pub async fn write(&self, bytes: &[u8]) {
        match self.hub.live_session() {
            Some(session) => session.write(bytes).await,
            None => debug!(len = bytes.len(), "no live session; write dropped"),
        }
    }

    /// Replace the event consumer. `None` detaches it; events are then dropped.
    pub fn set_consumer(&self, sink: Option<EventSink>) {
        self.hub.events.set(sink);
    }

    pub fn is_connected(&self) -> bool {
        self.hub.slots.lock().session.is_some()
    }

    pub fn status(&self) -> ManagerStatus {
        let slots = self.hub.slots.lock();
        ManagerStatus {
            listener: slots.listener.as_ref().map(InboundListener::state),
            connector: slots
                .connector
                .as_ref()
                .map(|c| (c.peer().clone(), c.state())),
            session: slots.session.as_ref().map(|s| SessionInfo {
                id: s.id(),
                origin: s.origin(),
                peer: s.peer().clone(),
                state: s.state(),
            }),
        }
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
