//! Outbound connector: dials one peer for the service and promotes the stream on success.
//! A failed dial is terminal; the caller connects again to retry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{ConnectionEvent, Origin};
use crate::identity::PeerAddress;
use crate::manager::Hub;
use crate::service::SERVICE_ID;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Created,
    Dialing,
    Connected,
    Failed,
    Cancelled,
}

impl ConnectorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectorState::Connected | ConnectorState::Failed | ConnectorState::Cancelled
        )
    }
}

pub struct OutboundConnector {
    peer: PeerAddress,
    cancel: CancellationToken,
    state: Arc<Mutex<ConnectorState>>,
}

impl OutboundConnector {
    /// Start dialing `peer` in a background task. Must be called within a Tokio runtime.
    pub(crate) fn spawn<T: Transport>(transport: Arc<T>, hub: Hub, peer: PeerAddress) -> Self {
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(ConnectorState::Created));
        tokio::spawn(run(
            transport,
            hub,
            peer.clone(),
            cancel.clone(),
            state.clone(),
        ));
        Self {
            peer,
            cancel,
            state,
        }
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn state(&self) -> ConnectorState {
        *self.state.lock()
    }

    /// Abort the dial and close any half-open socket. Silent and idempotent.
    pub fn cancel(&self) {
        if advance(&self.state, ConnectorState::Cancelled) {
            debug!(peer = %self.peer, "connector cancelled");
        }
        self.cancel.cancel();
    }
}

fn advance(state: &Mutex<ConnectorState>, next: ConnectorState) -> bool {
    let mut current = state.lock();
    if current.is_terminal() {
        return false;
    }
    *current = next;
    true
}

async fn dial<T: Transport>(
    transport: &T,
    peer: &PeerAddress,
    limit: Option<Duration>,
) -> Result<T::Stream, TransportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, transport.dial(peer, &SERVICE_ID))
            .await
            .unwrap_or(Err(TransportError::TimedOut(limit))),
        None => transport.dial(peer, &SERVICE_ID).await,
    }
}

async fn run<T: Transport>(
    transport: Arc<T>,
    hub: Hub,
    peer: PeerAddress,
    cancel: CancellationToken,
    state: Arc<Mutex<ConnectorState>>,
) {
    // Discovery and dialing share the radio.
    transport.cancel_discovery();
    if !advance(&state, ConnectorState::Dialing) {
        return;
    }
    info!(%peer, service = %SERVICE_ID, "dialing");

    let dialed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = dial(transport.as_ref(), &peer, hub.config().dial_timeout) => r,
    };
    match dialed {
        Ok(stream) => {
            if hub
                .promote(&cancel, Origin::Outbound, peer, Box::new(stream))
                .is_some()
            {
                *state.lock() = ConnectorState::Connected;
            } else {
                advance(&state, ConnectorState::Cancelled);
            }
        }
        Err(e) => {
            if advance(&state, ConnectorState::Failed) {
                warn!(%peer, error = %e, "dial failed");
                hub.events().emit(ConnectionEvent::ConnectionFailed {
                    origin: Origin::Outbound,
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::service::ServiceId;
    use crate::transport::memory::{MemoryListener, MemoryNetwork};
    use std::future::Future;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    /// Dials that never complete, like a radio waiting on an absent peer.
    struct StalledTransport;

    impl Transport for StalledTransport {
        type Stream = DuplexStream;
        type Listener = MemoryListener;

        fn listen<'a>(
            &'a self,
            _service: &'a ServiceId,
        ) -> impl Future<Output = Result<MemoryListener, TransportError>> + Send + 'a {
            async { Err(TransportError::Closed) }
        }

        fn dial<'a>(
            &'a self,
            _peer: &'a PeerAddress,
            _service: &'a ServiceId,
        ) -> impl Future<Output = Result<DuplexStream, TransportError>> + Send + 'a {
            std::future::pending()
        }

        fn cancel_discovery(&self) {}
    }

    fn hub_with_events(
        config: ManagerConfig,
    ) -> (Hub, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let hub = Hub::new(config);
        let (tx, rx) = mpsc::unbounded_channel();
        hub.events().set(Some(tx));
        (hub, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn dial_timeout_is_a_setup_failure() {
        let (hub, mut rx) =
            hub_with_events(ManagerConfig::default().with_dial_timeout(Duration::from_secs(10)));
        let connector = OutboundConnector::spawn(Arc::new(StalledTransport), hub, "far".into());
        match rx.recv().await {
            Some(ConnectionEvent::ConnectionFailed { origin, reason }) => {
                assert_eq!(origin, Origin::Outbound);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(connector.state(), ConnectorState::Failed);
        connector.cancel();
        assert_eq!(connector.state(), ConnectorState::Failed);
    }

    #[tokio::test]
    async fn cancel_unblocks_pending_dial_silently() {
        let (hub, mut rx) = hub_with_events(ManagerConfig::default());
        let connector =
            OutboundConnector::spawn(Arc::new(StalledTransport), hub.clone(), "far".into());
        tokio::time::timeout(Duration::from_secs(5), async {
            while connector.state() != ConnectorState::Dialing {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        connector.cancel();
        connector.cancel();
        tokio::task::yield_now().await;
        assert_eq!(connector.state(), ConnectorState::Cancelled);
        assert!(rx.try_recv().is_err());
        assert!(hub.live_session().is_none());
    }

    #[tokio::test]
    async fn successful_dial_promotes_and_stops_discovery() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let _listening = a.listen(&SERVICE_ID).await.unwrap();
        let b = Arc::new(net.endpoint("b"));
        let (hub, mut rx) = hub_with_events(ManagerConfig::default());

        let connector = OutboundConnector::spawn(b.clone(), hub.clone(), a.address());
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Connected {
                origin: Origin::Outbound,
                peer: a.address()
            })
        );
        assert_eq!(connector.state(), ConnectorState::Connected);
        assert_eq!(b.discovery_cancellations(), 1);
        assert_eq!(hub.live_session().unwrap().peer(), &a.address());
    }
}
