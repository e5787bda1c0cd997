//! In-process transport: named endpoints on a shared [`MemoryNetwork`], streams are
//! `tokio::io::duplex` pipes. Dropping either end of a pipe reads as EOF on the other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Transport, TransportError, TransportListener};
use crate::identity::PeerAddress;
use crate::service::ServiceId;

const PIPE_CAPACITY: usize = 64 * 1024;

type Incoming = mpsc::UnboundedSender<(DuplexStream, PeerAddress)>;

/// Registry of listening endpoints, keyed by endpoint name and service.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<(String, Uuid), Incoming>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the endpoint called `name`. Peers dial it by that name.
    pub fn endpoint(&self, name: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            name: PeerAddress::new(name),
            discovery_cancels: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether an open listening endpoint is registered for `service` under `name`.
    pub fn is_listening(&self, name: &str, service: &ServiceId) -> bool {
        self.endpoints
            .lock()
            .get(&(name.to_owned(), service.uuid()))
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    name: PeerAddress,
    discovery_cancels: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn address(&self) -> PeerAddress {
        self.name.clone()
    }

    /// How many times a dial asked this endpoint to stop discovery.
    pub fn discovery_cancellations(&self) -> usize {
        self.discovery_cancels.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    type Stream = DuplexStream;
    type Listener = MemoryListener;

    fn listen<'a>(
        &'a self,
        service: &'a ServiceId,
    ) -> impl Future<Output = Result<MemoryListener, TransportError>> + Send + 'a {
        async move {
            let key = (self.name.as_str().to_owned(), service.uuid());
            let mut endpoints = self.network.endpoints.lock();
            if endpoints.get(&key).is_some_and(|tx| !tx.is_closed()) {
                return Err(TransportError::ServiceInUse(format!(
                    "{} on {}",
                    service.name(),
                    self.name
                )));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            endpoints.insert(key, tx);
            Ok(MemoryListener {
                incoming: rx,
                local: self.name.clone(),
            })
        }
    }

    fn dial<'a>(
        &'a self,
        peer: &'a PeerAddress,
        service: &'a ServiceId,
    ) -> impl Future<Output = Result<DuplexStream, TransportError>> + Send + 'a {
        async move {
            let key = (peer.as_str().to_owned(), service.uuid());
            let endpoints = self.network.endpoints.lock();
            let Some(incoming) = endpoints.get(&key) else {
                return Err(TransportError::Unreachable(peer.clone()));
            };
            let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
            incoming
                .send((remote, self.name.clone()))
                .map_err(|_| TransportError::Unreachable(peer.clone()))?;
            Ok(local)
        }
    }

    fn cancel_discovery(&self) {
        self.discovery_cancels.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<(DuplexStream, PeerAddress)>,
    local: PeerAddress,
}

impl TransportListener for MemoryListener {
    type Stream = DuplexStream;

    fn local_addr(&self) -> PeerAddress {
        self.local.clone()
    }

    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<(DuplexStream, PeerAddress), TransportError>> + Send + '_ {
        async move { self.incoming.recv().await.ok_or(TransportError::Closed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::SERVICE_ID;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_reaches_listener() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        let mut listener = a.listen(&SERVICE_ID).await.unwrap();
        let mut out = b.dial(&a.address(), &SERVICE_ID).await.unwrap();
        let (mut inbound, from) = listener.accept().await.unwrap();
        assert_eq!(from.as_str(), "b");
        out.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn unknown_endpoint_is_unreachable() {
        let net = MemoryNetwork::new();
        let err = net
            .endpoint("b")
            .dial(&PeerAddress::from("nowhere"), &SERVICE_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn dropped_listener_frees_the_service() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let listener = a.listen(&SERVICE_ID).await.unwrap();
        assert!(matches!(
            a.listen(&SERVICE_ID).await,
            Err(TransportError::ServiceInUse(_))
        ));
        assert!(net.is_listening("a", &SERVICE_ID));
        drop(listener);
        assert!(!net.is_listening("a", &SERVICE_ID));
        assert!(net
            .endpoint("b")
            .dial(&a.address(), &SERVICE_ID)
            .await
            .is_err());
        assert!(a.listen(&SERVICE_ID).await.is_ok());
    }
}
