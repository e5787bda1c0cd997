//! TCP transport: a LAN socket stands in for the radio link.
//!
//! TCP has no service registry, so both ends exchange a service preamble (protocol version +
//! 16-byte service UUID) before the stream is handed over. The listener drops callers that
//! ask for another service and keeps waiting; the dialer treats a missing or mismatched
//! reply as a rejected handshake.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::debug;

use super::{DiscoveryControl, Transport, TransportError, TransportListener};
use crate::identity::PeerAddress;
use crate::protocol::PROTOCOL_VERSION;
use crate::service::ServiceId;

const PREAMBLE_SIZE: usize = 1 + 16; // version + service uuid
/// A caller that connects but never sends its preamble is dropped after this long.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct TcpTransport {
    bind_addr: SocketAddr,
    discovery: Option<Arc<dyn DiscoveryControl>>,
}

impl TcpTransport {
    /// Transport whose listening endpoint binds `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            discovery: None,
        }
    }

    /// Attach the discovery collaborator paused by `cancel_discovery`.
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryControl>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpServiceListener;

    fn listen<'a>(
        &'a self,
        service: &'a ServiceId,
    ) -> impl Future<Output = Result<TcpServiceListener, TransportError>> + Send + 'a {
        async move {
            let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    TransportError::ServiceInUse(self.bind_addr.to_string())
                } else {
                    TransportError::Io(e)
                }
            })?;
            Ok(TcpServiceListener {
                listener,
                service: *service,
                pending: JoinSet::new(),
            })
        }
    }

    fn dial<'a>(
        &'a self,
        peer: &'a PeerAddress,
        service: &'a ServiceId,
    ) -> impl Future<Output = Result<TcpStream, TransportError>> + Send + 'a {
        async move {
            let addrs: Vec<SocketAddr> = lookup_host(peer.as_str())
                .await
                .map_err(|_| TransportError::Unresolvable(peer.clone()))?
                .collect();
            if addrs.is_empty() {
                return Err(TransportError::Unresolvable(peer.clone()));
            }
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(mut stream) => {
                        stream.set_nodelay(true)?;
                        handshake_connect(&mut stream, service).await?;
                        return Ok(stream);
                    }
                    Err(e) => debug!(%addr, error = %e, "connect attempt failed"),
                }
            }
            Err(TransportError::Unreachable(peer.clone()))
        }
    }

    fn cancel_discovery(&self) {
        if let Some(discovery) = &self.discovery {
            discovery.cancel_discovery();
        }
    }
}

/// Listening TCP socket that only hands over callers for its service.
pub struct TcpServiceListener {
    listener: TcpListener,
    service: ServiceId,
    /// Callers still sending their preamble. Dropping the listener aborts them.
    pending: JoinSet<(Result<TcpStream, String>, SocketAddr)>,
}

impl TransportListener for TcpServiceListener {
    type Stream = TcpStream;

    fn local_addr(&self) -> PeerAddress {
        match self.listener.local_addr() {
            Ok(addr) => PeerAddress::from(addr),
            Err(_) => PeerAddress::new("unbound"),
        }
    }

    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<(TcpStream, PeerAddress), TransportError>> + Send + '_ {
        async move {
            loop {
                tokio::select! {
                    r = self.listener.accept() => {
                        let (stream, from) = r?;
                        self.pending.spawn(handshake_caller(stream, from, self.service));
                    }
                    Some(done) = self.pending.join_next() => match done {
                        Ok((Ok(stream), from)) => {
                            stream.set_nodelay(true)?;
                            return Ok((stream, PeerAddress::from(from)));
                        }
                        Ok((Err(reason), from)) => debug!(%from, %reason, "dropping caller"),
                        Err(e) => debug!(error = %e, "handshake task failed"),
                    },
                }
            }
        }
    }
}

/// Runs one caller's handshake off the accept loop so a silent caller cannot hold up others.
async fn handshake_caller(
    mut stream: TcpStream,
    from: SocketAddr,
    service: ServiceId,
) -> (Result<TcpStream, String>, SocketAddr) {
    let outcome =
        match tokio::time::timeout(PREAMBLE_TIMEOUT, handshake_accept(&mut stream, &service)).await
        {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("no service preamble".to_owned()),
        };
    (outcome, from)
}

fn preamble(service: &ServiceId) -> [u8; PREAMBLE_SIZE] {
    let mut out = [0u8; PREAMBLE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..].copy_from_slice(service.as_bytes());
    out
}

fn check_preamble(buf: &[u8; PREAMBLE_SIZE], service: &ServiceId) -> Result<(), TransportError> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(TransportError::HandshakeRejected(format!(
            "unsupported protocol version {}",
            buf[0]
        )));
    }
    if buf[1..] != service.as_bytes()[..] {
        return Err(TransportError::HandshakeRejected(
            "service mismatch".to_owned(),
        ));
    }
    Ok(())
}

async fn handshake_accept(stream: &mut TcpStream, service: &ServiceId) -> Result<(), TransportError> {
    let mut buf = [0u8; PREAMBLE_SIZE];
    stream.read_exact(&mut buf).await?;
    check_preamble(&buf, service)?;
    stream.write_all(&preamble(service)).await?;
    stream.flush().await?;
    Ok(())
}

async fn handshake_connect(stream: &mut TcpStream, service: &ServiceId) -> Result<(), TransportError> {
    stream.write_all(&preamble(service)).await?;
    stream.flush().await?;
    let mut buf = [0u8; PREAMBLE_SIZE];
    stream.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::HandshakeRejected("listener closed the stream".to_owned())
        } else {
            TransportError::Io(e)
        }
    })?;
    check_preamble(&buf, service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::SERVICE_ID;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn loopback() -> TcpTransport {
        TcpTransport::new("127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn dial_and_accept_exchange_bytes() {
        let server = loopback();
        let mut listener = server.listen(&SERVICE_ID).await.unwrap();
        let addr = listener.local_addr();
        let accept = tokio::spawn(async move { listener.accept().await });

        let mut client = loopback().dial(&addr, &SERVICE_ID).await.unwrap();
        let (mut accepted, from) = accept.await.unwrap().unwrap();
        assert!(from.as_str().starts_with("127.0.0.1:"));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn wrong_service_is_rejected_and_listener_keeps_waiting() {
        let other = ServiceId::new(Uuid::from_u128(1), "Other");
        let server = loopback();
        let mut listener = server.listen(&SERVICE_ID).await.unwrap();
        let addr = listener.local_addr();
        let accept = tokio::spawn(async move { listener.accept().await });

        let err = loopback().dial(&addr, &other).await.unwrap_err();
        assert!(matches!(err, TransportError::HandshakeRejected(_)));

        let _client = loopback().dial(&addr, &SERVICE_ID).await.unwrap();
        assert!(accept.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn silent_caller_does_not_hold_up_the_next_one() {
        let server = loopback();
        let mut listener = server.listen(&SERVICE_ID).await.unwrap();
        let addr = listener.local_addr();
        let accept = tokio::spawn(async move { listener.accept().await });

        let _silent = TcpStream::connect(addr.as_str()).await.unwrap();
        let _client = loopback().dial(&addr, &SERVICE_ID).await.unwrap();
        let accepted = tokio::time::timeout(PREAMBLE_TIMEOUT / 2, accept)
            .await
            .expect("accept waited on the silent caller")
            .unwrap();
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn unresolvable_address() {
        let peer = PeerAddress::from("unreachable-address");
        let err = loopback().dial(&peer, &SERVICE_ID).await.unwrap_err();
        assert!(matches!(err, TransportError::Unresolvable(_)));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let peer = PeerAddress::new(format!("127.0.0.1:{port}"));
        let err = loopback().dial(&peer, &SERVICE_ID).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn second_listen_on_same_port_is_in_use() {
        let first = loopback();
        let listener = first.listen(&SERVICE_ID).await.unwrap();
        let port: SocketAddr = listener.local_addr().as_str().parse().unwrap();
        let err = TcpTransport::new(port).listen(&SERVICE_ID).await;
        assert!(matches!(err, Err(TransportError::ServiceInUse(_))));
    }

    struct CountingDiscovery(AtomicUsize);

    impl DiscoveryControl for CountingDiscovery {
        fn cancel_discovery(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_discovery_reaches_collaborator() {
        let discovery = Arc::new(CountingDiscovery(AtomicUsize::new(0)));
        let transport = loopback().with_discovery(discovery.clone());
        transport.cancel_discovery();
        transport.cancel_discovery();
        assert_eq!(discovery.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn preamble_checks_version_and_service() {
        let mut p = preamble(&SERVICE_ID);
        assert!(check_preamble(&p, &SERVICE_ID).is_ok());
        p[0] = PROTOCOL_VERSION + 1;
        assert!(check_preamble(&p, &SERVICE_ID).is_err());
    }
}
