//! Transport seam: where listening endpoints and outbound streams come from.
//!
//! The manager only needs three things from the link layer: a listening endpoint registered
//! under a [`ServiceId`], a dialer that opens a stream to a [`PeerAddress`] for that service,
//! and a way to stop peer discovery (discovery and dialing share the radio).
//! [`tcp::TcpTransport`] runs over a LAN; [`memory::MemoryTransport`] runs in-process.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::PeerAddress;
use crate::service::ServiceId;

pub mod memory;
pub mod tcp;

/// A duplex, ordered, reliable byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

/// Type-erased stream owned by a session.
pub type BoxStream = Box<dyn AsyncStream>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot resolve peer address {0}")]
    Unresolvable(PeerAddress),
    #[error("peer {0} is unreachable")]
    Unreachable(PeerAddress),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("service {0} is already registered on this endpoint")]
    ServiceInUse(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("endpoint closed")]
    Closed,
}

/// Listening endpoint for one service. Dropping it closes the endpoint.
pub trait TransportListener: Send + 'static {
    type Stream: AsyncStream;

    /// Address this endpoint is reachable at, as peers would dial it.
    fn local_addr(&self) -> PeerAddress;

    /// Wait for the next caller for this service. Returns the stream and the caller's address.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<(Self::Stream, PeerAddress), TransportError>> + Send + '_;
}

pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncStream;
    type Listener: TransportListener<Stream = Self::Stream>;

    /// Open a listening endpoint registered under `service`.
    fn listen<'a>(
        &'a self,
        service: &'a ServiceId,
    ) -> impl Future<Output = Result<Self::Listener, TransportError>> + Send + 'a;

    /// Open a stream to `peer` for `service`. Resolves once the transport handshake completes.
    fn dial<'a>(
        &'a self,
        peer: &'a PeerAddress,
        service: &'a ServiceId,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send + 'a;

    /// Stop any in-progress peer discovery. Called before every dial.
    fn cancel_discovery(&self);
}

/// Hook into an external discovery collaborator.
pub trait DiscoveryControl: Send + Sync {
    fn cancel_discovery(&self);
}
