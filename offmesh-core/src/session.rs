//! Stream session: owns one established stream, pumps reads into events, serializes writes.
//!
//! The read loop starts as soon as the session is created and runs until the stream fails,
//! the remote closes it, or the manager cancels the session. A manager-requested cancel is
//! silent; any other ending reports exactly one `Disconnected`. Write failures close the
//! session the same way read failures do.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::event::{ConnectionEvent, EventForwarder, Origin};
use crate::identity::PeerAddress;
use crate::transport::BoxStream;

/// Process-unique session number, assigned at promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closed,
}

pub struct StreamSession {
    id: SessionId,
    origin: Origin,
    peer: PeerAddress,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxStream>>>,
    cancel: CancellationToken,
    /// Set by `cancel()`: the owner asked for the close, so no `Disconnected`.
    silent: AtomicBool,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    events: EventForwarder,
    write_timeout: Option<Duration>,
}

impl StreamSession {
    /// Take ownership of `stream` and start the read loop. `on_closed` runs once, after the
    /// stream is released, whatever ended the session.
    ///
    /// Must be called within a Tokio runtime.
    pub(crate) fn spawn<F>(
        id: SessionId,
        origin: Origin,
        peer: PeerAddress,
        stream: BoxStream,
        events: EventForwarder,
        config: &ManagerConfig,
        on_closed: F,
    ) -> Arc<Self>
    where
        F: FnOnce(SessionId) + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let session = Arc::new(Self {
            id,
            origin,
            peer,
            writer: tokio::sync::Mutex::new(Some(writer)),
            cancel: CancellationToken::new(),
            silent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            events,
            write_timeout: config.write_timeout,
        });
        tokio::spawn(session.clone().read_loop(
            reader,
            config.read_buffer_size,
            config.read_idle_timeout,
            on_closed,
        ));
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::SeqCst) {
            SessionState::Closed
        } else {
            SessionState::Active
        }
    }

    /// Write the whole payload, then report `DataSent`. On failure the session closes and
    /// reports `Disconnected`; nothing is returned to the caller.
    pub async fn write(&self, bytes: &[u8]) {
        if self.cancel.is_cancelled() {
            debug!(session = %self.id, "write on closed session ignored");
            return;
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!(session = %self.id, "write on closed session ignored");
            return;
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            r = write_payload(writer, bytes, self.write_timeout) => r,
        };
        drop(guard);
        match result {
            Ok(()) => self.events.emit(ConnectionEvent::DataSent {
                payload: bytes.to_vec(),
            }),
            Err(e) => {
                warn!(session = %self.id, peer = %self.peer, error = %e, "write failed; closing session");
                self.close_with_reason(format!("write failed: {e}"));
            }
        }
    }

    /// Close the stream without reporting `Disconnected`. Idempotent.
    pub fn cancel(&self) {
        self.silent.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn close_with_reason(&self, reason: String) {
        self.close_reason.lock().get_or_insert(reason);
        self.cancel.cancel();
    }

    async fn read_loop<F>(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxStream>,
        buffer_size: usize,
        idle_timeout: Option<Duration>,
        on_closed: F,
    ) where
        F: FnOnce(SessionId),
    {
        debug!(session = %self.id, peer = %self.peer, "read loop started");
        let mut buf = vec![0u8; buffer_size];
        let reason = loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    break self
                        .close_reason
                        .lock()
                        .take()
                        .unwrap_or_else(|| "session cancelled".to_owned());
                }
                r = read_chunk(&mut reader, &mut buf, idle_timeout) => r,
            };
            match read {
                Ok(0) => break "remote closed the stream".to_owned(),
                Ok(n) => self.events.emit(ConnectionEvent::DataReceived {
                    payload: buf[..n].to_vec(),
                    length: n,
                }),
                Err(e) => break format!("read failed: {e}"),
            }
        };

        self.closed.store(true, Ordering::SeqCst);
        // Unblock any writer, then release both halves so the stream closes.
        self.cancel.cancel();
        drop(reader);
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(session = %self.id, error = %e, "shutdown on close failed");
            }
        }
        on_closed(self.id);

        if self.silent.load(Ordering::SeqCst) {
            debug!(session = %self.id, peer = %self.peer, "session cancelled");
        } else {
            info!(session = %self.id, peer = %self.peer, %reason, "session ended");
            self.events.emit(ConnectionEvent::Disconnected {
                peer: self.peer.clone(),
                reason,
            });
        }
    }
}

async fn read_chunk(
    reader: &mut ReadHalf<BoxStream>,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize> {
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("nothing received for {limit:?}"),
            )),
        },
        None => reader.read(buf).await,
    }
}

async fn write_payload(
    writer: &mut WriteHalf<BoxStream>,
    bytes: &[u8],
    limit: Option<Duration>,
) -> io::Result<()> {
    let write = async {
        writer.write_all(bytes).await?;
        writer.flush().await
    };
    match limit {
        Some(limit) => match tokio::time::timeout(limit, write).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {limit:?}"),
            )),
        },
        None => write.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    fn session_over_pipe(
        config: &ManagerConfig,
    ) -> (
        Arc<StreamSession>,
        DuplexStream,
        mpsc::UnboundedReceiver<ConnectionEvent>,
        mpsc::UnboundedReceiver<SessionId>,
    ) {
        let (local, remote) = tokio::io::duplex(4096);
        let events = EventForwarder::new();
        let (tx, rx) = mpsc::unbounded_channel();
        events.set(Some(tx));
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let session = StreamSession::spawn(
            SessionId(1),
            Origin::Inbound,
            PeerAddress::from("remote"),
            Box::new(local),
            events,
            config,
            move |id| {
                let _ = closed_tx.send(id);
            },
        );
        (session, remote, rx, closed_rx)
    }

    #[tokio::test]
    async fn reads_become_events_in_order() {
        let (_session, mut remote, mut events, _) = session_over_pipe(&ManagerConfig::default());
        remote.write_all(b"one").await.unwrap();
        let first = events.recv().await.unwrap();
        remote.write_all(b"two").await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(
            first,
            ConnectionEvent::DataReceived {
                payload: b"one".to_vec(),
                length: 3
            }
        );
        assert_eq!(
            second,
            ConnectionEvent::DataReceived {
                payload: b"two".to_vec(),
                length: 3
            }
        );
    }

    #[tokio::test]
    async fn reads_are_capped_at_buffer_size() {
        let config = ManagerConfig::default().with_read_buffer_size(4);
        let (_session, mut remote, mut events, _) = session_over_pipe(&config);
        remote.write_all(b"abcdefghij").await.unwrap();
        let mut got = Vec::new();
        while got.len() < 10 {
            match events.recv().await.unwrap() {
                ConnectionEvent::DataReceived { payload, length } => {
                    assert!(length <= 4);
                    assert_eq!(payload.len(), length);
                    got.extend_from_slice(&payload);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, b"abcdefghij");
    }

    #[tokio::test]
    async fn write_reports_data_sent() {
        let (session, mut remote, mut events, _) = session_over_pipe(&ManagerConfig::default());
        session.write(b"hello").await;
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::DataSent {
                payload: b"hello".to_vec()
            }
        );
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn remote_close_reports_disconnected_once() {
        let (session, remote, mut events, mut closed) =
            session_over_pipe(&ManagerConfig::default());
        drop(remote);
        assert_eq!(closed.recv().await, Some(SessionId(1)));
        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected { peer, .. } => assert_eq!(peer.as_str(), "remote"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Closed);
        session.cancel();
        session.write(b"late").await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_is_silent_and_idempotent() {
        let (session, mut remote, mut events, mut closed) =
            session_over_pipe(&ManagerConfig::default());
        session.cancel();
        session.cancel();
        assert_eq!(closed.recv().await, Some(SessionId(1)));
        // The stream is released: the remote sees EOF.
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
        session.write(b"after").await;
        assert!(events.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn write_failure_closes_session() {
        let (session, remote, mut events, mut closed) =
            session_over_pipe(&ManagerConfig::default());
        drop(remote);
        session.write(b"into the void").await;
        // Whichever side notices first, the session ends with exactly one Disconnected.
        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(closed.recv().await, Some(SessionId(1)));
        session.write(b"again").await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_session() {
        let config = ManagerConfig::default().with_read_idle_timeout(Duration::from_secs(30));
        let (_session, _remote, mut events, _) = session_over_pipe(&config);
        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected { reason, .. } => assert!(reason.contains("read failed")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
