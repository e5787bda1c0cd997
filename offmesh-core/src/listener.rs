//! Inbound listener: opens one listening endpoint for the service and accepts exactly one caller.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{ConnectionEvent, Origin};
use crate::manager::Hub;
use crate::service::SERVICE_ID;
use crate::transport::{Transport, TransportListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Listening,
    /// One caller accepted and promoted. The endpoint is closed.
    Accepted,
    Failed,
    Cancelled,
}

impl ListenerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ListenerState::Accepted | ListenerState::Failed | ListenerState::Cancelled
        )
    }
}

pub struct InboundListener {
    cancel: CancellationToken,
    state: Arc<Mutex<ListenerState>>,
}

impl InboundListener {
    /// Start listening in a background task. Must be called within a Tokio runtime.
    pub(crate) fn spawn<T: Transport>(transport: Arc<T>, hub: Hub) -> Self {
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(ListenerState::Created));
        tokio::spawn(run(transport, hub, cancel.clone(), state.clone()));
        Self { cancel, state }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Close the endpoint, unblocking a pending accept. Silent and idempotent.
    pub fn cancel(&self) {
        if advance(&self.state, ListenerState::Cancelled) {
            debug!("listener cancelled");
        }
        self.cancel.cancel();
    }
}

/// Move to `next` unless already terminal. Returns whether the move happened.
fn advance(state: &Mutex<ListenerState>, next: ListenerState) -> bool {
    let mut current = state.lock();
    if current.is_terminal() {
        return false;
    }
    *current = next;
    true
}

async fn run<T: Transport>(
    transport: Arc<T>,
    hub: Hub,
    cancel: CancellationToken,
    state: Arc<Mutex<ListenerState>>,
) {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = transport.listen(&SERVICE_ID) => r,
    };
    let mut endpoint = match opened {
        Ok(endpoint) => endpoint,
        Err(e) => {
            if advance(&state, ListenerState::Failed) {
                warn!(service = %SERVICE_ID, error = %e, "cannot open listening endpoint");
                hub.events().emit(ConnectionEvent::ConnectionFailed {
                    origin: Origin::Inbound,
                    reason: e.to_string(),
                });
            }
            return;
        }
    };
    if !advance(&state, ListenerState::Listening) {
        return;
    }
    info!(service = %SERVICE_ID, local = %endpoint.local_addr(), "listening");

    let accepted = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = endpoint.accept() => r,
    };
    // One caller per listener: the endpoint closes whatever the outcome.
    drop(endpoint);
    match accepted {
        Ok((stream, peer)) => {
            info!(%peer, "accepted inbound connection");
            if hub
                .promote(&cancel, Origin::Inbound, peer, Box::new(stream))
                .is_some()
            {
                *state.lock() = ListenerState::Accepted;
            } else {
                advance(&state, ListenerState::Cancelled);
            }
        }
        Err(e) => {
            if advance(&state, ListenerState::Failed) {
                warn!(error = %e, "accept failed");
                hub.events().emit(ConnectionEvent::ConnectionFailed {
                    origin: Origin::Inbound,
                    reason: e.to_string(),
                });
            }
        }
    }
}
