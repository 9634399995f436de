//! # Relay Session
//!
//! Per-connection state bridging one client channel to one upstream channel.
//!
//! ## Session Lifecycle:
//! 1. **Opening**: registered in the table, upstream connect in flight. Client
//!    frames are already accepted and queued on the session's outbound channel.
//! 2. **Active**: `session.update` has been sent; queued and new client frames
//!    flow upstream, upstream frames flow to the client as they arrive.
//! 3. **Closed**: upstream closed (or never opened) and the table entry removed.
//!
//! ## Task Model:
//! Each session owns one tokio task ([`drive_session`]) that performs all upstream
//! I/O for that session. A slow upstream only ever stalls its own task.

use crate::error::AppError;
use crate::relay::manager::SessionTable;
use crate::relay::upstream::{SessionSettings, UpstreamConnector};
use crate::relay::{ClientSink, ConnectionId, RelayFrame};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Current state of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Opening,
    Active,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Opening => "opening",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }
}

/// Work for the session task, in client send order.
#[derive(Debug)]
pub(crate) enum UpstreamCommand {
    Frame(RelayFrame),
    Close,
}

/// Server-side record for one client connection.
///
/// Nothing in here is shared with any other session; the only shared structure
/// is the [`SessionTable`] that maps ids to these records.
pub struct RelaySession {
    connection_id: ConnectionId,
    topic: Option<String>,
    instructions: String,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    outbound: mpsc::UnboundedSender<UpstreamCommand>,
    frames_to_upstream: AtomicU64,
    frames_to_client: AtomicU64,
}

/// Snapshot served by `/api/v1/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub connection_id: ConnectionId,
    pub topic: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub frames_to_upstream: u64,
    pub frames_to_client: u64,
}

impl RelaySession {
    pub(crate) fn new(
        connection_id: ConnectionId,
        topic: Option<String>,
        instructions: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamCommand>) {
        let (outbound, commands) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            connection_id,
            topic,
            instructions,
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Opening),
            outbound,
            frames_to_upstream: AtomicU64::new(0),
            frames_to_client: AtomicU64::new(0),
        });
        (session, commands)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            connection_id: self.connection_id,
            topic: self.topic.clone(),
            state: self.state(),
            created_at: self.created_at,
            frames_to_upstream: self.frames_to_upstream.load(Ordering::Relaxed),
            frames_to_client: self.frames_to_client.load(Ordering::Relaxed),
        }
    }

    /// Queue a client frame for upstream. `false` once the session is closed.
    ///
    /// The state read guard is held across the send so a frame can never be
    /// queued behind the `Close` command.
    pub(crate) fn forward(&self, frame: RelayFrame) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Closed {
            return false;
        }
        let sent = self.outbound.send(UpstreamCommand::Frame(frame)).is_ok();
        if sent {
            self.frames_to_upstream.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Opening → Active. Returns `false` if the session was closed meanwhile.
    fn mark_active(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Opening {
            *state = SessionState::Active;
            true
        } else {
            false
        }
    }

    /// Move to Closed and ask the session task to close upstream.
    ///
    /// Idempotent: returns `false` if the session was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Closed {
            return false;
        }
        *state = SessionState::Closed;
        // The task may already be gone after an upstream failure.
        let _ = self.outbound.send(UpstreamCommand::Close);
        true
    }

    fn record_to_client(&self) {
        self.frames_to_client.fetch_add(1, Ordering::Relaxed);
    }
}

/// Why a session task ended.
#[derive(Debug)]
enum SessionExit {
    /// Client side closed; upstream was closed in response
    ClientClosed,
    /// Upstream ended the conversation cleanly
    UpstreamClosed,
    /// Upstream could not be reached or failed mid-session
    UpstreamFailed(AppError),
}

/// All upstream I/O for one session.
///
/// Every exit path leaves the session Closed, removed from the table, and (for
/// upstream-initiated exits) the client told to close.
pub(crate) async fn drive_session(
    session: Arc<RelaySession>,
    mut commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    connector: Arc<dyn UpstreamConnector>,
    settings: SessionSettings,
    client: Arc<dyn ClientSink>,
    table: Arc<SessionTable>,
) {
    let connection_id = session.connection_id();

    // Client frames that arrive while connecting, in send order.
    let mut pending = VecDeque::new();
    let mut connect = connector.connect(&connection_id);
    let channel = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(channel) => break channel,
                Err(err) => {
                    finish(&session, &table, client.as_ref(), SessionExit::UpstreamFailed(err));
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(UpstreamCommand::Frame(frame)) => pending.push_back(frame),
                Some(UpstreamCommand::Close) | None => {
                    debug!(connection_id = %connection_id, "Client left before upstream connected");
                    finish(&session, &table, client.as_ref(), SessionExit::ClientClosed);
                    return;
                }
            },
        }
    };
    drop(connect);
    let (mut sink, mut stream) = (channel.sink, channel.stream);

    // Client left while we were connecting.
    if session.state() == SessionState::Closed {
        let _ = sink.close().await;
        finish(&session, &table, client.as_ref(), SessionExit::ClientClosed);
        return;
    }

    let mut sent = match settings.to_frame() {
        Ok(frame) => sink.send(frame).await,
        Err(err) => Err(err),
    };
    while sent.is_ok() {
        let Some(frame) = pending.pop_front() else {
            break;
        };
        sent = sink.send(frame).await;
    }
    if let Err(err) = sent {
        finish(&session, &table, client.as_ref(), SessionExit::UpstreamFailed(err));
        return;
    }

    if session.mark_active() {
        info!(
            connection_id = %connection_id,
            connector = %connector.name(),
            topic = ?session.topic(),
            "Relay session active"
        );
    }

    let exit = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(UpstreamCommand::Frame(frame)) => {
                    if let Err(err) = sink.send(frame).await {
                        break SessionExit::UpstreamFailed(err);
                    }
                }
                Some(UpstreamCommand::Close) | None => {
                    if let Err(err) = sink.close().await {
                        debug!(
                            connection_id = %connection_id,
                            error = %err,
                            "Upstream close failed"
                        );
                    }
                    break SessionExit::ClientClosed;
                }
            },
            message = stream.next() => match message {
                Some(Ok(frame)) => {
                    session.record_to_client();
                    client.deliver(frame);
                }
                Some(Err(err)) => break SessionExit::UpstreamFailed(to_runtime(err)),
                None => break SessionExit::UpstreamClosed,
            },
        }
    };

    if !matches!(exit, SessionExit::ClientClosed) {
        // Best effort: the socket may already be gone.
        let _ = sink.close().await;
    }
    finish(&session, &table, client.as_ref(), exit);
}

/// Once active, any upstream failure is a runtime failure.
fn to_runtime(err: AppError) -> AppError {
    match err {
        AppError::UpstreamConnect(msg) => AppError::UpstreamRuntime(msg),
        other => other,
    }
}

fn finish(
    session: &Arc<RelaySession>,
    table: &SessionTable,
    client: &dyn ClientSink,
    exit: SessionExit,
) {
    let connection_id = session.connection_id();
    session.close();
    table.remove_session(session);

    match exit {
        SessionExit::ClientClosed => {
            info!(connection_id = %connection_id, "Relay session closed by client");
        }
        SessionExit::UpstreamClosed => {
            warn!(connection_id = %connection_id, "Upstream closed the session");
            client.close(Some("upstream closed".to_string()));
        }
        SessionExit::UpstreamFailed(err) => {
            error!(
                connection_id = %connection_id,
                error_kind = err.kind(),
                error = %err,
                "Relay session failed"
            );
            client.close(Some(err.to_string()));
        }
    }
}
