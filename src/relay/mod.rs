//! # Realtime Relay
//!
//! Bridges each client WebSocket to its own upstream realtime-service socket.
//!
//! ## Key Components:
//! - **RelaySessionManager**: owns the session table, routes frames, guarantees cleanup
//! - **RelaySession**: per-connection state (`Opening → Active → Closed`)
//! - **UpstreamConnector**: opens upstream channels (tokio-tungstenite in production)
//!
//! ## Forwarding Rules:
//! - Frames are opaque text or binary and are never parsed or rewritten
//! - The only payload the relay builds itself is the initial `session.update`
//! - Client frames for unknown connection ids are dropped silently
//! - Ordering holds per session and per direction, never across sessions

pub mod manager;    // SessionTable + RelaySessionManager
pub mod session;    // RelaySession state and the per-session upstream task
pub mod upstream;   // Upstream connector trait, realtime connector, control message

#[cfg(test)]
pub(crate) mod testing;

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

pub use manager::{RelaySessionManager, SessionTable};
pub use session::{RelaySession, SessionState, SessionSummary};
pub use upstream::{RealtimeConnector, SessionSettings, UpstreamChannel, UpstreamConnector};

/// Identity of one client channel, stable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One opaque WebSocket payload travelling through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl RelayFrame {
    pub fn len(&self) -> usize {
        match self {
            RelayFrame::Text(text) => text.len(),
            RelayFrame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The client side of a session, as seen by the relay.
///
/// Implemented by the WebSocket actor's address in production; both methods
/// must return immediately.
pub trait ClientSink: Send + Sync {
    /// Deliver an upstream frame to the client verbatim.
    fn deliver(&self, frame: RelayFrame);

    /// Tell the client its relay is gone (upstream failed or closed).
    fn close(&self, reason: Option<String>);
}
