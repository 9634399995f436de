//! # Relay Session Manager
//!
//! Owns the table of active relay sessions and is the only way to open, route
//! to, or close one.
//!
//! ## Thread Safety:
//! The table is a `HashMap` behind one `std::sync::RwLock`. Inserts and removals
//! take the write lock, routing takes the read lock, and no lock is ever held
//! across an `.await`, so readers never observe a half-inserted or half-removed
//! entry. Sessions themselves share nothing; isolation between them is purely
//! structural (separate entries, separate tasks, separate channels).

use crate::config::{PersonaConfig, UpstreamConfig};
use crate::persona::{derive_instructions, normalize_topic};
use crate::relay::session::{drive_session, RelaySession, SessionSummary};
use crate::relay::upstream::{SessionSettings, UpstreamConnector};
use crate::relay::{ClientSink, ConnectionId, RelayFrame};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, trace, warn};

/// Connection id → session. The single source of truth for "is this connection active".
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<ConnectionId, Arc<RelaySession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning whatever was registered under the same id.
    fn insert(&self, session: Arc<RelaySession>) -> Option<Arc<RelaySession>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(session.connection_id(), session)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<RelaySession>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(connection_id).cloned()
    }

    fn remove(&self, connection_id: &ConnectionId) -> Option<Arc<RelaySession>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(connection_id)
    }

    /// Remove `session` only if it is still the entry registered for its id.
    pub(crate) fn remove_session(&self, session: &Arc<RelaySession>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&session.connection_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.connection_id());
                true
            }
            _ => false,
        }
    }

    fn drain(&self) -> Vec<Arc<RelaySession>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.values().map(|session| session.summary()).collect()
    }
}

/// Opens, routes and closes relay sessions.
///
/// ## Resource Management:
/// - One upstream channel and one tokio task per session
/// - Close is idempotent and runs on every exit path (client close, upstream
///   close, upstream failure)
/// - `close_all` tears everything down at shutdown
pub struct RelaySessionManager {
    table: Arc<SessionTable>,
    connector: Arc<dyn UpstreamConnector>,
    upstream: UpstreamConfig,
    persona: PersonaConfig,
}

impl RelaySessionManager {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        upstream: UpstreamConfig,
        persona: PersonaConfig,
    ) -> Self {
        Self {
            table: Arc::new(SessionTable::new()),
            connector,
            upstream,
            persona,
        }
    }

    /// Register a new session and start connecting it upstream.
    ///
    /// ## What this does:
    /// 1. Normalizes the topic and derives persona instructions
    /// 2. Inserts the session (state `Opening`) into the table
    /// 3. Spawns the session task, which connects, sends `session.update`, and
    ///    relays in both directions until either side closes
    ///
    /// Must be called from within a tokio runtime. Connect failures are not
    /// returned here; the task logs them, removes the session and closes the client.
    pub fn open(
        &self,
        connection_id: ConnectionId,
        topic: Option<String>,
        client: Arc<dyn ClientSink>,
    ) -> Arc<RelaySession> {
        let topic = normalize_topic(topic.as_deref());
        let instructions = derive_instructions(&self.persona, topic.as_deref());
        let settings = SessionSettings::new(&self.upstream, instructions.clone());

        let (session, commands) = RelaySession::new(connection_id, topic, instructions);
        if let Some(previous) = self.table.insert(session.clone()) {
            warn!(
                connection_id = %connection_id,
                "Replacing session with duplicate connection id"
            );
            previous.close();
        }

        info!(
            connection_id = %connection_id,
            topic = ?session.topic(),
            active_sessions = self.table.len(),
            "Relay session opening"
        );

        tokio::spawn(drive_session(
            session.clone(),
            commands,
            self.connector.clone(),
            settings,
            client,
            self.table.clone(),
        ));

        session
    }

    /// Forward a client frame to that connection's upstream channel.
    ///
    /// Returns `false` when no session exists for the id (already closed, never
    /// opened); the frame is dropped and nothing else happens.
    pub fn forward(&self, connection_id: &ConnectionId, frame: RelayFrame) -> bool {
        match self.table.get(connection_id) {
            Some(session) => session.forward(frame),
            None => {
                trace!(
                    connection_id = %connection_id,
                    bytes = frame.len(),
                    "Dropping frame for unknown connection"
                );
                false
            }
        }
    }

    /// Close a session: remove it from the table and close its upstream channel.
    ///
    /// Idempotent; returns `false` if nothing was registered for the id. When this
    /// returns the entry is gone and the session is `Closed`; the upstream socket
    /// close itself completes on the session task.
    pub fn close(&self, connection_id: &ConnectionId) -> bool {
        match self.table.remove(connection_id) {
            Some(session) => {
                session.close();
                info!(
                    connection_id = %connection_id,
                    active_sessions = self.table.len(),
                    "Relay session removed"
                );
                true
            }
            None => false,
        }
    }

    /// Close every session (graceful shutdown). Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let sessions = self.table.drain();
        for session in &sessions {
            session.close();
        }
        if !sessions.is_empty() {
            info!(closed = sessions.len(), "Closed all relay sessions");
        }
        sessions.len()
    }

    pub fn session(&self, connection_id: &ConnectionId) -> Option<Arc<RelaySession>> {
        self.table.get(connection_id)
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.table.contains(connection_id)
    }

    pub fn active_count(&self) -> usize {
        self.table.len()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.table.summaries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::AppError;
    use crate::relay::session::SessionState;
    use crate::relay::testing::{wait_until, FakeConnector, RecordingClient, StalledConnector};
    use std::time::Duration;

    fn manager(connector: Arc<FakeConnector>) -> RelaySessionManager {
        let config = AppConfig::default();
        RelaySessionManager::new(connector, config.upstream, config.persona)
    }

    fn instructions_of(frame: &RelayFrame) -> String {
        let RelayFrame::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["type"], "session.update");
        value["session"]["instructions"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_open_sends_session_update_with_topic() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(connector.clone());
        let id = ConnectionId::new();

        let session = manager.open(
            id,
            Some("coffee".to_string()),
            Arc::new(RecordingClient::default()),
        );
        assert!(manager.contains(&id));

        let mut link = connector.take_link(id).await;
        let instructions = instructions_of(&link.recv().await);
        assert!(instructions.contains("talk about \"coffee\""));
        wait_until(|| session.state() == SessionState::Active).await;
    }

    #[tokio::test]
    async fn test_open_without_topic_uses_generic_instructions() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(connector.clone());
        let id = ConnectionId::new();

        manager.open(id, Some(String::new()), Arc::new(RecordingClient::default()));
        let mut link = connector.take_link(id).await;
        let instructions = instructions_of(&link.recv().await);
        assert!(instructions.contains("Ask the user what topic"));
        assert!(!instructions.contains("talk about"));
    }

    #[tokio::test]
    async fn test_frames_sent_while_opening_follow_session_update_in_order() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(connector.clone());
        let id = ConnectionId::new();

        manager.open(id, None, Arc::new(RecordingClient::default()));
        assert!(manager.forward(&id, RelayFrame::Text("one".into())));
        assert!(manager.forward(&id, RelayFrame::Binary(vec![2, 2])));
        assert!(manager.forward(&id, RelayFrame::Text("three".into())));

        let mut link = connector.take_link(id).await;
        instructions_of(&link.recv().await);
        assert_eq!(link.recv().await, RelayFrame::Text("one".into()));
        assert_eq!(link.recv().await, RelayFrame::Binary(vec![2, 2]));
        assert_eq!(link.recv().await, RelayFrame::Text("three".into()));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(connector.clone());
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let client_a = Arc::new(RecordingClient::default());
        let client_b = Arc::new(RecordingClient::default());

        manager.open(a, Some("coffee".into()), client_a.clone());
        manager.open(b, Some("tea".into()), client_b.clone());
        let mut link_a = connector.take_link(a).await;
        let mut link_b = connector.take_link(b).await;
        assert!(instructions_of(&link_a.recv().await).contains("\"coffee\""));
        assert!(instructions_of(&link_b.recv().await).contains("\"tea\""));

        manager.forward(&a, RelayFrame::Text("for-a".into()));
        manager.forward(&b, RelayFrame::Text("for-b".into()));
        assert_eq!(link_a.recv().await, RelayFrame::Text("for-a".into()));
        assert_eq!(link_b.recv().await, RelayFrame::Text("for-b".into()));

        link_a.reply.send(Ok(RelayFrame::Text("reply-a-1".into()))).unwrap();
        link_a.reply.send(Ok(RelayFrame::Text("reply-a-2".into()))).unwrap();
        link_b.reply.send(Ok(RelayFrame::Binary(vec![0xB]))).unwrap();

        wait_until(|| client_a.frames.lock().unwrap().len() == 2).await;
        wait_until(|| client_b.frames.lock().unwrap().len() == 1).await;
        assert_eq!(
            *client_a.frames.lock().unwrap(),
            vec![RelayFrame::Text("reply-a-1".into()), RelayFrame::Text("reply-a-2".into())]
        );
        assert_eq!(*client_b.frames.lock().unwrap(), vec![RelayFrame::Binary(vec![0xB])]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(link_a.received.try_recv().is_err());
        assert!(link_b.received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_removes_entry_and_closes_upstream() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(connector.clone());
        let id = ConnectionId::new();
        let client = Arc::new(RecordingClient::default());

        let session = manager.open(id, None, client.clone());
        let mut link = connector.take_link(id).await;
        link.recv().await;

        assert!(manager.close(&id));
        assert!(!manager.contains(&id));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(manager.active_count(), 0);

        wait_until(|| link.is_closed()).await;
        assert!(!manager.close(&id));
        assert!(!manager.forward(&id, RelayFrame::Text("late".into())));
        // Client-initiated close is not echoed back to the client.
        assert!(client.closed.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_while_connecting_ends_session_task() {
        let config = AppConfig::default();
        let manager =
            RelaySessionManager::new(Arc::new(StalledConnector), config.upstream, config.persona);
        let id = ConnectionId::new();
        let client = Arc::new(RecordingClient::default());

        let session = manager.open(id, None, client.clone());
        assert!(manager.forward(&id, RelayFrame::Text("early".into())));
        assert!(manager.close(&id));

        // Only the test's handle remains once the task has given up connecting.
        wait_until(|| Arc::strong_count(&session) == 1).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(client.closed.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_connection_is_dropped_silently() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(connector.clone());
        let known = ConnectionId::new();
        manager.open(known, None, Arc::new(RecordingClient::default()));
        let mut link = connector.take_link(known).await;
        link.recv().await;

        assert!(!manager.forward(&ConnectionId::new(), RelayFrame::Text("stray".into())));
        assert!(!manager.close(&ConnectionId::new()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(link.received.try_recv().is_err());
        assert!(manager.contains(&known));
    }

    #[tokio::test]
    async fn test_connect_failure_closes_session_and_client() {
        let connector = Arc::new(FakeConnector { refuse: true, ..Default::default() });
        let manager = manager(connector);
        let id = ConnectionId::new();
        let client = Arc::new(RecordingClient::default());

        let session = manager.open(id, None, client.clone());
        wait_until(|| !manager.contains(&id)).await;

        assert_eq!(session.state(), SessionState::Closed);
        let reason = client.closed.lock().unwrap().clone().expect("client should be closed");
        assert!(reason.unwrap().contains("connection refused"));
        assert!(!manager.forward(&id, RelayFrame::Text("after failure".into())));
    }

    #[tokio::test]
    async fn test_upstream_error_tears_down_only_that_session() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(connector.clone());
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let client_a = Arc::new(RecordingClient::default());

        manager.open(a, None, client_a.clone());
        manager.open(b, None, Arc::new(RecordingClient::default()));
        let mut link_a = connector.take_link(a).await;
        let mut link_b = connector.take_link(b).await;
        link_a.recv().await;
        link_b.recv().await;

        link_a
            .reply
            .send(Err(AppError::UpstreamRuntime("socket reset".to_string())))
            .unwrap();

        wait_until(|| !manager.contains(&a)).await;
        assert!(manager.contains(&b));
        assert!(client_a.closed.lock().unwrap().is_some());

        manager.forward(&b, RelayFrame::Text("still here".into()));
        assert_eq!(link_b.recv().await, RelayFrame::Text("still here".into()));
    }

    #[tokio::test]
    async fn test_upstream_eof_closes_client() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(connector.clone());
        let id = ConnectionId::new();
        let client = Arc::new(RecordingClient::default());

        manager.open(id, None, client.clone());
        let mut link = connector.take_link(id).await;
        link.recv().await;
        drop(link.reply);

        wait_until(|| !manager.contains(&id)).await;
        let reason = client.closed.lock().unwrap().clone().expect("client should be closed");
        assert_eq!(reason.as_deref(), Some("upstream closed"));
    }

    #[tokio::test]
    async fn test_close_all() {
        let connector = Arc::new(FakeConnector::default());
        let manager = manager(connector);
        for _ in 0..3 {
            manager.open(ConnectionId::new(), None, Arc::new(RecordingClient::default()));
        }
        assert_eq!(manager.summaries().len(), 3);
        assert_eq!(manager.close_all(), 3);
        assert_eq!(manager.active_count(), 0);
    }
}
