//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every worker thread hold the same session manager
//! - **Memory safety**: The manager is dropped when the last handle goes away
//! - **Immutability**: The configuration is fixed at startup, so handlers share
//!   it read-only without a lock
//!
//! ## What lives here:
//! - The configuration the server was started with
//! - The relay session manager (the one table of active sessions)
//! - The server start time, for uptime reporting

use crate::config::AppConfig;
use crate::relay::{RealtimeConnector, RelaySessionManager, UpstreamConnector};
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning copies the `Arc`s, never the data behind them
/// - **Instant**: A point in time (for measuring uptime)
#[derive(Clone)]
pub struct AppState {
    /// Application configuration, fixed at startup
    pub config: Arc<AppConfig>,

    /// Active relay sessions, shared by every WebSocket actor
    pub sessions: Arc<RelaySessionManager>,

    /// When the server started (never changes, so no lock needed)
    pub start_time: Instant,
}

impl AppState {
    /// Create state that relays to the hosted realtime service.
    pub fn new(config: AppConfig) -> Self {
        let connector = Arc::new(RealtimeConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    /// Create state with an explicit upstream connector.
    ///
    /// Used by tests to relay to an in-process fake instead of the network.
    pub fn with_connector(config: AppConfig, connector: Arc<dyn UpstreamConnector>) -> Self {
        let sessions = Arc::new(RelaySessionManager::new(
            connector,
            config.upstream.clone(),
            config.persona.clone(),
        ));

        Self {
            config: Arc::new(config),
            sessions,
            start_time: Instant::now(),
        }
    }

    /// The configuration the server was started with.
    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    /// Handle to the session manager for a new connection.
    pub fn session_manager(&self) -> Arc<RelaySessionManager> {
        self.sessions.clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
