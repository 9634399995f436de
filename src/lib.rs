//! # Voice Relay Backend
//!
//! A realtime voice relay: browser or CLI clients stream microphone audio over a
//! WebSocket, the server bridges each connection to its own session on a hosted
//! realtime speech service, and spoken replies stream back the same way.
//!
//! ## Layout:
//! - **audio**: client-side capture buffering and sequential playback
//! - **relay**: server-side session table, per-session upstream tasks
//! - **websocket / health**: the actix-web surface
//! - **config / error / state / persona**: ambient plumbing shared by both binaries

pub mod audio;      // Capture bufferer, playback sequencer, PCM helpers
pub mod config;     // Configuration management (config.rs)
pub mod error;      // Error handling types (error.rs)
pub mod health;     // Health and session listing endpoints (health.rs)
pub mod persona;    // Assistant instructions from the conversation topic
pub mod relay;      // Session manager and upstream connectors
pub mod state;      // Application state management (state.rs)
pub mod websocket;  // Client-facing relay WebSocket actor

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use state::AppState;
