use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let manager = state.session_manager();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-relay-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "relay": {
            "active_sessions": manager.active_count(),
            "upstream": {
                "url": config.upstream.url,
                "model": config.upstream.model,
                "voice": config.upstream.voice,
                "api_key_configured": std::env::var(&config.upstream.api_key_env).is_ok()
            }
        }
    }))
}

pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let mut sessions = state.session_manager().summaries();
    sessions.sort_by_key(|session| session.created_at);

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_sessions": sessions.len(),
        "sessions": sessions
    }))
}
