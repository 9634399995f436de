//! # Relay WebSocket Handler
//!
//! Client-facing end of the realtime voice relay. Clients connect to
//! `/ws?topic=...` and every text or binary frame they send is forwarded verbatim
//! to their own upstream realtime session; everything upstream sends back is
//! written to the client unchanged.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Client connects with an optional `topic` query parameter
//! 2. **Session Open**: The actor registers a relay session; upstream connect and
//!    the `session.update` message happen in the session's own task
//! 3. **Relay**: Text and binary frames pass through in both directions
//! 4. **Close**: Either side closing tears down both sockets and the table entry
//!
//! ## Heartbeat:
//! The actor pings the client every `heartbeat_interval_secs` and stops it after
//! `client_timeout_secs` without a ping or pong from the client.

use crate::relay::{ClientSink, ConnectionId, RelayFrame, RelaySessionManager};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Close frames carry at most 123 bytes of reason text.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// One client connection.
///
/// ## Rust Concepts:
/// - **Actor**: actix runs each connection as an independent actor with its own mailbox
/// - **Arc<RelaySessionManager>**: all actors share the one session table
pub struct RelayWebSocket {
    connection_id: ConnectionId,
    topic: Option<String>,
    manager: Arc<RelaySessionManager>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl RelayWebSocket {
    pub fn new(
        manager: Arc<RelaySessionManager>,
        topic: Option<String>,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            topic,
            manager,
            heartbeat_interval,
            client_timeout,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn forward(&self, frame: RelayFrame) {
        // A miss means the session already closed; the actor is stopping anyway.
        if !self.manager.forward(&self.connection_id, frame) {
            debug!(
                connection_id = %self.connection_id,
                "Client frame dropped, no active session"
            );
        }
    }
}

/// An upstream frame to write to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamFrame(RelayFrame);

/// The upstream side is gone; close the client.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamClosed(Option<String>);

/// The relay talks to the actor only through its mailbox.
impl ClientSink for Addr<RelayWebSocket> {
    fn deliver(&self, frame: RelayFrame) {
        self.do_send(UpstreamFrame(frame));
    }

    fn close(&self, reason: Option<String>) {
        self.do_send(UpstreamClosed(reason));
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            connection_id = %self.connection_id,
            topic = ?self.topic,
            "WebSocket connection started"
        );

        let client: Arc<dyn ClientSink> = Arc::new(ctx.address());
        self.manager.open(self.connection_id, self.topic.take(), client);

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(
                    connection_id = %act.connection_id,
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Runs on every exit path, so the session is always removed here.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.manager.close(&self.connection_id);
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward(RelayFrame::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward(RelayFrame::Binary(data.to_vec()));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(
                    connection_id = %self.connection_id,
                    reason = ?reason,
                    "WebSocket closed by client"
                );
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Fragmented frames are reassembled by the codec before they get here.
                warn!(
                    connection_id = %self.connection_id,
                    "Received unexpected continuation frame"
                );
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(
                    connection_id = %self.connection_id,
                    error = %err,
                    "WebSocket protocol error"
                );
                ctx.stop();
            }
        }
    }
}

impl Handler<UpstreamFrame> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamFrame, ctx: &mut Self::Context) {
        match msg.0 {
            RelayFrame::Text(text) => ctx.text(text),
            RelayFrame::Binary(data) => ctx.binary(data),
        }
    }
}

impl Handler<UpstreamClosed> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamClosed, ctx: &mut Self::Context) {
        ctx.close(Some(close_reason(msg.0)));
        ctx.stop();
    }
}

/// Build the close frame sent when the upstream side ends the session.
fn close_reason(reason: Option<String>) -> ws::CloseReason {
    ws::CloseReason {
        code: ws::CloseCode::Away,
        description: reason.map(|text| truncate_utf8(text, MAX_CLOSE_REASON_BYTES)),
    }
}

fn truncate_utf8(mut text: String, max_bytes: usize) -> String {
    if text.len() > max_bytes {
        let mut end = max_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Pull the optional `topic` out of the upgrade request's query string.
fn topic_from_query(query_string: &str) -> Option<String> {
    web::Query::<HashMap<String, String>>::from_query(query_string)
        .ok()
        .and_then(|query| query.into_inner().remove("topic"))
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// This function handles the initial HTTP request and upgrades it to a WebSocket
/// connection. The relay itself is driven by the `RelayWebSocket` actor.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "New WebSocket connection request");

    let topic = topic_from_query(req.query_string());
    let server = &app_state.get_config().server;

    let websocket = RelayWebSocket::new(
        app_state.session_manager(),
        topic,
        Duration::from_secs(server.heartbeat_interval_secs),
        Duration::from_secs(server.client_timeout_secs),
    );

    ws::start(websocket, &req, stream)
}
