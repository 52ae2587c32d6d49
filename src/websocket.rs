//! # Experiment WebSocket Handler
//!
//! One WebSocket connection drives one experiment session. Clients connect to
//! `/ws/experiments/{session_id}` after creating the session over REST and then
//! exchange the JSON frames described in [`crate::protocol`].
//!
//! ## Ordering:
//! Messages of a session are handled strictly one at a time.
//! - The actor stops reading its inbound stream while a message is in flight
//!   (`ctx.wait`), so replies come back in request order.
//! - Each message also holds the session's entry in the shared lock registry, so a
//!   second connection to the same session queues behind the first. The lock is held
//!   until the computation returns, even if this connection closes in the meantime.
//!
//! The numeric pipeline runs on tokio's blocking pool; the actor's thread only parses
//! frames and writes replies.
//!
//! ## Liveness:
//! A ping goes out every [`HEARTBEAT_INTERVAL`]; a client silent for
//! [`CLIENT_TIMEOUT`] is disconnected.

use crate::error::AppError;
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::state::AppState;
use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often heartbeat pings are sent
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long before lack of client response causes a timeout
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra frame allowance on top of the base64-expanded audio limit, for the JSON
/// envelope and the distance trace.
const FRAME_OVERHEAD_BYTES: usize = 1024 * 1024;

/// A message split across continuation frames.
#[derive(Debug, Default)]
enum Fragments {
    #[default]
    Idle,
    Text(Vec<u8>),
    Binary,
}

/// A continuation sequence after its last frame arrived.
#[derive(Debug, PartialEq)]
enum Reassembled {
    Text(String),
    Binary,
    InvalidUtf8,
    /// A last frame with no first frame before it
    Orphan,
}

impl Fragments {
    /// Feed one continuation item; yields the message once its last frame is in.
    fn push(&mut self, item: Item) -> Option<Reassembled> {
        match item {
            Item::FirstText(data) => {
                *self = Fragments::Text(data.to_vec());
                None
            }
            Item::FirstBinary(_) => {
                *self = Fragments::Binary;
                None
            }
            Item::Continue(data) => {
                if let Fragments::Text(buffer) = self {
                    buffer.extend_from_slice(&data);
                }
                None
            }
            Item::Last(data) => Some(match std::mem::take(self) {
                Fragments::Text(mut buffer) => {
                    buffer.extend_from_slice(&data);
                    String::from_utf8(buffer)
                        .map(Reassembled::Text)
                        .unwrap_or(Reassembled::InvalidUtf8)
                }
                Fragments::Binary => Reassembled::Binary,
                Fragments::Idle => Reassembled::Orphan,
            }),
        }
    }
}

/// WebSocket actor bound to one experiment session.
pub struct ExperimentWebSocket {
    session_id: Uuid,
    state: AppState,
    last_heartbeat: Instant,
    fragments: Fragments,
}

impl ExperimentWebSocket {
    pub fn new(session_id: Uuid, state: AppState) -> Self {
        Self {
            session_id,
            state,
            last_heartbeat: Instant::now(),
            fragments: Fragments::default(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &OutboundMessage) {
        ctx.text(message.to_json());
    }

    /// Step reported on errors raised before the controller ran.
    fn current_step(&self) -> usize {
        self.state
            .store
            .load_session(self.session_id)
            .map(|s| s.current_step)
            .unwrap_or(0)
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Rejected inbound frame");
                let step = self.current_step();
                self.send(ctx, &OutboundMessage::error(&e, step));
                return;
            }
        };

        let kind = message.kind();
        debug!(session_id = %self.session_id, message_type = kind, "Handling message");

        let state = self.state.clone();
        let session_id = self.session_id;
        let work = async move {
            let controller = state.controller();
            let started = Instant::now();
            let outcome = state
                .session_locks
                .run_exclusive(session_id, move || controller.handle(session_id, message))
                .await;
            match outcome {
                Ok((replies, stats)) => {
                    state.record_message(stats);
                    debug!(
                        %session_id,
                        message_type = kind,
                        replies = replies.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Message handled"
                    );
                    replies
                }
                Err(e) => {
                    error!(%session_id, message_type = kind, error = %e, "Message handler panicked");
                    let err = AppError::Internal("Failed to process message".to_string());
                    vec![OutboundMessage::error(&err, 0)]
                }
            }
        };

        ctx.wait(work.into_actor(self).map(|replies, act, ctx| {
            for reply in &replies {
                act.send(ctx, reply);
            }
        }));
    }

    fn reject_binary(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let err = AppError::ValidationError("Binary frames are not supported, send JSON text".to_string());
        self.send(ctx, &OutboundMessage::error(&err, self.current_step()));
    }
}

impl Actor for ExperimentWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Experiment connection opened");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.release_session_slot();
        self.state.session_locks.release(self.session_id);
        info!(session_id = %self.session_id, "Experiment connection closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ExperimentWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                self.last_heartbeat = Instant::now();
                self.reject_binary(ctx);
            }
            Ok(ws::Message::Continuation(item)) => {
                self.last_heartbeat = Instant::now();
                match self.fragments.push(item) {
                    Some(Reassembled::Text(text)) => self.handle_text(&text, ctx),
                    Some(Reassembled::Binary) => self.reject_binary(ctx),
                    Some(Reassembled::InvalidUtf8) => {
                        let err = AppError::ValidationError("Text frame is not valid UTF-8".to_string());
                        self.send(ctx, &OutboundMessage::error(&err, self.current_step()));
                    }
                    Some(Reassembled::Orphan) => {
                        warn!(session_id = %self.session_id, "Continuation end without a start frame")
                    }
                    None => {}
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint: `GET /ws/experiments/{session_id}`.
///
/// The session must exist before the upgrade; an unknown id is answered with 404 and
/// no connection. When every connection slot is taken the client gets 503.
pub async fn experiment_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let session_id = path.into_inner();
    info!(
        %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New experiment WebSocket request"
    );

    state.store.load_session(session_id)?;

    if !state.try_acquire_session_slot() {
        warn!(%session_id, "Connection refused, session limit reached");
        return Ok(HttpResponse::ServiceUnavailable().json(json!({
            "error": {
                "type": "capacity",
                "message": "Maximum number of concurrent experiment sessions reached",
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })));
    }

    let max_audio_bytes = state.get_config().performance.max_audio_bytes;
    let frame_size = max_audio_bytes / 3 * 4 + FRAME_OVERHEAD_BYTES;
    let actor = ExperimentWebSocket::new(session_id, state.get_ref().clone());

    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(frame_size)
        .start()
        .map_err(|e| {
            // The actor never started, so its slot is returned here
            state.release_session_slot();
            e
        })
}
