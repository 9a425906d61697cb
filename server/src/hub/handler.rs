//! WebSocket endpoint: `GET /ws`.
//!
//! The bearer token comes from the `Authorization` header or the `token`
//! query parameter. Rejected connections are upgraded and immediately closed
//! with a close code, so browsers see the reason.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection::{CloseReason, Connection, SendOutcome};
use super::protocol::{ClientFrame, ServerFrame};
use super::registry::SubscriptionHub;
use super::throttle::ControlThrottle;
use crate::api::AppState;
use crate::auth::{bearer_token, AuthError, AuthUser};
use crate::ratelimit::{RateLimitCategory, RateLimitError};

/// Close code for authentication failures.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code when the connect rate limit or its store says no.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Grace period for the writer to flush the close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let user = match authenticate(&headers, query.token.as_deref(), &state.config.jwt_secret) {
        Ok(user) => user,
        Err(e) => {
            warn!(error = %e, "WebSocket authentication failed");
            return ws.on_upgrade(|socket| reject(socket, CLOSE_POLICY_VIOLATION, "authentication failed"));
        }
    };

    let user_key = user.user_id.to_string();
    match state
        .rate_limiter
        .admit(RateLimitCategory::WsConnect, &user_key)
        .await
    {
        Ok(_) => {}
        Err(RateLimitError::LimitExceeded(_)) => {
            return ws.on_upgrade(|socket| reject(socket, CLOSE_TRY_AGAIN_LATER, "rate limited"));
        }
        Err(RateLimitError::StoreUnavailable(_)) => {
            return ws.on_upgrade(|socket| reject(socket, CLOSE_TRY_AGAIN_LATER, "unavailable"));
        }
    }

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| run_connection(socket, hub, user))
}

/// Resolve the caller from the header, falling back to the query token.
pub fn authenticate(
    headers: &HeaderMap,
    query_token: Option<&str>,
    secret: &str,
) -> Result<AuthUser, AuthError> {
    let token = match bearer_token(headers)? {
        Some(token) => token,
        None => query_token.ok_or(AuthError::MissingAuthHeader)?,
    };
    AuthUser::from_token(token, secret)
}

async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn run_connection(socket: WebSocket, hub: SubscriptionHub, user: AuthUser) {
    let (conn, mut rx) = hub.register(user.tenant_id, user.user_id);
    let (mut sender, mut receiver) = socket.split();

    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = writer_conn.closed() => {
                    let reason = writer_conn.close_reason();
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: reason.close_code(),
                            reason: reason.as_str().into(),
                        })))
                        .await;
                    break;
                }
                message = rx.recv() => match message {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    reply(
        &hub,
        &conn,
        &ServerFrame::Ready {
            connection_id: conn.id,
            tenant_id: conn.tenant_id,
            user_id: conn.user_id,
        },
    );
    hub.activate(&conn);

    let reason = read_loop(&hub, &conn, &mut receiver).await;
    hub.close(&conn, reason);

    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
        debug!(connection_id = %conn.id, "Writer did not flush close frame in time");
    }
}

/// Read frames until the peer leaves, goes idle, or the hub closes us.
async fn read_loop(
    hub: &SubscriptionHub,
    conn: &Connection,
    receiver: &mut SplitStream<WebSocket>,
) -> CloseReason {
    let idle_timeout = hub.config().idle_timeout;
    let mut throttle = ControlThrottle::new(hub.config().control_limit, hub.config().control_window);

    loop {
        let next = tokio::select! {
            () = conn.closed() => return conn.close_reason(),
            next = tokio::time::timeout(idle_timeout, receiver.next()) => next,
        };

        let message = match next {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::ClientClosed,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %conn.id, error = %e, "WebSocket transport error");
                return CloseReason::TransportError;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => handle_control(hub, conn, &mut throttle, text.as_str()).await,
            Message::Binary(_) => reply(
                hub,
                conn,
                &ServerFrame::error("invalid_frame", "binary frames are not supported", None),
            ),
            Message::Close(_) => return CloseReason::ClientClosed,
            // Ping/pong only refresh the idle timer.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn handle_control(
    hub: &SubscriptionHub,
    conn: &Connection,
    throttle: &mut ControlThrottle,
    text: &str,
) {
    if !throttle.allow(Instant::now()) {
        reply(
            hub,
            conn,
            &ServerFrame::error("rate_limited", "too many control frames", None),
        );
        return;
    }

    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(_) => {
            reply(
                hub,
                conn,
                &ServerFrame::error("invalid_frame", "expected {type, channel}", None),
            );
            return;
        }
    };

    let response = match frame {
        ClientFrame::Ping => ServerFrame::Pong,
        ClientFrame::Subscribe { channel } => match hub.subscribe(conn, &channel).await {
            Ok(subscribed) => ServerFrame::Subscribed {
                channel: subscribed.to_string(),
            },
            Err(e) => ServerFrame::error(e.code(), e.to_string(), Some(channel)),
        },
        ClientFrame::Unsubscribe { channel } => match hub.unsubscribe(conn, &channel) {
            Ok(removed) => ServerFrame::Unsubscribed {
                channel: removed.to_string(),
            },
            Err(e) => ServerFrame::error(e.code(), e.to_string(), Some(channel)),
        },
    };
    reply(hub, conn, &response);
}

fn reply(hub: &SubscriptionHub, conn: &Connection, frame: &ServerFrame) {
    if conn.try_send(frame.to_json()) == SendOutcome::Overflow {
        hub.close(conn, CloseReason::SlowConsumer);
    }
}
