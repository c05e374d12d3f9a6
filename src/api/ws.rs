//! `GET /ws/portfolio/{user}` (§4.3): one subscription stream per user.

use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::interval;
use tracing::info;
use uuid::Uuid;

use super::state::ApiState;
use crate::auth::models::Claims;
use crate::streaming::{snapshot_frames, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
        #[serde(default)]
        timeframe: Option<String>,
    },
    Refresh,
    Ping,
    Pong,
}

pub async fn ws_portfolio(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Path(user_path): Path<Uuid>,
) -> Response {
    let Ok(claims_user) = Uuid::parse_str(&claims.sub) else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    if claims_user != user_path {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_path))
}

async fn handle_socket(socket: WebSocket, state: ApiState, user_id: Uuid) {
    let (session_id, queue) = state.streaming.register(user_id);
    info!(%session_id, %user_id, "websocket session opened");

    let (mut sender, mut receiver) = socket.split();
    for frame in snapshot_frames(&state.aggregation, &state.market_data, user_id, None).await {
        if let Ok(text) = serde_json::to_string(&frame) {
            if sender.send(Message::Text(text)).await.is_err() {
                state.streaming.unregister(session_id);
                return;
            }
        }
    }

    let mut last_pong = Instant::now();
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > HEARTBEAT_TIMEOUT {
                    info!(%session_id, "heartbeat timeout, closing session");
                    break;
                }
                if sender.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.is_err() {
                    break;
                }
            }
            frame = queue.recv() => {
                match frame {
                    Some(frame) => {
                        if let Ok(text) = serde_json::to_string(&frame) {
                            if sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Pong) => last_pong = Instant::now(),
                            Ok(ClientMessage::Ping) => {
                                if sender.send(Message::Text(r#"{"type":"pong"}"#.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Subscribe { topics, timeframe }) => {
                                info!(%session_id, ?topics, ?timeframe, "client (re)subscribed");
                                let frames = snapshot_frames(
                                    &state.aggregation,
                                    &state.market_data,
                                    user_id,
                                    timeframe.as_deref(),
                                )
                                .await;
                                for frame in frames {
                                    if let Ok(text) = serde_json::to_string(&frame) {
                                        if sender.send(Message::Text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Ok(ClientMessage::Refresh) => {
                                for frame in snapshot_frames(&state.aggregation, &state.market_data, user_id, None).await {
                                    if let Ok(text) = serde_json::to_string(&frame) {
                                        if sender.send(Message::Text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.streaming.unregister(session_id);
    info!(%session_id, %user_id, "websocket session closed");
}
