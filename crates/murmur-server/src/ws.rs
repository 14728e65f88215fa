//! WebSocket transport.
//!
//! `GET /ws?userId=<id>` upgrades to a socket carrying JSON frames
//! `{"event": ..., "data": ...}`. Each socket becomes one presence handle
//! with its own bounded outbound queue; inbound frames are dispatched in
//! receipt order. When either direction ends the handle is disconnected.

use std::fmt;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use murmur_shared::protocol::{ClientEvent, ServerEvent};
use murmur_shared::types::{ConnectionId, UserId};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::AppState;
use crate::error::ServerError;
use crate::router::EventRouter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    user_id: UserId,
}

/// The identity is checked before the upgrade is attempted, so an unknown
/// user gets a 404 instead of a socket.
pub async fn ws_handler(
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ServerError> {
    let user = params.user_id;
    if !state.db.lock().await.user_exists(user)? {
        return Err(ServerError::NotFound("User not found".to_string()));
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let router = state.router.clone();
    let buffer = state.config.outbound_buffer;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, router, user, buffer)))
}

async fn handle_socket(socket: WebSocket, router: EventRouter, user: UserId, buffer: usize) {
    let (ws_sender, ws_receiver) = socket.split();
    serve_connection(ws_sender, ws_receiver, router, user, buffer).await;
}

/// Drive one connection until either direction ends, then disconnect it.
async fn serve_connection<K, S, E>(
    mut ws_sender: K,
    mut ws_receiver: S,
    router: EventRouter,
    user: UserId,
    buffer: usize,
) where
    K: Sink<Message> + Unpin,
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(buffer);
    let id = ConnectionId::new();

    info!(user = %user, connection = %id, "WebSocket connected");
    router.connect(user, id, tx).await;

    let sender_task = async move {
        while let Some(event) = rx.recv().await {
            let json = match event.to_json() {
                Ok(j) => j,
                Err(e) => {
                    error!(event = event.name(), error = %e, "Failed to encode event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    let input_task = async {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => match ClientEvent::from_json(&text) {
                    Ok(event) => router.dispatch(id, event).await,
                    Err(e) => warn!(connection = %id, error = %e, "Ignoring malformed frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(connection = %id, error = %e, "WebSocket read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(connection = %id, "Sender task ended"),
        _ = input_task => debug!(connection = %id, "Input task ended"),
    }

    router.disconnect(id).await;
    info!(user = %user, connection = %id, "WebSocket disconnected");
}
