//! WebSocket handler for session clients
//!
//! One socket serves one session. Completed responses published for the
//! session are pushed as they land, and the client may run streamed turns
//! that bypass the queue and deliver text increments as `turn_delta` frames.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::application::ports::outbound::ReplyStream;
use crate::application::services::{SubmitOptions, PRIORITY_NORMAL};
use crate::domain::value_objects::{GenerationParams, SessionKey, TurnResponse};
use crate::infrastructure::state::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((namespace, session_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let key = SessionKey::new(namespace, session_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, key))
}

/// Handle an individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, key: SessionKey) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending frames to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    tracing::info!("WebSocket attached to session {}", key);

    // Forward frames from the channel to the socket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&frame) {
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Push every completed response for this session as it lands
    let mut fanout_rx = state.relay.subscribe(&key).await;
    let push_tx = tx.clone();
    let push_task = tokio::spawn(async move {
        while let Some(response) = fanout_rx.recv().await {
            if push_tx.send(ServerFrame::Turn { response }).is_err() {
                break;
            }
        }
    });

    // Handle incoming frames
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => handle_frame(frame, &state, &key, tx.clone()).await,
                Err(e) => {
                    tracing::warn!("Failed to parse frame from {}: {}", key, e);
                    let error = ServerFrame::Error {
                        message: format!("invalid frame: {}", e),
                    };
                    if tx.send(error).is_err() {
                        break;
                    }
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by client for session {}", key);
                break;
            }
            Err(e) => {
                tracing::warn!("WebSocket error for session {}: {}", key, e);
                break;
            }
            // Ping/Pong is answered by the protocol layer
            _ => {}
        }
    }

    push_task.abort();
    send_task.abort();

    tracing::info!("WebSocket detached from session {}", key);
}

async fn handle_frame(
    frame: ClientFrame,
    state: &Arc<AppState>,
    key: &SessionKey,
    tx: mpsc::UnboundedSender<ServerFrame>,
) {
    match frame {
        ClientFrame::SubmitStream {
            message,
            system_prompt,
            params,
        } => {
            let system_prompt = system_prompt
                .unwrap_or_else(|| state.config.generation.system_prompt.clone());
            let options = SubmitOptions {
                params: params.unwrap_or_else(|| state.config.generation.params()),
                use_tools: false,
                max_history_pairs: state.config.session.history_pairs(),
                priority: PRIORITY_NORMAL,
            };

            match state
                .relay
                .submit_stream(key, &system_prompt, &message, options)
                .await
            {
                Ok(stream) => {
                    // Forward increments without blocking the read loop
                    tokio::spawn(forward_stream(stream, tx));
                }
                Err(e) => {
                    let _ = tx.send(ServerFrame::Error {
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Relay one streamed turn: every increment, then the assembled text
async fn forward_stream(mut stream: ReplyStream, tx: mpsc::UnboundedSender<ServerFrame>) {
    let mut assembled = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(text) => {
                assembled.push_str(&text);
                if tx.send(ServerFrame::TurnDelta { text }).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(ServerFrame::Error {
                    message: e.to_string(),
                });
                return;
            }
        }
    }
    let _ = tx.send(ServerFrame::TurnComplete { text: assembled });
}

/// Frames from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Run one turn with incremental delivery
    SubmitStream {
        message: String,
        #[serde(default)]
        system_prompt: Option<String>,
        #[serde(default)]
        params: Option<GenerationParams>,
    },
}

/// Frames from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A completed response published for this session
    Turn { response: TurnResponse },
    /// One text increment of a streamed turn
    TurnDelta { text: String },
    /// A streamed turn finished; carries the assembled text
    TurnComplete { text: String },
    Error { message: String },
}
