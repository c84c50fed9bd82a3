//! Inference gateway - dialog assembly around the transport
//!
//! The gateway is the single place where a user turn becomes a transport
//! call. It owns the read-modify-write cycle on a session:
//!
//! - Fetch or create the session (system prompt attaches at creation only)
//! - Append the user turn and enforce the history bound
//! - Send the full dialog to the inference backend
//! - Append the assistant turn on success, enforcing the bound again
//!
//! The session lock is held across the whole cycle, so one session is never
//! mid-generation on two workers at once. A failed generation leaves the
//! user turn in place; retrying the same message resends it with history.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::application::ports::outbound::{
    ReplyStream, ToolSpec, TransportError, TransportPort, TransportRequest,
};
use crate::application::services::ConversationStore;
use crate::domain::value_objects::{
    DialogTurn, GenerationParams, SessionKey, TurnResponse,
};

/// Tool catalog for the maze game clients. Attached to a transport call when
/// the submitter asks for tools; returned action requests pass through to the
/// client uninterpreted.
pub fn maze_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "break_wall".to_string(),
            description: "Break a wall at the specified coordinates to create a path. Use sparingly - limited breaks available.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "x": {"type": "integer", "description": "X coordinate of the wall to break"},
                    "y": {"type": "integer", "description": "Y coordinate of the wall to break"}
                },
                "required": ["x", "y"]
            }),
        },
        ToolSpec {
            name: "break_walls".to_string(),
            description: "Break multiple walls at once. Each wall is specified as [x, y] coordinates.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "walls": {
                        "type": "array",
                        "items": {
                            "type": "array",
                            "items": {"type": "integer"},
                            "minItems": 2,
                            "maxItems": 2
                        },
                        "description": "Array of [x, y] coordinates of walls to break"
                    }
                },
                "required": ["walls"]
            }),
        },
        ToolSpec {
            name: "speed_boost".to_string(),
            description: "Give the player a temporary speed boost for faster movement".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "duration_ms": {"type": "integer", "description": "Duration of speed boost in milliseconds", "default": 1500}
                }
            }),
        },
        ToolSpec {
            name: "slow_germs".to_string(),
            description: "Slow down germs (enemies) temporarily".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "duration_ms": {"type": "integer", "description": "Duration of slow effect in milliseconds", "default": 3000}
                }
            }),
        },
        ToolSpec {
            name: "freeze_germs".to_string(),
            description: "Freeze germs (enemies) completely for a duration".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "duration_ms": {"type": "integer", "description": "Duration of freeze effect in milliseconds", "default": 3500}
                }
            }),
        },
        ToolSpec {
            name: "teleport_player".to_string(),
            description: "Teleport the player to a specific location on the map".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "x": {"type": "integer", "description": "X coordinate to teleport to"},
                    "y": {"type": "integer", "description": "Y coordinate to teleport to"}
                },
                "required": ["x", "y"]
            }),
        },
        ToolSpec {
            name: "spawn_oxygen".to_string(),
            description: "Spawn oxygen pellets at specified locations for the player to collect".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "locations": {
                        "type": "array",
                        "items": {
                            "type": "array",
                            "items": {"type": "integer"},
                            "minItems": 2,
                            "maxItems": 2
                        },
                        "description": "Array of [x, y] coordinates where oxygen should spawn"
                    }
                },
                "required": ["locations"]
            }),
        },
        ToolSpec {
            name: "move_exit".to_string(),
            description: "Move the exit/goal location to a new position".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "x": {"type": "integer", "description": "New X coordinate for exit"},
                    "y": {"type": "integer", "description": "New Y coordinate for exit"}
                },
                "required": ["x", "y"]
            }),
        },
        ToolSpec {
            name: "highlight_zone".to_string(),
            description: "Highlight a zone/area on the map to draw attention".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "cells": {
                        "type": "array",
                        "items": {
                            "type": "array",
                            "items": {"type": "integer"},
                            "minItems": 2,
                            "maxItems": 2
                        },
                        "description": "Array of [x, y] coordinates to highlight"
                    },
                    "duration_ms": {"type": "integer", "description": "How long to highlight in milliseconds", "default": 5000}
                }
            }),
        },
        ToolSpec {
            name: "reveal_map".to_string(),
            description: "Toggle map reveal to show/hide the entire map layout".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "enabled": {"type": "boolean", "description": "Whether to reveal the map"}
                },
                "required": ["enabled"]
            }),
        },
    ]
}

/// Combines the conversation store with an inference transport
pub struct InferenceGateway<T: TransportPort> {
    store: Arc<ConversationStore>,
    transport: T,
}

impl<T: TransportPort> InferenceGateway<T> {
    pub fn new(store: Arc<ConversationStore>, transport: T) -> Self {
        Self { store, transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run one full turn: record the user message, generate, record the
    /// assistant reply. On failure the user turn stays recorded and the
    /// error propagates to the caller.
    pub async fn process(
        &self,
        key: &SessionKey,
        system_prompt: &str,
        user_message: &str,
        params: GenerationParams,
        use_tools: bool,
        max_history_pairs: Option<usize>,
    ) -> Result<TurnResponse, TransportError> {
        let session = self.store.get_or_create(key, system_prompt).await;
        let mut session = session.lock().await;

        session.append_and_trim(DialogTurn::user(user_message), max_history_pairs);

        let mut request =
            TransportRequest::new(key.clone(), session.dialog().to_vec()).with_params(params);
        if use_tools {
            request = request.with_tools(maze_tool_specs());
        }

        match self.transport.generate(request).await {
            Ok(reply) => {
                let response = TurnResponse::new(reply.text, reply.actions);
                // A dangling user turn from an earlier failed generation can
                // leave the window full, so the commit trims too
                session.append_and_trim(
                    DialogTurn::assistant(&response.text, response.actions.clone()),
                    max_history_pairs,
                );
                tracing::debug!(
                    "Completed turn for session {} ({} turns in window)",
                    key,
                    session.non_system_len()
                );
                Ok(response)
            }
            Err(e) => {
                tracing::error!("Generation failed for session {}: {}", key, e);
                Err(e)
            }
        }
    }

    /// Streaming variant of [`process`](Self::process). Text chunks are
    /// forwarded as they arrive; the accumulated assistant turn is committed
    /// to the session only when the upstream stream completes cleanly. An
    /// abandoned or failed stream leaves just the user turn recorded.
    pub async fn process_stream(
        &self,
        key: &SessionKey,
        system_prompt: &str,
        user_message: &str,
        params: GenerationParams,
        max_history_pairs: Option<usize>,
    ) -> Result<ReplyStream, TransportError> {
        let session = self.store.get_or_create(key, system_prompt).await;
        let mut guard = session.clone().lock_owned().await;

        guard.append_and_trim(DialogTurn::user(user_message), max_history_pairs);

        let request =
            TransportRequest::new(key.clone(), guard.dialog().to_vec()).with_params(params);
        let mut upstream = self.transport.generate_stream(request).await?;

        let key = key.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut assistant_text = String::new();
            let mut completed = true;

            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(text) => {
                        assistant_text.push_str(&text);
                        if tx.send(Ok(text)).is_err() {
                            // Consumer went away mid-stream
                            completed = false;
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Stream failed for session {}: {}", key, e);
                        let _ = tx.send(Err(e));
                        completed = false;
                        break;
                    }
                }
            }

            if completed {
                guard.append_and_trim(
                    DialogTurn::assistant(assistant_text, Vec::new()),
                    max_history_pairs,
                );
                tracing::debug!("Committed streamed turn for session {}", key);
            }
        });

        Ok(Box::pin(futures_util::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }
}
