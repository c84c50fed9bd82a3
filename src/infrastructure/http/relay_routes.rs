//! Relay API routes - turn submission, hint polling, session lifecycle

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::application::ports::outbound::TransportError;
use crate::application::services::{SubmitError, SubmitOptions, PRIORITY_NORMAL};
use crate::domain::value_objects::{
    ActionCall, GenerationParams, RequestId, SessionKey, TurnResponse,
};
use crate::infrastructure::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TurnRequestBody {
    pub namespace: String,
    pub session_id: String,
    pub message: String,
    /// Overrides the configured system prompt for new sessions
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub params: Option<GenerationParams>,
    #[serde(default)]
    pub use_tools: bool,
    /// History cap override; 0 means unlimited
    #[serde(default)]
    pub max_history_pairs: Option<usize>,
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct TurnResponseBody {
    pub request_id: RequestId,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionCall>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HintBody {
    pub has_response: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<TurnResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ClearBody {
    pub cleared: bool,
}

/// Submit one turn and wait for the completed response
pub async fn submit_turn(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TurnRequestBody>,
) -> Result<Json<TurnResponseBody>, (StatusCode, String)> {
    let key = SessionKey::new(body.namespace, body.session_id);
    let system_prompt = body
        .system_prompt
        .as_deref()
        .unwrap_or(&state.config.generation.system_prompt);
    let options = SubmitOptions {
        params: body
            .params
            .unwrap_or_else(|| state.config.generation.params()),
        use_tools: body.use_tools,
        max_history_pairs: match body.max_history_pairs {
            Some(0) => None,
            Some(pairs) => Some(pairs),
            None => state.config.session.history_pairs(),
        },
        priority: body.priority.unwrap_or(PRIORITY_NORMAL),
    };

    let ticket = state
        .relay
        .submit_turn(&key, system_prompt, &body.message, options)
        .await
        .map_err(submit_error_response)?;
    let request_id = ticket.request_id;
    let response = ticket.wait().await.map_err(submit_error_response)?;

    Ok(Json(TurnResponseBody {
        request_id,
        text: response.text,
        actions: response.actions,
        timestamp: response.timestamp,
    }))
}

/// Latest completed response for a session; repeated polls see the same hint
pub async fn poll_hint(
    State(state): State<Arc<AppState>>,
    Path((namespace, session_id)): Path<(String, String)>,
) -> Json<HintBody> {
    let key = SessionKey::new(namespace, session_id);
    match state.relay.poll(&key).await {
        Some(hint) => Json(HintBody {
            has_response: true,
            timestamp: Some(hint.timestamp),
            response: Some(hint.response),
        }),
        None => Json(HintBody {
            has_response: false,
            response: None,
            timestamp: None,
        }),
    }
}

/// Drop a session's history, rate window, and cached hint
pub async fn clear_session(
    State(state): State<Arc<AppState>>,
    Path((namespace, session_id)): Path<(String, String)>,
) -> Json<ClearBody> {
    let key = SessionKey::new(namespace, session_id);
    let cleared = state.relay.clear_session(&key).await;
    Json(ClearBody { cleared })
}

fn submit_error_response(e: SubmitError) -> (StatusCode, String) {
    let status = match &e {
        SubmitError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        SubmitError::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::Transport(TransportError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        SubmitError::Transport(_) => StatusCode::BAD_GATEWAY,
        SubmitError::ChannelClosed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}
