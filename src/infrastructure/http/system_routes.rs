//! Health and transport control routes

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::infrastructure::state::AppState;
use crate::infrastructure::transport::LinkState;

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub transport: &'static str,
    /// Broker link state; absent on the direct transport
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkState>,
    pub sessions: usize,
    pub queue_depth: usize,
}

/// Liveness plus a shallow look at load and the backend link
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthBody> {
    let link = state.link_supervisor.as_ref().map(|s| s.state());
    let status = match link {
        Some(LinkState::Degraded) => "degraded",
        _ => "ok",
    };
    Json(HealthBody {
        status,
        transport: state.transport_mode,
        link,
        sessions: state.relay.session_count().await,
        queue_depth: state.relay.queue_depth().await,
    })
}

#[derive(Debug, Serialize)]
pub struct ResetBody {
    pub link: LinkState,
}

/// Re-arm a degraded broker link so the connect loop starts over
pub async fn reset_transport(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ResetBody>, (StatusCode, String)> {
    let Some(supervisor) = state.link_supervisor.as_ref() else {
        return Err((
            StatusCode::BAD_REQUEST,
            "direct transport has no broker link to reset".to_string(),
        ));
    };
    supervisor.reset();
    Ok(Json(ResetBody {
        link: supervisor.state(),
    }))
}
