//! Sampling parameters and the per-turn response shape

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dialog::ActionCall;

/// Sampling parameters forwarded to the inference backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            top_p: 0.9,
            max_tokens: 512,
        }
    }
}

/// The assistant's reply for one processed turn
///
/// Carries free text and/or the actions the model requested. The timestamp is
/// when the reply was committed to the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionCall>,
    pub timestamp: DateTime<Utc>,
}

impl TurnResponse {
    pub fn new(text: impl Into<String>, actions: Vec<ActionCall>) -> Self {
        Self {
            text: text.into(),
            actions,
            timestamp: Utc::now(),
        }
    }

    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = GenerationParams::default();
        assert_eq!(params.temperature, 0.6);
        assert_eq!(params.top_p, 0.9);
        assert_eq!(params.max_tokens, 512);
    }

    #[test]
    fn test_response_with_actions() {
        let response = TurnResponse::new(
            "heading north",
            vec![ActionCall {
                name: "move_player".to_string(),
                arguments: serde_json::json!({"direction": "north"}),
            }],
        );
        assert!(response.has_actions());
        assert_eq!(response.text, "heading north");
    }
}
