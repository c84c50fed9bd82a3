//! Outbound port for the inference backend
//!
//! Both transports (direct HTTP and the broker link) implement this contract;
//! everything above it stays transport-agnostic.

use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{ActionCall, DialogTurn, GenerationParams, SessionKey};

/// A tool declaration the model may invoke
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name
    pub name: String,
    /// Description of what the tool does
    pub description: String,
    /// JSON Schema for the tool parameters
    pub parameters: serde_json::Value,
}

/// One generation request handed to a transport
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Session the request belongs to (carried on the broker wire; the
    /// direct transport does not need it for routing)
    pub session_key: SessionKey,
    /// Ordered dialog, system turn first
    pub messages: Vec<DialogTurn>,
    pub params: GenerationParams,
    /// Tool declarations to attach, if any
    pub tools: Option<Vec<ToolSpec>>,
}

impl TransportRequest {
    pub fn new(session_key: SessionKey, messages: Vec<DialogTurn>) -> Self {
        Self {
            session_key,
            messages,
            params: GenerationParams::default(),
            tools: None,
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// What a transport hands back for one request
#[derive(Debug, Clone)]
pub struct TransportReply {
    /// Free text from the model (may be empty when only actions are returned)
    pub text: String,
    /// Actions the model requested
    pub actions: Vec<ActionCall>,
}

/// Lazy, finite sequence of text increments from a streaming generation
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Errors a transport can produce
///
/// Timeouts are deliberately distinct from connection failures: a timeout is
/// final for its request, while a lost connection triggers reconnection and
/// only surfaces per-request once the request goes stale.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Common generate/stream contract over the two wire mechanisms
#[async_trait::async_trait]
pub trait TransportPort: Send + Sync {
    /// Run one generation to completion
    async fn generate(&self, request: TransportRequest) -> Result<TransportReply, TransportError>;

    /// Run one generation, yielding text increments as they arrive
    async fn generate_stream(&self, request: TransportRequest)
        -> Result<ReplyStream, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let key = SessionKey::new("maze", "p1");
        let request = TransportRequest::new(key.clone(), vec![DialogTurn::system("sys")])
            .with_params(GenerationParams {
                temperature: 0.2,
                top_p: 0.5,
                max_tokens: 64,
            })
            .with_tools(vec![ToolSpec {
                name: "break_wall".to_string(),
                description: "Break a wall".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }]);

        assert_eq!(request.session_key, key);
        assert_eq!(request.params.max_tokens, 64);
        assert_eq!(request.tools.as_ref().map(|t| t.len()), Some(1));
    }

    #[test]
    fn test_timeout_is_not_connection_lost() {
        let timeout = TransportError::Timeout(Duration::from_secs(120));
        assert!(matches!(timeout, TransportError::Timeout(_)));
        assert!(!matches!(timeout, TransportError::ConnectionLost(_)));
    }
}
