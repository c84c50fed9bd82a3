//! Broker wire format
//!
//! Traffic on the broker link is newline-delimited JSON. Each line is one
//! [`Envelope`]: the channel it was published on plus a tagged frame. The
//! relay publishes `request` frames on the request channel and consumes
//! `reply`/`error` frames from the reply channel; `ping`/`pong` carry
//! liveness probes in both directions.

use serde::{Deserialize, Serialize};

use crate::application::ports::outbound::ToolSpec;
use crate::domain::value_objects::{
    ActionCall, CorrelationId, DialogTurn, GenerationParams, SessionKey,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub frame: Frame,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, frame: Frame) -> Self {
        Self {
            channel: channel.into(),
            frame,
        }
    }

    /// Serialize to one wire line (no trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// One generation request from the relay
    Request {
        correlation_id: CorrelationId,
        session_key: SessionKey,
        messages: Vec<DialogTurn>,
        params: GenerationParams,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tools: Option<Vec<ToolSpec>>,
    },
    /// Completed generation from the backend
    Reply {
        correlation_id: CorrelationId,
        text: String,
        #[serde(default)]
        actions: Vec<ActionCall>,
    },
    /// Failed generation from the backend
    Error {
        correlation_id: CorrelationId,
        message: String,
    },
    Ping,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let id = CorrelationId::new();
        let envelope = Envelope::new(
            "llm/request",
            Frame::Request {
                correlation_id: id,
                session_key: SessionKey::new("maze", "p1"),
                messages: vec![DialogTurn::system("sys"), DialogTurn::user("hi")],
                params: GenerationParams::default(),
                tools: None,
            },
        );

        let line = envelope.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains(r#""type":"request""#));
        // Absent tools stay off the wire entirely
        assert!(!line.contains("tools"));

        let decoded = Envelope::from_line(&line).unwrap();
        assert_eq!(decoded.channel, "llm/request");
        match decoded.frame {
            Frame::Request {
                correlation_id,
                messages,
                ..
            } => {
                assert_eq!(correlation_id, id);
                assert_eq!(messages.len(), 2);
            }
            other => panic!("expected request frame, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_without_actions_decodes() {
        let id = CorrelationId::new();
        let line = format!(
            r#"{{"channel":"llm/reply","frame":{{"type":"reply","correlation_id":"{}","text":"go north"}}}}"#,
            id
        );

        let envelope = Envelope::from_line(&line).unwrap();
        match envelope.frame {
            Frame::Reply { text, actions, .. } => {
                assert_eq!(text, "go north");
                assert!(actions.is_empty());
            }
            other => panic!("expected reply frame, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_is_just_a_type_tag() {
        let envelope = Envelope::new("llm/request", Frame::Ping);
        let line = envelope.to_line().unwrap();
        assert_eq!(line, r#"{"channel":"llm/request","frame":{"type":"ping"}}"#);
    }

    #[test]
    fn test_unknown_frame_type_is_an_error() {
        let line = r#"{"channel":"llm/reply","frame":{"type":"announce"}}"#;
        assert!(Envelope::from_line(line).is_err());
    }

    #[test]
    fn test_garbage_line_is_an_error() {
        assert!(Envelope::from_line("not json at all").is_err());
    }
}
