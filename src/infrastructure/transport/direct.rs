//! Direct HTTP transport
//!
//! Talks to an OpenAI-compatible `/chat/completions` endpoint. A semaphore
//! caps how many generations are on the wire at once; callers past the cap
//! wait for a permit rather than erroring.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};

use crate::application::ports::outbound::{
    ReplyStream, TransportError, TransportPort, TransportReply, TransportRequest,
};
use crate::domain::value_objects::ActionCall;
use crate::infrastructure::config::DirectConfig;

pub struct DirectTransport {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: std::time::Duration,
    limiter: Arc<Semaphore>,
    skip_thinking: bool,
}

impl DirectTransport {
    pub fn new(config: &DirectConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: config.timeout(),
            limiter: Arc::new(Semaphore::new(config.max_concurrent)),
            skip_thinking: config.skip_thinking,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, request: TransportRequest, stream: bool) -> ChatCompletionRequest {
        let messages = request
            .messages
            .into_iter()
            .map(|turn| WireMessage {
                role: turn.role.as_str().to_string(),
                content: turn.content,
            })
            .collect();
        let tools = request.tools.map(|tools| {
            tools
                .into_iter()
                .map(|tool| WireTool {
                    r#type: "function".to_string(),
                    function: WireToolFunction {
                        name: tool.name,
                        description: tool.description,
                        parameters: tool.parameters,
                    },
                })
                .collect()
        });

        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            max_tokens: request.params.max_tokens,
            tools,
            stream,
            enable_thinking: !self.skip_thinking,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if e.is_connect() {
            TransportError::ConnectionLost(e.to_string())
        } else {
            TransportError::Upstream(e.to_string())
        }
    }

    async fn post_completions(
        &self,
        body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .post(self.completions_url())
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::Upstream(format!(
                "backend returned {}: {}",
                status, detail
            )));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl TransportPort for DirectTransport {
    async fn generate(&self, request: TransportRequest) -> Result<TransportReply, TransportError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| TransportError::ConnectionLost("concurrency limiter closed".to_string()))?;

        let body = self.build_body(request, false);
        let response = self.post_completions(&body).await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        into_reply(completion)
    }

    async fn generate_stream(
        &self,
        request: TransportRequest,
    ) -> Result<ReplyStream, TransportError> {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::ConnectionLost("concurrency limiter closed".to_string()))?;

        let body = self.build_body(request, true);
        let response = self.post_completions(&body).await?;
        let mut bytes = response.bytes_stream();
        let timeout = self.timeout;

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Permit covers the whole transfer, not just the request send
            let _permit = permit;
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let mapped = if e.is_timeout() {
                            TransportError::Timeout(timeout)
                        } else {
                            TransportError::ConnectionLost(e.to_string())
                        };
                        let _ = tx.send(Err(mapped));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    match parse_sse_line(&line) {
                        Ok(Some(SseEvent::Delta(text))) => {
                            if !text.is_empty() && tx.send(Ok(text)).is_err() {
                                return;
                            }
                        }
                        Ok(Some(SseEvent::Done)) => return,
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(futures_util::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }
}

enum SseEvent {
    Delta(String),
    Done,
}

/// Decode one server-sent-events line; non-data lines yield nothing
fn parse_sse_line(line: &str) -> Result<Option<SseEvent>, TransportError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| TransportError::MalformedResponse(format!("bad stream chunk: {}", e)))?;
    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .unwrap_or_default();
    Ok(Some(SseEvent::Delta(delta)))
}

fn into_reply(completion: ChatCompletionResponse) -> Result<TransportReply, TransportError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::MalformedResponse("no choices in completion".to_string()))?;

    let mut actions = Vec::new();
    if let Some(calls) = choice.message.tool_calls {
        for call in calls {
            // Arguments arrive as a JSON string, not an object
            let arguments = serde_json::from_str(&call.function.arguments).map_err(|e| {
                TransportError::MalformedResponse(format!(
                    "tool call {} carried invalid arguments: {}",
                    call.function.name, e
                ))
            })?;
            actions.push(ActionCall {
                name: call.function.name,
                arguments,
            });
        }
    }

    Ok(TransportReply {
        text: choice.message.content.unwrap_or_default(),
        actions,
    })
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    stream: bool,
    enable_thinking: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: String,
    function: WireToolFunction,
}

#[derive(Debug, Serialize)]
struct WireToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireCallFunction,
}

#[derive(Debug, Deserialize)]
struct WireCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}
