//! Application services - Use case implementations
//!
//! This module contains the services that carry a client turn from admission
//! to completed response. Each service follows hexagonal architecture
//! principles: the transport is reached only through its outbound port, and
//! everything here stays wire-agnostic.

pub mod conversation_store;
pub mod inference_gateway;
pub mod rate_limiter;
pub mod relay_service;
pub mod request_queue;
pub mod response_fanout;
pub mod worker_pool;

// Re-export session state types
pub use conversation_store::{ConversationStore, DialogSession};

// Re-export gateway types
pub use inference_gateway::{maze_tool_specs, InferenceGateway};

// Re-export admission types
pub use rate_limiter::RateLimiter;
pub use request_queue::{
    QueuedRequest, RequestQueue, SubmitError, TurnResult, PRIORITY_HIGH, PRIORITY_NORMAL,
};

// Re-export delivery types
pub use response_fanout::{CachedHint, ResponseFanout};

// Re-export the facade and workers
pub use relay_service::{RelayService, ResponseTicket, SubmitOptions};
pub use worker_pool::WorkerPool;
