//! Infrastructure layer - external adapters and implementations
//!
//! This layer contains:
//! - Transport: the two inference backend adapters (direct HTTP, broker link)
//! - HTTP: REST API routes
//! - WebSocket: push delivery and streamed turns
//! - Config: application configuration
//! - State: shared application state

pub mod config;
pub mod http;
pub mod state;
pub mod transport;
pub mod websocket;
