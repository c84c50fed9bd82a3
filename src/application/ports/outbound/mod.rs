//! Outbound ports - Interfaces that the application requires from external systems

mod transport_port;

pub use transport_port::{
    ReplyStream, ToolSpec, TransportError, TransportPort, TransportReply, TransportRequest,
};
