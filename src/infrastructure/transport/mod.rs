//! Backend transports
//!
//! Two interchangeable wire mechanisms sit behind the transport port: a
//! direct HTTP client for an OpenAI-compatible endpoint, and a broker link
//! that decouples requests from replies via correlation ids. Which one runs
//! is a config decision made once at startup.

pub mod broker;
pub mod direct;
pub mod pending;
pub mod supervisor;
pub mod wire;

pub use broker::BrokerTransport;
pub use direct::DirectTransport;
pub use supervisor::{ConnectionSupervisor, LinkState};

use std::sync::Arc;

use crate::application::ports::outbound::{
    ReplyStream, TransportError, TransportPort, TransportReply, TransportRequest,
};
use crate::infrastructure::config::{AppConfig, TransportMode};

/// The wire mechanism selected by configuration
pub enum Transport {
    Direct(DirectTransport),
    Broker(BrokerTransport),
}

impl Transport {
    pub fn from_config(config: &AppConfig) -> Self {
        match config.transport.mode {
            TransportMode::Direct => {
                tracing::info!(
                    "Using direct HTTP transport against {}",
                    config.direct.base_url
                );
                Self::Direct(DirectTransport::new(&config.direct))
            }
            TransportMode::Broker => {
                tracing::info!("Using broker transport via {}", config.broker.addr);
                Self::Broker(BrokerTransport::connect(&config.broker))
            }
        }
    }

    /// Link supervisor, present only for the broker transport
    pub fn supervisor(&self) -> Option<Arc<ConnectionSupervisor>> {
        match self {
            Self::Direct(_) => None,
            Self::Broker(broker) => Some(broker.supervisor()),
        }
    }

    /// In-flight correlation map, present only for the broker transport
    pub fn pending_map(&self) -> Option<Arc<pending::PendingMap>> {
        match self {
            Self::Direct(_) => None,
            Self::Broker(broker) => Some(broker.pending_map()),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Broker(_) => "broker",
        }
    }
}

#[async_trait::async_trait]
impl TransportPort for Transport {
    async fn generate(&self, request: TransportRequest) -> Result<TransportReply, TransportError> {
        match self {
            Self::Direct(transport) => transport.generate(request).await,
            Self::Broker(transport) => transport.generate(request).await,
        }
    }

    async fn generate_stream(
        &self,
        request: TransportRequest,
    ) -> Result<ReplyStream, TransportError> {
        match self {
            Self::Direct(transport) => transport.generate_stream(request).await,
            Self::Broker(transport) => transport.generate_stream(request).await,
        }
    }
}
