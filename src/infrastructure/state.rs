//! Shared application state

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::application::services::{
    ConversationStore, InferenceGateway, RateLimiter, RelayService, RequestQueue, ResponseFanout,
    WorkerPool,
};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::transport::pending::PendingMap;
use crate::infrastructure::transport::{ConnectionSupervisor, Transport};

/// Shared application state
pub struct AppState {
    pub config: AppConfig,
    pub relay: Arc<RelayService<Transport>>,
    /// Which wire mechanism is live, for health reporting
    pub transport_mode: &'static str,
    /// Present only when the broker transport is live
    pub link_supervisor: Option<Arc<ConnectionSupervisor>>,
    /// Broker in-flight map, read by the periodic stats task
    pub broker_pending: Option<Arc<PendingMap>>,
    workers: WorkerPool<Transport>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        // The transport moves into the gateway, so take the health handles first
        let transport = Transport::from_config(&config);
        let transport_mode = transport.mode_name();
        let link_supervisor = transport.supervisor();
        let broker_pending = transport.pending_map();

        let store = Arc::new(ConversationStore::new(config.session.max_sessions));
        let queue = Arc::new(RequestQueue::new(config.queue.capacity));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.window(),
            config.rate_limit.max_requests,
        ));
        let fanout = Arc::new(ResponseFanout::new());

        let gateway = Arc::new(InferenceGateway::new(Arc::clone(&store), transport));
        let relay = Arc::new(RelayService::new(
            store,
            Arc::clone(&queue),
            limiter,
            Arc::clone(&fanout),
            Arc::clone(&gateway),
        ));
        let workers = WorkerPool::new(queue, gateway, fanout, config.queue.workers);

        Self {
            config,
            relay,
            transport_mode,
            link_supervisor,
            broker_pending,
            workers,
        }
    }

    /// Start the queue workers; handles are aborted on shutdown
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        self.workers.spawn()
    }
}
