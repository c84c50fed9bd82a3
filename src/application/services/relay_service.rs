//! Relay service - the single entry point for client-facing turn traffic
//!
//! Every ingress surface (HTTP, WebSocket) goes through here. The relay
//! checks the rate limit, admits the request onto the queue, and hands the
//! caller a ticket to await. It also owns the periodic upkeep pass that
//! evicts idle sessions and purges dead queue entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::application::ports::outbound::{ReplyStream, TransportPort};
use crate::application::services::{
    CachedHint, ConversationStore, InferenceGateway, QueuedRequest, RateLimiter, RequestQueue,
    ResponseFanout, SubmitError, TurnResult, PRIORITY_NORMAL,
};
use crate::domain::value_objects::{GenerationParams, RequestId, SessionKey, TurnResponse};

/// Per-submission knobs, merged from request fields and configured defaults
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub params: GenerationParams,
    pub use_tools: bool,
    pub max_history_pairs: Option<usize>,
    pub priority: u8,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            params: GenerationParams::default(),
            use_tools: false,
            max_history_pairs: Some(3),
            priority: PRIORITY_NORMAL,
        }
    }
}

/// Claim on a submitted request. Dropping the ticket abandons the request;
/// if it has not started yet, a worker will skip it entirely.
pub struct ResponseTicket {
    pub request_id: RequestId,
    receiver: oneshot::Receiver<TurnResult>,
}

impl ResponseTicket {
    /// Wait for the outcome of the request
    pub async fn wait(self) -> TurnResult {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::ChannelClosed),
        }
    }
}

pub struct RelayService<T: TransportPort> {
    store: Arc<ConversationStore>,
    queue: Arc<RequestQueue>,
    limiter: Arc<RateLimiter>,
    fanout: Arc<ResponseFanout>,
    gateway: Arc<InferenceGateway<T>>,
}

impl<T: TransportPort> RelayService<T> {
    pub fn new(
        store: Arc<ConversationStore>,
        queue: Arc<RequestQueue>,
        limiter: Arc<RateLimiter>,
        fanout: Arc<ResponseFanout>,
        gateway: Arc<InferenceGateway<T>>,
    ) -> Self {
        Self {
            store,
            queue,
            limiter,
            fanout,
            gateway,
        }
    }

    /// Submit one turn for background processing. Fails immediately when the
    /// session is over its rate limit or the queue is full; otherwise returns
    /// a ticket the caller can await or drop.
    pub async fn submit_turn(
        &self,
        key: &SessionKey,
        system_prompt: &str,
        user_message: &str,
        options: SubmitOptions,
    ) -> Result<ResponseTicket, SubmitError> {
        if !self.limiter.admit(key).await {
            return Err(SubmitError::RateLimited);
        }

        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest::new(key.clone(), system_prompt, user_message, tx)
            .with_params(options.params)
            .with_tools(options.use_tools)
            .with_max_history_pairs(options.max_history_pairs)
            .with_priority(options.priority);
        let request_id = self.queue.enqueue(request).await?;

        Ok(ResponseTicket {
            request_id,
            receiver: rx,
        })
    }

    /// Submit one turn and block until it completes or fails
    pub async fn submit_turn_and_wait(
        &self,
        key: &SessionKey,
        system_prompt: &str,
        user_message: &str,
        options: SubmitOptions,
    ) -> TurnResult {
        let ticket = self
            .submit_turn(key, system_prompt, user_message, options)
            .await?;
        ticket.wait().await
    }

    /// Submit one turn for streamed delivery. Bypasses the queue so chunks
    /// start flowing immediately; the transport's own concurrency cap still
    /// applies, as does the rate limit.
    pub async fn submit_stream(
        &self,
        key: &SessionKey,
        system_prompt: &str,
        user_message: &str,
        options: SubmitOptions,
    ) -> Result<ReplyStream, SubmitError> {
        if !self.limiter.admit(key).await {
            return Err(SubmitError::RateLimited);
        }
        let stream = self
            .gateway
            .process_stream(
                key,
                system_prompt,
                user_message,
                options.params,
                options.max_history_pairs,
            )
            .await?;
        Ok(stream)
    }

    /// Latest completed response for a session, if any. Repeated polls see
    /// the same hint until a newer response lands.
    pub async fn poll(&self, key: &SessionKey) -> Option<CachedHint> {
        self.fanout.read(key).await
    }

    /// Register for push delivery of every future completed response
    pub async fn subscribe(&self, key: &SessionKey) -> mpsc::UnboundedReceiver<TurnResponse> {
        self.fanout.subscribe(key).await
    }

    /// Drop a session and everything keyed by it. Returns true if the
    /// session existed.
    pub async fn clear_session(&self, key: &SessionKey) -> bool {
        let existed = self.store.clear(key).await;
        self.limiter.forget(key).await;
        self.fanout.remove_hint(key).await;
        existed
    }

    pub async fn session_count(&self) -> usize {
        self.store.session_count().await
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.depth().await
    }

    /// Periodic upkeep loop: evict idle sessions, purge dead queue entries,
    /// report load. Spawned once at startup.
    pub async fn run_upkeep(&self, sweep_interval: Duration, idle_timeout: Duration) {
        loop {
            tokio::time::sleep(sweep_interval).await;
            self.upkeep_once(idle_timeout).await;
        }
    }

    async fn upkeep_once(&self, idle_timeout: Duration) {
        let evicted = self.store.evict_idle(idle_timeout).await;
        for key in &evicted {
            self.limiter.forget(key).await;
            self.fanout.remove_hint(key).await;
        }

        let purged = self.queue.sweep().await;
        tracing::info!(
            "Upkeep: evicted {} idle sessions, purged {} queue entries, {} sessions live, queue depth {}",
            evicted.len(),
            purged,
            self.store.session_count().await,
            self.queue.depth().await
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::outbound::{
        TransportError, TransportReply, TransportRequest,
    };
    use crate::application::services::WorkerPool;
    use crate::domain::value_objects::TurnRole;
    use futures_util::StreamExt;

    struct EchoTransport;

    #[async_trait::async_trait]
    impl TransportPort for EchoTransport {
        async fn generate(
            &self,
            request: TransportRequest,
        ) -> Result<TransportReply, TransportError> {
            let last = request
                .messages
                .last()
                .map(|t| t.content.clone())
                .unwrap_or_default();
            Ok(TransportReply {
                text: format!("echo: {}", last),
                actions: Vec::new(),
            })
        }

        async fn generate_stream(
            &self,
            request: TransportRequest,
        ) -> Result<ReplyStream, TransportError> {
            let last = request
                .messages
                .last()
                .map(|t| t.content.clone())
                .unwrap_or_default();
            Ok(Box::pin(futures_util::stream::iter(vec![
                Ok("echo: ".to_string()),
                Ok(last),
            ])))
        }
    }

    struct Harness {
        relay: Arc<RelayService<EchoTransport>>,
        store: Arc<ConversationStore>,
        handles: Vec<tokio::task::JoinHandle<()>>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            for handle in &self.handles {
                handle.abort();
            }
        }
    }

    fn harness(queue_capacity: usize, rate_max: usize, workers: usize) -> Harness {
        let store = Arc::new(ConversationStore::new(100));
        let queue = Arc::new(RequestQueue::new(queue_capacity));
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60), rate_max));
        let fanout = Arc::new(ResponseFanout::new());
        let gateway = Arc::new(InferenceGateway::new(store.clone(), EchoTransport));

        let handles = if workers > 0 {
            WorkerPool::new(queue.clone(), gateway.clone(), fanout.clone(), workers).spawn()
        } else {
            Vec::new()
        };

        let relay = Arc::new(RelayService::new(store.clone(), queue, limiter, fanout, gateway));
        Harness {
            relay,
            store,
            handles,
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("maze", "p1")
    }

    #[tokio::test]
    async fn test_submit_and_wait_round_trip() {
        let h = harness(100, 30, 2);

        let response = h
            .relay
            .submit_turn_and_wait(&key(), "sys", "hello", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(response.text, "echo: hello");

        // The same response is visible to pollers
        let hint = h.relay.poll(&key()).await.unwrap();
        assert_eq!(hint.response.text, "echo: hello");
    }

    #[tokio::test]
    async fn test_subscriber_receives_pushed_response() {
        let h = harness(100, 30, 2);

        let mut rx = h.relay.subscribe(&key()).await;
        h.relay
            .submit_turn_and_wait(&key(), "sys", "ping", SubmitOptions::default())
            .await
            .unwrap();

        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.text, "echo: ping");
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_burst() {
        let h = harness(100, 2, 2);

        h.relay
            .submit_turn_and_wait(&key(), "sys", "one", SubmitOptions::default())
            .await
            .unwrap();
        h.relay
            .submit_turn_and_wait(&key(), "sys", "two", SubmitOptions::default())
            .await
            .unwrap();

        let third = h
            .relay
            .submit_turn(&key(), "sys", "three", SubmitOptions::default())
            .await;
        assert!(matches!(third, Err(SubmitError::RateLimited)));
    }

    #[tokio::test]
    async fn test_backpressure_with_no_workers() {
        let h = harness(1, 30, 0);

        let _ticket = h
            .relay
            .submit_turn(&key(), "sys", "fills the queue", SubmitOptions::default())
            .await
            .unwrap();

        let overflow = h
            .relay
            .submit_turn(&key(), "sys", "rejected", SubmitOptions::default())
            .await;
        assert!(matches!(overflow, Err(SubmitError::Backpressure)));
    }

    #[tokio::test]
    async fn test_stream_submission() {
        let h = harness(100, 30, 0);

        let mut stream = h
            .relay
            .submit_stream(&key(), "sys", "walk", SubmitOptions::default())
            .await
            .unwrap();

        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk.unwrap());
        }
        assert_eq!(text, "echo: walk");
    }

    #[tokio::test]
    async fn test_clear_session_resets_rate_window() {
        let h = harness(100, 1, 2);

        h.relay
            .submit_turn_and_wait(&key(), "sys", "one", SubmitOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            h.relay
                .submit_turn(&key(), "sys", "two", SubmitOptions::default())
                .await,
            Err(SubmitError::RateLimited)
        ));

        assert!(h.relay.clear_session(&key()).await);
        assert!(h.relay.poll(&key()).await.is_none());

        // A fresh window admits again
        h.relay
            .submit_turn_and_wait(&key(), "sys", "three", SubmitOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clear_unknown_session_is_false() {
        let h = harness(100, 30, 0);
        assert!(!h.relay.clear_session(&key()).await);
    }

    #[tokio::test]
    async fn test_upkeep_evicts_idle_sessions() {
        let h = harness(100, 30, 2);

        h.relay
            .submit_turn_and_wait(&key(), "sys", "hello", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(h.relay.session_count().await, 1);

        // Backdate the session so it looks an hour idle
        {
            let session = h.store.get(&key()).await.unwrap();
            let mut session = session.lock().await;
            session.last_access = chrono::Utc::now() - chrono::Duration::seconds(7200);
        }

        h.relay.upkeep_once(Duration::from_secs(3600)).await;
        assert_eq!(h.relay.session_count().await, 0);
        assert!(h.relay.poll(&key()).await.is_none());
    }

    #[tokio::test]
    async fn test_fresh_session_survives_upkeep() {
        let h = harness(100, 30, 2);

        h.relay
            .submit_turn_and_wait(&key(), "sys", "hello", SubmitOptions::default())
            .await
            .unwrap();

        h.relay.upkeep_once(Duration::from_secs(3600)).await;
        assert_eq!(h.relay.session_count().await, 1);

        let session = h.store.get(&key()).await.unwrap();
        let session = session.lock().await;
        assert_eq!(session.dialog()[1].role, TurnRole::User);
    }
}
