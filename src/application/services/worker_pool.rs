//! Worker pool draining the request queue
//!
//! A fixed number of worker tasks pull from the queue and run requests
//! through the gateway. Per-session serialization is not the pool's job:
//! two workers may pick up requests for the same session, and the session
//! lock inside the gateway makes the second wait.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::application::ports::outbound::TransportPort;
use crate::application::services::{
    InferenceGateway, QueuedRequest, RequestQueue, ResponseFanout,
};

pub struct WorkerPool<T: TransportPort + 'static> {
    queue: Arc<RequestQueue>,
    gateway: Arc<InferenceGateway<T>>,
    fanout: Arc<ResponseFanout>,
    worker_count: usize,
}

impl<T: TransportPort + 'static> WorkerPool<T> {
    pub fn new(
        queue: Arc<RequestQueue>,
        gateway: Arc<InferenceGateway<T>>,
        fanout: Arc<ResponseFanout>,
        worker_count: usize,
    ) -> Self {
        Self {
            queue,
            gateway,
            fanout,
            worker_count: worker_count.max(1),
        }
    }

    /// Spawn the worker tasks. Handles are returned so the caller can abort
    /// them on shutdown.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        (0..self.worker_count)
            .map(|worker_id| {
                let queue = self.queue.clone();
                let gateway = self.gateway.clone();
                let fanout = self.fanout.clone();
                tokio::spawn(async move {
                    Self::run_worker(worker_id, queue, gateway, fanout).await;
                })
            })
            .collect()
    }

    /// One worker loop: dequeue, process, report, repeat
    async fn run_worker(
        worker_id: usize,
        queue: Arc<RequestQueue>,
        gateway: Arc<InferenceGateway<T>>,
        fanout: Arc<ResponseFanout>,
    ) {
        tracing::debug!("Worker {} started", worker_id);
        loop {
            match queue.dequeue().await {
                Some(request) => {
                    Self::process_one(worker_id, &gateway, &fanout, request).await;
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn process_one(
        worker_id: usize,
        gateway: &InferenceGateway<T>,
        fanout: &ResponseFanout,
        request: QueuedRequest,
    ) {
        let QueuedRequest {
            id,
            session_key,
            system_prompt,
            user_message,
            params,
            use_tools,
            max_history_pairs,
            enqueued_at,
            responder,
            ..
        } = request;

        let queued_for = enqueued_at.elapsed();
        let started = tokio::time::Instant::now();

        let result = gateway
            .process(
                &session_key,
                &system_prompt,
                &user_message,
                params,
                use_tools,
                max_history_pairs,
            )
            .await;

        match result {
            Ok(response) => {
                tracing::info!(
                    "Worker {} finished request {} for {} (queued {:?}, processed {:?})",
                    worker_id,
                    id,
                    session_key,
                    queued_for,
                    started.elapsed()
                );
                // Cache and push first so poll/subscribe clients see the
                // response even when the submitter has gone away
                fanout.publish(&session_key, response.clone()).await;
                if responder.send(Ok(response)).is_err() {
                    tracing::debug!("Submitter of request {} went away before the reply", id);
                }
            }
            Err(e) => {
                tracing::error!(
                    "Worker {} failed request {} for {}: {}",
                    worker_id,
                    id,
                    session_key,
                    e
                );
                let _ = responder.send(Err(e.into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::outbound::{
        ReplyStream, TransportError, TransportReply, TransportRequest,
    };
    use crate::application::services::{ConversationStore, SubmitError, PRIORITY_HIGH};
    use crate::domain::value_objects::SessionKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    /// Counts concurrent generations and fails on demand
    struct TrackingTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        processed: std::sync::Mutex<Vec<String>>,
        fail: bool,
        delay: Duration,
    }

    impl TrackingTransport {
        fn ok() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                processed: std::sync::Mutex::new(Vec::new()),
                fail: false,
                delay: Duration::from_millis(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::ok()
            }
        }
    }

    #[async_trait::async_trait]
    impl TransportPort for TrackingTransport {
        async fn generate(
            &self,
            request: TransportRequest,
        ) -> Result<TransportReply, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(turn) = request.messages.last() {
                self.processed.lock().unwrap().push(turn.content.clone());
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(TransportError::Upstream("boom".to_string()));
            }
            Ok(TransportReply {
                text: format!("reply to {}", request.messages.last().map(|t| t.content.as_str()).unwrap_or("")),
                actions: Vec::new(),
            })
        }

        async fn generate_stream(
            &self,
            _request: TransportRequest,
        ) -> Result<ReplyStream, TransportError> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
    }

    struct Harness {
        queue: Arc<RequestQueue>,
        gateway: Arc<InferenceGateway<TrackingTransport>>,
        fanout: Arc<ResponseFanout>,
        handles: Vec<JoinHandle<()>>,
    }

    fn start_pool(transport: TrackingTransport, workers: usize) -> Harness {
        let queue = Arc::new(RequestQueue::new(100));
        let store = Arc::new(ConversationStore::new(100));
        let gateway = Arc::new(InferenceGateway::new(store, transport));
        let fanout = Arc::new(ResponseFanout::new());
        let pool = WorkerPool::new(queue.clone(), gateway.clone(), fanout.clone(), workers);
        let handles = pool.spawn();
        Harness {
            queue,
            gateway,
            fanout,
            handles,
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            for handle in &self.handles {
                handle.abort();
            }
        }
    }

    #[tokio::test]
    async fn test_worker_completes_request_and_publishes() {
        let harness = start_pool(TrackingTransport::ok(), 2);
        let key = SessionKey::new("maze", "p1");

        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest::new(key.clone(), "sys", "which way?", tx);
        harness.queue.enqueue(request).await.unwrap();

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.text, "reply to which way?");

        let hint = harness.fanout.read(&key).await.unwrap();
        assert_eq!(hint.response.text, "reply to which way?");
    }

    #[tokio::test]
    async fn test_worker_reports_transport_failure() {
        let harness = start_pool(TrackingTransport::failing(), 1);
        let key = SessionKey::new("maze", "p1");

        let (tx, rx) = oneshot::channel();
        harness
            .queue
            .enqueue(QueuedRequest::new(key.clone(), "sys", "hi", tx))
            .await
            .unwrap();

        match rx.await.unwrap() {
            Err(SubmitError::Transport(TransportError::Upstream(_))) => {}
            other => panic!("expected upstream failure, got {:?}", other.map(|r| r.text)),
        }
        // Failures never reach the cache
        assert!(harness.fanout.read(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_requests_for_one_session_serialize() {
        let harness = start_pool(TrackingTransport::slow(Duration::from_millis(30)), 4);
        let key = SessionKey::new("maze", "p1");

        let mut receivers = Vec::new();
        for i in 0..4 {
            let (tx, rx) = oneshot::channel();
            harness
                .queue
                .enqueue(QueuedRequest::new(key.clone(), "sys", format!("m{}", i), tx))
                .await
                .unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        // Four workers, one session: the session lock keeps generation serial
        assert_eq!(harness.gateway.transport().peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_sessions_run_in_parallel() {
        let harness = start_pool(TrackingTransport::slow(Duration::from_millis(50)), 4);

        let mut receivers = Vec::new();
        for i in 0..4 {
            let key = SessionKey::new("maze", format!("p{}", i));
            let (tx, rx) = oneshot::channel();
            harness
                .queue
                .enqueue(QueuedRequest::new(key, "sys", "go", tx))
                .await
                .unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        assert!(harness.gateway.transport().peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_high_priority_request_overtakes() {
        // One slow worker so the queue backs up behind the first request
        let harness = start_pool(TrackingTransport::slow(Duration::from_millis(50)), 1);

        let (tx0, rx0) = oneshot::channel();
        harness
            .queue
            .enqueue(QueuedRequest::new(
                SessionKey::new("maze", "p0"),
                "sys",
                "first",
                tx0,
            ))
            .await
            .unwrap();

        let (tx1, rx1) = oneshot::channel();
        harness
            .queue
            .enqueue(QueuedRequest::new(
                SessionKey::new("maze", "p1"),
                "sys",
                "normal",
                tx1,
            ))
            .await
            .unwrap();

        let (tx2, rx2) = oneshot::channel();
        harness
            .queue
            .enqueue(
                QueuedRequest::new(SessionKey::new("maze", "p2"), "sys", "urgent", tx2)
                    .with_priority(PRIORITY_HIGH),
            )
            .await
            .unwrap();

        rx0.await.unwrap().unwrap();
        let urgent = rx2.await.unwrap().unwrap();
        assert_eq!(urgent.text, "reply to urgent");
        rx1.await.unwrap().unwrap();

        let processed = harness.gateway.transport().processed.lock().unwrap();
        let at = |m: &str| processed.iter().position(|p| p == m).unwrap();
        assert!(at("urgent") < at("normal"));
    }
}
