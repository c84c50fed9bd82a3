//! Bounded admission queue for inference requests
//!
//! Ordered by priority, FIFO within a priority. The queue never blocks a
//! producer: enqueue beyond capacity fails fast with Backpressure and the
//! caller decides what to do about it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::application::ports::outbound::TransportError;
use crate::domain::value_objects::{
    GenerationParams, RequestId, SessionKey, TurnResponse,
};

/// Priority constants for queue operations
pub const PRIORITY_NORMAL: u8 = 0;
pub const PRIORITY_HIGH: u8 = 1;

/// Errors surfaced to a submitting caller
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("rate limit exceeded for session")]
    RateLimited,

    #[error("request queue is full")]
    Backpressure,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("response channel closed before completion")]
    ChannelClosed,
}

/// Outcome delivered to the submitter of one request
pub type TurnResult = Result<TurnResponse, SubmitError>;

/// One request waiting for a worker
#[derive(Debug)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub session_key: SessionKey,
    pub system_prompt: String,
    pub user_message: String,
    pub params: GenerationParams,
    pub use_tools: bool,
    pub max_history_pairs: Option<usize>,
    pub priority: u8,
    pub enqueued_at: Instant,
    /// Skip the request entirely if it has not started by this point
    pub deadline: Option<Instant>,
    /// Where the worker reports the outcome. Closed means the submitter
    /// abandoned the request and it can be skipped.
    pub responder: oneshot::Sender<TurnResult>,
}

impl QueuedRequest {
    pub fn new(
        session_key: SessionKey,
        system_prompt: impl Into<String>,
        user_message: impl Into<String>,
        responder: oneshot::Sender<TurnResult>,
    ) -> Self {
        Self {
            id: RequestId::new(),
            session_key,
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
            params: GenerationParams::default(),
            use_tools: false,
            max_history_pairs: None,
            priority: PRIORITY_NORMAL,
            enqueued_at: Instant::now(),
            deadline: None,
            responder,
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_tools(mut self, use_tools: bool) -> Self {
        self.use_tools = use_tools;
        self
    }

    pub fn with_max_history_pairs(mut self, max_pairs: Option<usize>) -> Self {
        self.max_history_pairs = max_pairs;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// True when the submitter dropped its ticket
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    /// True when the deadline passed before a worker picked this up
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

struct HeapEntry {
    priority: u8,
    seq: u64,
    request: QueuedRequest,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier sequence number
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Admit one request, failing fast when the queue is full
    pub async fn enqueue(&self, request: QueuedRequest) -> Result<RequestId, SubmitError> {
        let mut inner = self.inner.lock().await;
        if inner.heap.len() >= self.capacity {
            tracing::warn!(
                "Queue full ({} items), rejecting request for session {}",
                self.capacity,
                request.session_key
            );
            return Err(SubmitError::Backpressure);
        }

        let id = request.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(HeapEntry {
            priority: request.priority,
            seq,
            request,
        });
        Ok(id)
    }

    /// Pop the next request, or None when the queue is empty. Entries whose
    /// submitter went away or whose deadline passed are discarded here.
    pub async fn dequeue(&self) -> Option<QueuedRequest> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        while let Some(entry) = inner.heap.pop() {
            let request = entry.request;
            if request.is_abandoned() {
                tracing::debug!("Skipping abandoned request {}", request.id);
                continue;
            }
            if request.is_expired(now) {
                Self::expire(request, now);
                continue;
            }
            return Some(request);
        }
        None
    }

    pub async fn depth(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    /// Purge abandoned and deadline-expired entries without dispatching
    /// anything. Returns how many entries were removed.
    pub async fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let before = inner.heap.len();

        let entries = std::mem::take(&mut inner.heap);
        for entry in entries.into_sorted_vec() {
            let request = entry.request;
            if request.is_abandoned() {
                continue;
            }
            if request.is_expired(now) {
                Self::expire(request, now);
                continue;
            }
            inner.heap.push(HeapEntry {
                priority: entry.priority,
                seq: entry.seq,
                request,
            });
        }

        before - inner.heap.len()
    }

    fn expire(request: QueuedRequest, now: Instant) {
        let waited = now.duration_since(request.enqueued_at);
        tracing::warn!(
            "Request {} for session {} expired after {:?} in queue",
            request.id,
            request.session_key,
            waited
        );
        let _ = request
            .responder
            .send(Err(TransportError::Timeout(waited).into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(session: &str, text: &str) -> (QueuedRequest, oneshot::Receiver<TurnResult>) {
        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest::new(SessionKey::new("test", session), "sys", text, tx);
        (request, rx)
    }

    #[tokio::test]
    async fn test_fifo_within_one_priority() {
        let queue = RequestQueue::new(10);
        let (first, _rx1) = request("s1", "one");
        let (second, _rx2) = request("s1", "two");
        let (third, _rx3) = request("s1", "three");

        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();
        queue.enqueue(third).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().user_message, "one");
        assert_eq!(queue.dequeue().await.unwrap().user_message, "two");
        assert_eq!(queue.dequeue().await.unwrap().user_message, "three");
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_higher_priority_dequeues_first() {
        let queue = RequestQueue::new(10);
        let (normal, _rx1) = request("s1", "normal");
        let (urgent, _rx2) = request("s2", "urgent");

        queue.enqueue(normal).await.unwrap();
        queue
            .enqueue(urgent.with_priority(PRIORITY_HIGH))
            .await
            .unwrap();

        assert_eq!(queue.dequeue().await.unwrap().user_message, "urgent");
        assert_eq!(queue.dequeue().await.unwrap().user_message, "normal");
    }

    #[tokio::test]
    async fn test_enqueue_beyond_capacity_is_backpressure() {
        let queue = RequestQueue::new(2);
        let mut receivers = Vec::new();
        let mut accepted = 0;
        let mut rejected = 0;

        for i in 0..3 {
            let (req, rx) = request("s1", &format!("m{}", i));
            receivers.push(rx);
            match queue.enqueue(req).await {
                Ok(_) => accepted += 1,
                Err(SubmitError::Backpressure) => rejected += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(accepted, 2);
        assert_eq!(rejected, 1);
        assert_eq!(queue.depth().await, 2);
    }

    #[tokio::test]
    async fn test_capacity_frees_after_dequeue() {
        let queue = RequestQueue::new(1);
        let (first, _rx1) = request("s1", "one");
        queue.enqueue(first).await.unwrap();

        let (blocked, _rx2) = request("s1", "two");
        assert!(matches!(
            queue.enqueue(blocked).await,
            Err(SubmitError::Backpressure)
        ));

        queue.dequeue().await.unwrap();
        let (fits, _rx3) = request("s1", "three");
        assert!(queue.enqueue(fits).await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_request_skipped_on_dequeue() {
        let queue = RequestQueue::new(10);
        let (abandoned, rx) = request("s1", "gone");
        let (live, _rx2) = request("s1", "still here");

        queue.enqueue(abandoned).await.unwrap();
        queue.enqueue(live).await.unwrap();
        drop(rx);

        assert_eq!(queue.dequeue().await.unwrap().user_message, "still here");
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_request_fails_with_timeout() {
        let queue = RequestQueue::new(10);
        let (req, rx) = request("s1", "slow");
        let req = req.with_deadline(Instant::now() + Duration::from_secs(1));
        queue.enqueue(req).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(queue.dequeue().await.is_none());
        match rx.await.unwrap() {
            Err(SubmitError::Transport(TransportError::Timeout(_))) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sweep_purges_abandoned_entries() {
        let queue = RequestQueue::new(10);
        let (abandoned, rx) = request("s1", "gone");
        let (live, _rx2) = request("s1", "kept");

        queue.enqueue(abandoned).await.unwrap();
        queue.enqueue(live).await.unwrap();
        drop(rx);

        assert_eq!(queue.sweep().await, 1);
        assert_eq!(queue.depth().await, 1);
        assert_eq!(queue.dequeue().await.unwrap().user_message, "kept");
    }

    #[tokio::test]
    async fn test_sweep_preserves_order() {
        let queue = RequestQueue::new(10);
        let (first, _rx1) = request("s1", "one");
        let (second, _rx2) = request("s1", "two");

        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();

        assert_eq!(queue.sweep().await, 0);
        assert_eq!(queue.dequeue().await.unwrap().user_message, "one");
        assert_eq!(queue.dequeue().await.unwrap().user_message, "two");
    }
}
