//! Per-session sliding-window admission control
//!
//! Each session key tracks the timestamps of its recent requests. A request
//! is admitted only while the in-window count is below the configured
//! maximum; denials are immediate and are not recorded, so a throttled
//! client regains capacity as soon as its old requests age out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::domain::value_objects::SessionKey;

pub struct RateLimiter {
    /// Request timestamps per session, each behind its own lock
    windows: RwLock<HashMap<SessionKey, Arc<Mutex<VecDeque<Instant>>>>>,
    window: Duration,
    max_requests: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            window,
            max_requests,
        }
    }

    /// Admit or reject one request for this session
    pub async fn admit(&self, key: &SessionKey) -> bool {
        let timestamps = self.window_for(key).await;
        let mut timestamps = timestamps.lock().await;

        let now = Instant::now();
        if let Some(cutoff) = now.checked_sub(self.window) {
            while let Some(oldest) = timestamps.front() {
                if *oldest <= cutoff {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }
        }

        if timestamps.len() >= self.max_requests {
            tracing::warn!("Rate limit exceeded for session {}", key);
            return false;
        }

        timestamps.push_back(now);
        true
    }

    /// Drop all recorded state for a session (eviction, explicit clear)
    pub async fn forget(&self, key: &SessionKey) {
        self.windows.write().await.remove(key);
    }

    async fn window_for(&self, key: &SessionKey) -> Arc<Mutex<VecDeque<Instant>>> {
        {
            let windows = self.windows.read().await;
            if let Some(timestamps) = windows.get(key) {
                return timestamps.clone();
            }
        }

        let mut windows = self.windows.write().await;
        windows
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> SessionKey {
        SessionKey::new("test", id)
    }

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        let key = key("s1");

        for _ in 0..3 {
            assert!(limiter.admit(&key).await);
        }
        assert!(!limiter.admit(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);
        let key = key("s1");

        assert!(limiter.admit(&key).await);
        assert!(limiter.admit(&key).await);
        assert!(!limiter.admit(&key).await);

        tokio::time::advance(Duration::from_secs(61)).await;

        // Old requests aged out; denials were never recorded.
        assert!(limiter.admit(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_slide_frees_partial_capacity() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);
        let key = key("s1");

        assert!(limiter.admit(&key).await);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(limiter.admit(&key).await);
        assert!(!limiter.admit(&key).await);

        // First request leaves the window, second is still inside.
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(limiter.admit(&key).await);
        assert!(!limiter.admit(&key).await);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);

        assert!(limiter.admit(&key("a")).await);
        assert!(!limiter.admit(&key("a")).await);
        assert!(limiter.admit(&key("b")).await);
    }

    #[tokio::test]
    async fn test_forget_resets_session() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let key = key("s1");

        assert!(limiter.admit(&key).await);
        assert!(!limiter.admit(&key).await);

        limiter.forget(&key).await;
        assert!(limiter.admit(&key).await);
    }
}
