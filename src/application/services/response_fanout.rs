//! Latest-response cache and push distribution
//!
//! Every completed turn is published here: polling consumers read the cached
//! latest response for their session, push consumers hold a subscription
//! channel. Delivery to subscribers is best-effort; a subscriber that went
//! away is dropped silently on the next publish.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::domain::value_objects::{SessionKey, TurnResponse};

/// The most recent response for one session
#[derive(Debug, Clone, Serialize)]
pub struct CachedHint {
    pub response: TurnResponse,
    /// When this hint was published; never moves backwards for a session
    pub timestamp: DateTime<Utc>,
}

pub struct ResponseFanout {
    hints: RwLock<HashMap<SessionKey, CachedHint>>,
    subscribers: RwLock<HashMap<SessionKey, Vec<mpsc::UnboundedSender<TurnResponse>>>>,
}

impl ResponseFanout {
    pub fn new() -> Self {
        Self {
            hints: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Store the latest response for a session and notify its subscribers
    pub async fn publish(&self, key: &SessionKey, response: TurnResponse) {
        {
            let mut hints = self.hints.write().await;
            let now = Utc::now();
            let timestamp = match hints.get(key) {
                // Guard against clock adjustments
                Some(previous) => now.max(previous.timestamp),
                None => now,
            };
            hints.insert(
                key.clone(),
                CachedHint {
                    response: response.clone(),
                    timestamp,
                },
            );
        }

        let mut subscribers = self.subscribers.write().await;
        if let Some(senders) = subscribers.get_mut(key) {
            senders.retain(|sender| sender.send(response.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(key);
            }
        }

        tracing::debug!("Published response for session {}", key);
    }

    /// Current cached response, if any. Reading never consumes it.
    pub async fn read(&self, key: &SessionKey) -> Option<CachedHint> {
        self.hints.read().await.get(key).cloned()
    }

    /// Open a push channel for one session's responses
    pub async fn subscribe(&self, key: &SessionKey) -> mpsc::UnboundedReceiver<TurnResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .push(tx);
        rx
    }

    /// Number of live subscription channels for a session
    pub async fn subscriber_count(&self, key: &SessionKey) -> usize {
        self.subscribers
            .read()
            .await
            .get(key)
            .map_or(0, |senders| senders.len())
    }

    /// Drop the cached hint for a session (explicit clear, idle eviction).
    /// Subscriptions are left alone; they follow their connection's lifetime.
    pub async fn remove_hint(&self, key: &SessionKey) {
        self.hints.write().await.remove(key);
    }
}

impl Default for ResponseFanout {
    fn default() -> Self {
        Self::new()
    }
}
