//! Pending request registry for the broker link
//!
//! Every published request registers a one-shot slot keyed by correlation
//! id. Slots deliberately survive a connection drop so a reply that arrives
//! after a reconnect still finds its caller; the stale sweep is what finally
//! gives up on them.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::application::ports::outbound::{TransportError, TransportReply};
use crate::domain::value_objects::CorrelationId;

type ReplySlot = oneshot::Sender<Result<TransportReply, TransportError>>;

struct PendingEntry {
    slot: ReplySlot,
    registered_at: Instant,
}

#[derive(Default)]
pub struct PendingMap {
    entries: Mutex<HashMap<CorrelationId, PendingEntry>>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for a request about to be published
    pub async fn register(
        &self,
        id: CorrelationId,
    ) -> oneshot::Receiver<Result<TransportReply, TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().await.insert(
            id,
            PendingEntry {
                slot: tx,
                registered_at: Instant::now(),
            },
        );
        rx
    }

    /// Deliver a result to the registered caller. Returns false when the id
    /// is unknown, which means the reply is late or was never ours.
    pub async fn resolve(
        &self,
        id: &CorrelationId,
        result: Result<TransportReply, TransportError>,
    ) -> bool {
        match self.entries.lock().await.remove(id) {
            Some(entry) => {
                // A dropped receiver just means the caller gave up first
                let _ = entry.slot.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop a slot without delivering anything (caller timed out locally)
    pub async fn forget(&self, id: &CorrelationId) {
        self.entries.lock().await.remove(id);
    }

    /// Fail every entry older than `older_than` with a timeout. Returns how
    /// many were failed.
    pub async fn sweep_stale(&self, older_than: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        let stale: Vec<CorrelationId> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.registered_at) >= older_than)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(entry) = entries.remove(id) {
                let _ = entry.slot.send(Err(TransportError::Timeout(older_than)));
            }
        }
        stale.len()
    }

    /// Fail every entry with the given error. Used when the link is being
    /// torn down for good.
    pub async fn drain_all(&self, error: TransportError) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        for (_, entry) in entries.drain() {
            let _ = entry.slot.send(Err(error.clone()));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
