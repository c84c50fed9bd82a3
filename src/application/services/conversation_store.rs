//! Per-session dialog storage with bounded trimming
//!
//! Sessions are created lazily on first use and keep an ordered dialog whose
//! turn 0 is always the system prompt. A coarse map lock guards insertion and
//! eviction only; every per-turn mutation goes through the session's own lock,
//! so unrelated sessions never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::domain::value_objects::{DialogTurn, SessionKey};

/// One conversation and its bookkeeping
#[derive(Debug)]
pub struct DialogSession {
    key: SessionKey,
    dialog: Vec<DialogTurn>,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Total turns ever appended, including trimmed ones
    pub turn_count: u64,
}

impl DialogSession {
    fn new(key: SessionKey, system_prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            key,
            dialog: vec![DialogTurn::system(system_prompt)],
            created_at: now,
            last_access: now,
            turn_count: 0,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// The current dialog, system turn first
    pub fn dialog(&self) -> &[DialogTurn] {
        &self.dialog
    }

    /// Number of turns excluding the system turn
    pub fn non_system_len(&self) -> usize {
        self.dialog.len().saturating_sub(1)
    }

    pub fn touch(&mut self) {
        self.last_access = Utc::now();
    }

    /// Append one turn without trimming
    pub fn append_turn(&mut self, turn: DialogTurn) {
        self.dialog.push(turn);
        self.turn_count += 1;
        self.touch();
    }

    /// Drop the oldest non-system pairs until at most `2 * max_pairs`
    /// non-system turns remain. Turn 0 is never touched. `None` disables
    /// trimming entirely (open-ended chat).
    pub fn trim_history(&mut self, max_pairs: Option<usize>) {
        let Some(max_pairs) = max_pairs else {
            return;
        };
        let cap = 2 * max_pairs;
        while self.dialog.len() > 1 && self.dialog.len() - 1 > cap {
            let drop = usize::min(2, self.dialog.len() - 1);
            self.dialog.drain(1..1 + drop);
        }
    }

    /// Append one turn, then enforce the history bound
    pub fn append_and_trim(&mut self, turn: DialogTurn, max_pairs: Option<usize>) {
        self.append_turn(turn);
        self.trim_history(max_pairs);
    }
}

/// Owns the session map and its lifecycle
pub struct ConversationStore {
    sessions: RwLock<HashMap<SessionKey, Arc<Mutex<DialogSession>>>>,
    max_sessions: usize,
}

impl ConversationStore {
    /// Create a store holding at most `max_sessions` live sessions
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Fetch a session, creating it with the given system prompt if missing.
    /// An existing session keeps its original system prompt.
    pub async fn get_or_create(
        &self,
        key: &SessionKey,
        system_prompt: &str,
    ) -> Arc<Mutex<DialogSession>> {
        // Fast path: read lock only. The session's own lock is taken after
        // the map guard is released; a session mid-generation holds its
        // lock for the whole call.
        let existing = {
            let sessions = self.sessions.read().await;
            sessions.get(key).cloned()
        };
        if let Some(session) = existing {
            session.lock().await.touch();
            return session;
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(key) {
            let session = session.clone();
            drop(sessions);
            session.lock().await.touch();
            return session;
        }

        if sessions.len() >= self.max_sessions {
            Self::evict_lru(&mut sessions);
        }

        let session = Arc::new(Mutex::new(DialogSession::new(key.clone(), system_prompt)));
        sessions.insert(key.clone(), session.clone());
        tracing::debug!("Created session {}", key);
        session
    }

    /// Fetch an existing session without creating one
    pub async fn get(&self, key: &SessionKey) -> Option<Arc<Mutex<DialogSession>>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Append one turn atomically, creating the session on demand.
    /// Unknown keys get an empty system prompt; callers that care about the
    /// prompt should go through `get_or_create` first.
    pub async fn append_and_trim(
        &self,
        key: &SessionKey,
        turn: DialogTurn,
        max_pairs: Option<usize>,
    ) -> Arc<Mutex<DialogSession>> {
        let session = self.get_or_create(key, "").await;
        session.lock().await.append_and_trim(turn, max_pairs);
        session
    }

    /// Remove a session. Returns true if it existed.
    pub async fn clear(&self, key: &SessionKey) -> bool {
        let removed = self.sessions.write().await.remove(key).is_some();
        if removed {
            tracing::info!("Cleared session {}", key);
        }
        removed
    }

    /// Remove sessions idle for longer than `older_than` and return their
    /// keys so callers can drop related per-session state. Sessions that are
    /// currently locked are mid-request and therefore not idle.
    pub async fn evict_idle(&self, older_than: Duration) -> Vec<SessionKey> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));
        let Some(cutoff) = cutoff else {
            // Window too large to ever be exceeded
            return Vec::new();
        };

        let mut sessions = self.sessions.write().await;
        let expired: Vec<SessionKey> = sessions
            .iter()
            .filter_map(|(key, session)| {
                let guard = session.try_lock().ok()?;
                (guard.last_access < cutoff).then(|| key.clone())
            })
            .collect();

        for key in &expired {
            sessions.remove(key);
        }
        drop(sessions);

        if !expired.is_empty() {
            tracing::info!("Evicted {} idle sessions", expired.len());
        }
        expired
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Evict the least-recently-accessed session to make room. Locked
    /// sessions are in use and skipped; if every session is busy the cap is
    /// allowed to overshoot rather than stall unrelated traffic.
    fn evict_lru(sessions: &mut HashMap<SessionKey, Arc<Mutex<DialogSession>>>) {
        let oldest = sessions
            .iter()
            .filter_map(|(key, session)| {
                let guard = session.try_lock().ok()?;
                Some((key.clone(), guard.last_access))
            })
            .min_by_key(|(_, last_access)| *last_access);

        match oldest {
            Some((key, _)) => {
                sessions.remove(&key);
                tracing::info!("Evicted oldest session {} (store at capacity)", key);
            }
            None => {
                tracing::warn!("Session store at capacity but every session is busy");
            }
        }
    }
}
