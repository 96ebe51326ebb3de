use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

use crate::model::Turn;

pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Ordered, append-only conversation history keyed by session id.
pub trait SessionStore: Send + Sync {
    /// Returns an empty history for ids that have never been used.
    fn load<'a>(&'a self, session_id: &'a str) -> SessionFuture<'a, Vec<Turn>>;

    /// Extends the session's history with `turns` as one atomic step.
    fn append<'a>(&'a self, session_id: &'a str, turns: Vec<Turn>) -> SessionFuture<'a, ()>;
}

/// Process-lifetime history. Sessions are never evicted.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<Turn>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl SessionStore for InMemorySessionStore {
    fn load<'a>(&'a self, session_id: &'a str) -> SessionFuture<'a, Vec<Turn>> {
        Box::pin(async move {
            let sessions = self.sessions.read().await;
            Ok(sessions.get(session_id).cloned().unwrap_or_default())
        })
    }

    fn append<'a>(&'a self, session_id: &'a str, turns: Vec<Turn>) -> SessionFuture<'a, ()> {
        Box::pin(async move {
            if turns.is_empty() {
                return Ok(());
            }
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(session_id.to_string())
                .or_default()
                .extend(turns);
            Ok(())
        })
    }
}

/// Serializes turns per session so history is appended in request order.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other turn for `session_id` is in flight.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}
