//! In-memory cancellation registry for in-flight AI executions.
//! One [`CancellationToken`] per execution, keyed `exec-<taskId>-<startMs>`
//! so a task retried after a failure gets its own token rather than
//! inheriting a cancelled one from a previous attempt.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_key(task_id: i64, start_ms: i64) -> String {
        format!("exec-{task_id}-{start_ms}")
    }

    pub async fn create(&self, task_id: i64) -> (String, CancellationToken) {
        self.register(task_id, CancellationToken::new()).await
    }

    /// Registers an externally-supplied token (e.g. the caller's own
    /// `options.signal`) under a freshly minted execution key, so
    /// [`Self::cancel_task`] can abort it alongside tokens this registry
    /// created itself.
    pub async fn register(&self, task_id: i64, token: CancellationToken) -> (String, CancellationToken) {
        let key = Self::execution_key(task_id, Utc::now().timestamp_millis());
        self.tokens.write().await.insert(key.clone(), token.clone());
        (key, token)
    }

    pub async fn remove(&self, key: &str) {
        self.tokens.write().await.remove(key);
    }

    /// Aborts every registered execution for `task_id`, regardless of which
    /// attempt's `startMs` it was keyed with.
    pub async fn cancel_task(&self, task_id: i64) {
        let prefix = format!("exec-{task_id}-");
        let guard = self.tokens.read().await;
        for (key, token) in guard.iter() {
            if key.starts_with(&prefix) {
                token.cancel();
            }
        }
    }

    pub async fn cancel_all(&self) {
        let guard = self.tokens.read().await;
        for token in guard.values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_task_aborts_every_attempt_for_that_task() {
        let registry = CancellationRegistry::new();
        let (_, first) = registry.create(7).await;
        let (_, second) = registry.create(7).await;
        let (_, other_task) = registry.create(8).await;

        registry.cancel_task(7).await;

        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(!other_task.is_cancelled());
    }

    #[tokio::test]
    async fn remove_drops_the_token_without_cancelling_it() {
        let registry = CancellationRegistry::new();
        let (key, token) = registry.create(1).await;
        registry.remove(&key).await;
        assert!(!token.is_cancelled());
        registry.cancel_task(1).await;
        assert!(!token.is_cancelled());
    }
}
