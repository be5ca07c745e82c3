//! Async-task binding (spec §4.6): pins a vendor-issued `task_id` (video
//! generation, batch jobs) to the channel and model names that originated
//! it, so a later poll for that task is routed back to the same channel
//! rather than re-running selection. Bindings are garbage collected after
//! `server.async_task_binding_ttl_secs` of inactivity.

use crate::error::{RelayError, RelayResult};
use crate::repository::{AsyncTaskBinding, Repository, RepositoryError};

/// Thin wrapper over `Repository`'s task-binding methods, translating
/// `RepositoryError` into the relay's error taxonomy.
pub struct TaskBindingStore<'a> {
    repo: &'a dyn Repository,
}

impl<'a> TaskBindingStore<'a> {
    pub fn new(repo: &'a dyn Repository) -> Self {
        Self { repo }
    }

    /// Record a new binding right after the originating request is
    /// dispatched.
    pub async fn bind(
        &self,
        task_id: impl Into<String>,
        channel_id: impl Into<String>,
        origin_model: impl Into<String>,
        actual_model: impl Into<String>,
        task_type: impl Into<String>,
        now: i64,
    ) -> RelayResult<()> {
        self.repo
            .put_task_binding(AsyncTaskBinding {
                task_id: task_id.into(),
                channel_id: channel_id.into(),
                origin_model: origin_model.into(),
                actual_model: actual_model.into(),
                task_type: task_type.into(),
                created_at: now,
                last_access_at: now,
            })
            .await
            .map_err(map_repository_error)
    }

    /// Look up the channel/model a task was bound to, touching its
    /// `last_access_at` is the caller's responsibility (a status poll
    /// counts as activity; `rebind` below does that atomically).
    pub async fn lookup(&self, task_id: &str) -> RelayResult<AsyncTaskBinding> {
        self.repo
            .get_task_binding(task_id)
            .await
            .map_err(map_repository_error)?
            .ok_or_else(|| RelayError::NotFound(format!("no channel binding for task '{task_id}'")))
    }

    /// Refresh a binding's `last_access_at` on a status poll, so active
    /// tasks survive garbage collection.
    pub async fn touch(&self, task_id: &str, now: i64) -> RelayResult<()> {
        let mut binding = self.lookup(task_id).await?;
        binding.last_access_at = now;

        self.repo.put_task_binding(binding).await.map_err(map_repository_error)
    }

    /// Drop a binding once the task is known to be terminal (completed,
    /// failed, or cancelled upstream).
    pub async fn release(&self, task_id: &str) -> RelayResult<()> {
        self.repo.delete_task_binding(task_id).await.map_err(map_repository_error)
    }

    /// Garbage-collect bindings whose `last_access_at` is older than
    /// `now - ttl_secs`, returning how many were removed.
    pub async fn gc(&self, now: i64, ttl_secs: u64) -> RelayResult<u64> {
        let cutoff = now.saturating_sub(ttl_secs as i64);
        self.repo.gc_task_bindings(cutoff).await.map_err(map_repository_error)
    }
}

fn map_repository_error(err: RepositoryError) -> RelayError {
    match err {
        RepositoryError::NotFound { kind, id } => RelayError::NotFound(format!("{kind} '{id}' not found")),
        RepositoryError::Conflict { kind, id } => RelayError::Internal(anyhow::anyhow!("conflicting update for {kind} '{id}'")),
        RepositoryError::Backend(err) => RelayError::Internal(err),
    }
}

#[cfg(test)]
mod tests {
    use crate::repository::InMemoryRepository;

    use super::*;

    #[tokio::test]
    async fn bind_then_lookup_round_trips() {
        let repo = InMemoryRepository::new();
        let store = TaskBindingStore::new(&repo);

        store.bind("vid_1", "channel-a", "sora-2", "sora-2-pro", "video", 1_000).await.unwrap();

        let binding = store.lookup("vid_1").await.unwrap();
        assert_eq!(binding.channel_id, "channel-a");
        assert_eq!(binding.actual_model, "sora-2-pro");
    }

    #[tokio::test]
    async fn lookup_missing_binding_is_not_found() {
        let repo = InMemoryRepository::new();
        let store = TaskBindingStore::new(&repo);

        let err = store.lookup("nonexistent").await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn gc_removes_stale_bindings_but_keeps_fresh_ones() {
        let repo = InMemoryRepository::new();
        let store = TaskBindingStore::new(&repo);

        store.bind("stale", "channel-a", "m", "m", "video", 0).await.unwrap();
        store.bind("fresh", "channel-a", "m", "m", "video", 10_000).await.unwrap();

        let removed = store.gc(10_000, 100).await.unwrap();
        assert_eq!(removed, 1);

        assert!(store.lookup("stale").await.is_err());
        assert!(store.lookup("fresh").await.is_ok());
    }

    #[tokio::test]
    async fn touch_refreshes_last_access_and_survives_gc() {
        let repo = InMemoryRepository::new();
        let store = TaskBindingStore::new(&repo);

        store.bind("task", "channel-a", "m", "m", "video", 0).await.unwrap();
        store.touch("task", 10_000).await.unwrap();

        let removed = store.gc(10_000, 100).await.unwrap();
        assert_eq!(removed, 0);
    }
}
