#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use tracekit::error::StoreError;
use tracekit::store::{
    CommitOutcome, CoordinationStore, DispatchCommit, InMemoryStore, Release, ReleaseOutcome, StoreResult,
};

/// In-memory store whose next replies can be lost: the operation is applied,
/// then the caller sees `StoreError::Unavailable`, as after a connection drop
/// between the write and its reply.
#[derive(Default)]
pub struct LossyStore {
    pub inner: InMemoryStore,
    lost_releases: AtomicU32,
    lost_pushes: AtomicU32,
}

impl LossyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lose_release_replies(&self, n: u32) {
        self.lost_releases.store(n, Ordering::SeqCst);
    }

    /// Applies to `push_back` and `push_back_once`.
    pub fn lose_push_replies(&self, n: u32) {
        self.lost_pushes.store(n, Ordering::SeqCst);
    }

    fn lose<T>(counter: &AtomicU32, result: StoreResult<T>) -> StoreResult<T> {
        let lost = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match result {
            Ok(_) if lost => Err(StoreError::Unavailable("reply lost".to_string())),
            other => other,
        }
    }
}

#[async_trait]
impl CoordinationStore for LossyStore {
    async fn push_back(&self, list: &str, value: &str) -> StoreResult<u64> {
        Self::lose(&self.lost_pushes, self.inner.push_back(list, value).await)
    }

    async fn push_back_once(&self, list: &str, id: &str, value: &str) -> StoreResult<Option<u64>> {
        Self::lose(&self.lost_pushes, self.inner.push_back_once(list, id, value).await)
    }

    async fn pop_front(&self, list: &str) -> StoreResult<Option<String>> {
        self.inner.pop_front(list).await
    }

    async fn pop_front_blocking(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>> {
        self.inner.pop_front_blocking(list, timeout).await
    }

    async fn peek_front(&self, list: &str) -> StoreResult<Option<String>> {
        self.inner.peek_front(list).await
    }

    async fn len(&self, list: &str) -> StoreResult<u64> {
        self.inner.len(list).await
    }

    async fn range(&self, list: &str) -> StoreResult<Vec<String>> {
        self.inner.range(list).await
    }

    async fn remove(&self, list: &str, value: &str, count: u64) -> StoreResult<u64> {
        self.inner.remove(list, value, count).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: i64) -> StoreResult<()> {
        self.inner.set(key, value).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.inner.incr_by(key, delta).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.keys_with_prefix(prefix).await
    }

    async fn commit_dispatch(&self, commit: &DispatchCommit<'_>) -> StoreResult<CommitOutcome> {
        self.inner.commit_dispatch(commit).await
    }

    async fn release(&self, release: &Release<'_>) -> StoreResult<ReleaseOutcome> {
        Self::lose(&self.lost_releases, self.inner.release(release).await)
    }
}
