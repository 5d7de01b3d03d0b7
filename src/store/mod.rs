pub mod keys;
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

pub use self::memory::InMemoryStore;
pub use self::redis_store::RedisStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One atomic dispatch: verify the pending head is still `expected_head`,
/// check capacity, optionally take a slot token, then move the task.
#[derive(Debug, Clone)]
pub struct DispatchCommit<'a> {
    pub node: &'a str,
    /// Raw pending head the decision was made on.
    pub expected_head: &'a str,
    pub cpu_units: u32,
    pub take_slot: bool,
    /// Serialized assignment pushed onto the node queue.
    pub assignment: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { cap_before: i64, cap_after: i64 },
    /// The pending head changed between peek and commit.
    HeadChanged,
    InsufficientCapacity { cap: i64 },
    NoSlotToken,
}

/// Returning a finished task's resources to its node. Applied only while
/// `signal` is still the head of `q:done`, and pops it in the same step.
#[derive(Debug, Clone)]
pub struct Release<'a> {
    /// Raw completion signal the release was decoded from.
    pub signal: &'a str,
    pub node: &'a str,
    pub cpu_units: u32,
    pub return_slot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released {
        cap_after: i64,
        /// Units discarded because the return would exceed `cap_total`.
        clamped: i64,
    },
    /// `q:done` no longer starts with this signal; nothing was changed.
    SignalMoved,
}

/// Atomic list and counter primitives shared by every component.
///
/// Lists are FIFO: `push_back` appends on the right, `pop_front` takes from
/// the left. Missing counters read as `None`.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn push_back(&self, list: &str, value: &str) -> StoreResult<u64>;
    /// Appends `value` unless an element with the same `id` was already
    /// pushed onto `list`. Returns the new length, or `None` for a repeat.
    /// Safe to retry after a lost reply.
    async fn push_back_once(&self, list: &str, id: &str, value: &str) -> StoreResult<Option<u64>>;
    async fn pop_front(&self, list: &str) -> StoreResult<Option<String>>;
    /// Waits up to `timeout` for an element.
    async fn pop_front_blocking(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>>;
    async fn peek_front(&self, list: &str) -> StoreResult<Option<String>>;
    async fn len(&self, list: &str) -> StoreResult<u64>;
    async fn range(&self, list: &str) -> StoreResult<Vec<String>>;
    /// Removes up to `count` occurrences of `value` (0 = all). Returns the number removed.
    async fn remove(&self, list: &str, value: &str, count: u64) -> StoreResult<u64>;

    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;
    async fn set(&self, key: &str, value: i64) -> StoreResult<()>;
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;
    async fn delete(&self, key: &str) -> StoreResult<bool>;
    /// All keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn commit_dispatch(&self, commit: &DispatchCommit<'_>) -> StoreResult<CommitOutcome>;
    async fn release(&self, release: &Release<'_>) -> StoreResult<ReleaseOutcome>;
}
