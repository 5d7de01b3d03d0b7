use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::{
    CommitOutcome, CoordinationStore, DispatchCommit, Release, ReleaseOutcome, StoreResult, keys,
};

/// Process-local store with the same atomicity as the Redis scripts.
/// Multi-key operations hold the list lock for their whole duration.
pub struct InMemoryStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    counters: DashMap<String, i64>,
    pushed: Notify,
    offline: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            counters: DashMap::new(),
            pushed: Notify::new(),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulates losing (or regaining) the connection: every call fails with
    /// `StoreError::Unavailable` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn counter(&self, key: &str) -> i64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn push_back(&self, list: &str, value: &str) -> StoreResult<u64> {
        self.check()?;
        let len = {
            let mut lists = self.lists.lock().await;
            let entry = lists.entry(list.to_string()).or_default();
            entry.push_back(value.to_string());
            entry.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn push_back_once(&self, list: &str, id: &str, value: &str) -> StoreResult<Option<u64>> {
        self.check()?;
        let len = {
            let mut lists = self.lists.lock().await;
            let marker = keys::push_marker(list, id);
            if self.counters.contains_key(&marker) {
                return Ok(None);
            }
            self.counters.insert(marker, 1);
            let entry = lists.entry(list.to_string()).or_default();
            entry.push_back(value.to_string());
            entry.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(Some(len))
    }

    async fn pop_front(&self, list: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let mut lists = self.lists.lock().await;
        Ok(lists.get_mut(list).and_then(|l| l.pop_front()))
    }

    async fn pop_front_blocking(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.pop_front(list).await? {
                return Ok(Some(value));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn peek_front(&self, list: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let lists = self.lists.lock().await;
        Ok(lists.get(list).and_then(|l| l.front().cloned()))
    }

    async fn len(&self, list: &str) -> StoreResult<u64> {
        self.check()?;
        let lists = self.lists.lock().await;
        Ok(lists.get(list).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn range(&self, list: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let lists = self.lists.lock().await;
        Ok(lists.get(list).map(|l| l.iter().cloned().collect()).unwrap_or_default())
    }

    async fn remove(&self, list: &str, value: &str, count: u64) -> StoreResult<u64> {
        self.check()?;
        let mut lists = self.lists.lock().await;
        let Some(entries) = lists.get_mut(list) else {
            return Ok(0);
        };
        let mut removed = 0;
        entries.retain(|v| {
            if v == value && (count == 0 || removed < count) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        self.check()?;
        Ok(self.counters.get(key).map(|v| *v))
    }

    async fn set(&self, key: &str, value: i64) -> StoreResult<()> {
        self.check()?;
        self.counters.insert(key.to_string(), value);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.check()?;
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let counter = self.counters.remove(key).is_some();
        let list = self.lists.lock().await.remove(key).is_some();
        Ok(counter || list)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let mut keys: Vec<String> = self
            .counters
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        {
            let lists = self.lists.lock().await;
            keys.extend(lists.iter().filter(|(k, l)| k.starts_with(prefix) && !l.is_empty()).map(|(k, _)| k.clone()));
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn commit_dispatch(&self, commit: &DispatchCommit<'_>) -> StoreResult<CommitOutcome> {
        self.check()?;
        let mut lists = self.lists.lock().await;

        let head = lists.get(keys::PENDING).and_then(|l| l.front());
        if head.map(String::as_str) != Some(commit.expected_head) {
            return Ok(CommitOutcome::HeadChanged);
        }

        let cap_key = keys::cap(commit.node);
        let need = commit.cpu_units as i64;
        let cap = self.counter(&cap_key);
        if cap < need {
            return Ok(CommitOutcome::InsufficientCapacity { cap });
        }

        if commit.take_slot {
            let slots = lists.entry(keys::SLOTS.to_string()).or_default();
            match slots.iter().position(|n| n == commit.node) {
                Some(pos) => {
                    slots.remove(pos);
                }
                None => return Ok(CommitOutcome::NoSlotToken),
            }
        }

        let cap_after = {
            let mut entry = self.counters.entry(cap_key).or_insert(0);
            *entry -= need;
            *entry
        };
        *self.counters.entry(keys::run_count(commit.node)).or_insert(0) += 1;
        if let Some(pending) = lists.get_mut(keys::PENDING) {
            pending.pop_front();
        }
        lists
            .entry(keys::node_queue(commit.node))
            .or_default()
            .push_back(commit.assignment.to_string());
        drop(lists);
        self.pushed.notify_waiters();

        Ok(CommitOutcome::Committed { cap_before: cap, cap_after })
    }

    async fn release(&self, release: &Release<'_>) -> StoreResult<ReleaseOutcome> {
        self.check()?;
        let mut lists = self.lists.lock().await;

        let Some(done) = lists.get_mut(keys::DONE) else {
            return Ok(ReleaseOutcome::SignalMoved);
        };
        if done.front().map(String::as_str) != Some(release.signal) {
            return Ok(ReleaseOutcome::SignalMoved);
        }
        done.pop_front();

        let total = self.counters.get(&keys::cap_total(release.node)).map(|v| *v);
        let (cap_after, clamped) = {
            let mut entry = self.counters.entry(keys::cap(release.node)).or_insert(0);
            *entry += release.cpu_units as i64;
            let mut clamped = 0;
            if let Some(total) = total {
                if *entry > total {
                    clamped = *entry - total;
                    *entry = total;
                }
            }
            (*entry, clamped)
        };

        if release.return_slot {
            lists
                .entry(keys::SLOTS.to_string())
                .or_default()
                .push_back(release.node.to_string());
        }

        let mut running = self.counters.entry(keys::run_count(release.node)).or_insert(0);
        *running = (*running - 1).max(0);

        Ok(ReleaseOutcome::Released { cap_after, clamped })
    }
}
