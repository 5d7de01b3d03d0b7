use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult, Script};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StoreError;
use crate::store::{
    CommitOutcome, CoordinationStore, DispatchCommit, Release, ReleaseOutcome, StoreResult, keys,
};

// KEYS: pending, cap, run_count, node_queue, slots
// ARGV: expected_head, need, take_slot, node, assignment
const COMMIT_SCRIPT: &str = r#"
local head = redis.call('LINDEX', KEYS[1], 0)
if head ~= ARGV[1] then
    return {-1, 0, 0}
end
local cap = tonumber(redis.call('GET', KEYS[2]) or '0')
local need = tonumber(ARGV[2])
if cap < need then
    return {-2, cap, cap}
end
if ARGV[3] == '1' then
    if redis.call('LREM', KEYS[5], 1, ARGV[4]) == 0 then
        return {-3, cap, cap}
    end
end
local left = redis.call('DECRBY', KEYS[2], need)
redis.call('LPOP', KEYS[1])
redis.call('INCR', KEYS[3])
redis.call('RPUSH', KEYS[4], ARGV[5])
return {1, cap, left}
"#;

// KEYS: done, cap, cap_total, run_count, slots
// ARGV: signal, units, return_slot, node
const RELEASE_SCRIPT: &str = r#"
if redis.call('LINDEX', KEYS[1], 0) ~= ARGV[1] then
    return {-1, 0, 0}
end
redis.call('LPOP', KEYS[1])
local cap = redis.call('INCRBY', KEYS[2], ARGV[2])
local clamped = 0
local total = redis.call('GET', KEYS[3])
if total then
    total = tonumber(total)
    if cap > total then
        clamped = cap - total
        redis.call('SET', KEYS[2], total)
        cap = total
    end
end
if ARGV[3] == '1' then
    redis.call('RPUSH', KEYS[5], ARGV[4])
end
local running = redis.call('DECR', KEYS[4])
if running < 0 then
    redis.call('SET', KEYS[4], 0)
end
return {1, cap, clamped}
"#;

// KEYS: list, marker
// ARGV: value, marker ttl
const PUSH_ONCE_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[2], 1, 'NX', 'EX', ARGV[2]) then
    return -1
end
return redis.call('RPUSH', KEYS[1], ARGV[1])
"#;

const SCAN_COUNT: u64 = 512;

/// Push markers outlive any realistic retry window.
const PUSH_MARKER_TTL_SECS: u64 = 7 * 24 * 3600;

/// Redis-backed coordination store.
///
/// Keeps one multiplexed connection for ordinary commands and a second one
/// for blocking pops so a parked BLPOP never delays a completion push. A
/// connection that fails is dropped and re-opened on the next call.
pub struct RedisStore {
    client: redis::Client,
    shared: Mutex<Option<MultiplexedConnection>>,
    blocking: Mutex<Option<MultiplexedConnection>>,
    commit_script: Script,
    release_script: Script,
    push_once_script: Script,
}

impl RedisStore {
    /// Accepts `redis://[:password@]host:port/db`.
    pub fn open(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self::new(client))
    }

    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            shared: Mutex::new(None),
            blocking: Mutex::new(None),
            commit_script: Script::new(COMMIT_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            push_once_script: Script::new(PUSH_ONCE_SCRIPT),
        }
    }

    async fn connect(&self, slot: &Mutex<Option<MultiplexedConnection>>) -> StoreResult<MultiplexedConnection> {
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn settle<T>(&self, slot: &Mutex<Option<MultiplexedConnection>>, result: RedisResult<T>) -> StoreResult<T> {
        result.map_err(|e| {
            let err = StoreError::from(e);
            if matches!(err, StoreError::Unavailable(_)) {
                if let Ok(mut guard) = slot.try_lock() {
                    *guard = None;
                }
                warn!(error = %err, "redis connection lost, will reconnect");
            }
            err
        })
    }

    async fn conn(&self) -> StoreResult<MultiplexedConnection> {
        self.connect(&self.shared).await
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn push_back(&self, list: &str, value: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let r = conn.rpush(list, value).await;
        self.settle(&self.shared, r)
    }

    async fn push_back_once(&self, list: &str, id: &str, value: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.conn().await?;
        let r: RedisResult<i64> = self
            .push_once_script
            .key(list)
            .key(keys::push_marker(list, id))
            .arg(value)
            .arg(PUSH_MARKER_TTL_SECS)
            .invoke_async(&mut conn)
            .await;
        let len = self.settle(&self.shared, r)?;
        Ok(u64::try_from(len).ok())
    }

    async fn pop_front(&self, list: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let r = conn.lpop(list, None).await;
        self.settle(&self.shared, r)
    }

    async fn pop_front_blocking(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let mut conn = self.connect(&self.blocking).await?;
        let r: RedisResult<Option<(String, String)>> = conn.blpop(list, timeout.as_secs_f64()).await;
        Ok(self.settle(&self.blocking, r)?.map(|(_, v)| v))
    }

    async fn peek_front(&self, list: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let r = conn.lindex(list, 0).await;
        self.settle(&self.shared, r)
    }

    async fn len(&self, list: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let r = conn.llen(list).await;
        self.settle(&self.shared, r)
    }

    async fn range(&self, list: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let r = conn.lrange(list, 0, -1).await;
        self.settle(&self.shared, r)
    }

    async fn remove(&self, list: &str, value: &str, count: u64) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let r = conn.lrem(list, count as isize, value).await;
        self.settle(&self.shared, r)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.conn().await?;
        let r = conn.get(key).await;
        self.settle(&self.shared, r)
    }

    async fn set(&self, key: &str, value: i64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let r = conn.set(key, value).await;
        self.settle(&self.shared, r)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        let r = conn.incr(key, delta).await;
        self.settle(&self.shared, r)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let r: RedisResult<u64> = conn.del(key).await;
        Ok(self.settle(&self.shared, r)? > 0)
    }

    /// Cursor-driven SCAN; never blocks the server the way KEYS does.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let r: RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await;
            let (next, batch) = self.settle(&self.shared, r)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn commit_dispatch(&self, commit: &DispatchCommit<'_>) -> StoreResult<CommitOutcome> {
        let mut conn = self.conn().await?;
        let r: RedisResult<Vec<i64>> = self
            .commit_script
            .key(keys::PENDING)
            .key(keys::cap(commit.node))
            .key(keys::run_count(commit.node))
            .key(keys::node_queue(commit.node))
            .key(keys::SLOTS)
            .arg(commit.expected_head)
            .arg(commit.cpu_units)
            .arg(if commit.take_slot { "1" } else { "0" })
            .arg(commit.node)
            .arg(commit.assignment)
            .invoke_async(&mut conn)
            .await;
        let reply = self.settle(&self.shared, r)?;
        match reply.as_slice() {
            [1, before, after] => Ok(CommitOutcome::Committed { cap_before: *before, cap_after: *after }),
            [-1, _, _] => Ok(CommitOutcome::HeadChanged),
            [-2, cap, _] => Ok(CommitOutcome::InsufficientCapacity { cap: *cap }),
            [-3, _, _] => Ok(CommitOutcome::NoSlotToken),
            other => Err(StoreError::Protocol(format!("unexpected commit reply {:?}", other))),
        }
    }

    async fn release(&self, release: &Release<'_>) -> StoreResult<ReleaseOutcome> {
        let mut conn = self.conn().await?;
        let r: RedisResult<Vec<i64>> = self
            .release_script
            .key(keys::DONE)
            .key(keys::cap(release.node))
            .key(keys::cap_total(release.node))
            .key(keys::run_count(release.node))
            .key(keys::SLOTS)
            .arg(release.signal)
            .arg(release.cpu_units)
            .arg(if release.return_slot { "1" } else { "0" })
            .arg(release.node)
            .invoke_async(&mut conn)
            .await;
        match self.settle(&self.shared, r)?.as_slice() {
            [1, cap_after, clamped] => Ok(ReleaseOutcome::Released {
                cap_after: *cap_after,
                clamped: *clamped,
            }),
            [-1, _, _] => Ok(ReleaseOutcome::SignalMoved),
            other => Err(StoreError::Protocol(format!("unexpected release reply {:?}", other))),
        }
    }
}
