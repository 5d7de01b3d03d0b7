//! Central scheduler: strict-FIFO admission from `q:pending` with first-fit
//! (or weighted) placement onto per-node queues, plus resource release for
//! completion signals arriving on `q:done`.
//!
//! Only the head of the pending queue is ever considered. While it is
//! infeasible nothing behind it moves (head-of-line blocking). Exactly one
//! scheduler may run against a store at a time.

pub mod placement;
pub mod weigher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::model::{Assignment, CompletionSignal, Task};
use crate::store::{CommitOutcome, CoordinationStore, DispatchCommit, Release, ReleaseOutcome, StoreResult, keys};

pub use self::placement::{ClusterView, NodeView, Placement, PlacementMode, place};
pub use self::weigher::{WeighOrder, Weigher, WeigherKind};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub weigher: Option<Weigher>,
    /// Sleep when the pending queue is empty or its head is infeasible.
    pub poll_interval: Duration,
    /// Upper bound for the backoff while the store is unreachable.
    pub max_backoff: Duration,
    /// Completion signals processed per cycle before looking at the head.
    pub completions_per_tick: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weigher: None,
            poll_interval: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            completions_per_tick: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Pending queue empty.
    Idle,
    /// Head task fits nowhere right now.
    Blocked { task_id: Uuid, cpu_units: u32 },
    Dispatched {
        task_id: Uuid,
        node: String,
        cap_before: i64,
        cap_after: i64,
        mode: PlacementMode,
    },
    /// State moved between snapshot and commit; evaluate again.
    Retry,
    /// Head was not a decodable task and was moved to `q:rejected`.
    Rejected,
}

pub struct Scheduler {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    blocked_on: Option<Uuid>,
}

fn backoff(base: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(8));
    base.saturating_mul(factor).min(max)
}

impl Scheduler {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            store,
            clock,
            config,
            blocked_on: None,
        }
    }

    /// One dispatch cycle: apply pending completions, then try the head.
    pub async fn tick(&mut self) -> StoreResult<TickOutcome> {
        self.drain_completions().await?;
        self.dispatch_head().await
    }

    /// Applies up to `completions_per_tick` completion signals. Returns how
    /// many were released.
    pub async fn drain_completions(&self) -> StoreResult<usize> {
        let mut released = 0;
        while released < self.config.completions_per_tick {
            let Some(raw) = self.store.peek_front(keys::DONE).await? else {
                break;
            };
            let signal: CompletionSignal = match serde_json::from_str(&raw) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, payload = %raw, "undecodable completion signal, moving to rejected");
                    if self.store.remove(keys::DONE, &raw, 1).await? > 0 {
                        self.store.push_back(keys::REJECTED, &raw).await?;
                    }
                    continue;
                }
            };

            // Pops the signal in the same atomic step, so a lost reply can
            // never apply it twice.
            let outcome = self
                .store
                .release(&Release {
                    signal: &raw,
                    node: &signal.node,
                    cpu_units: signal.cpu_units,
                    return_slot: signal.slot_held,
                })
                .await?;
            let ReleaseOutcome::Released { cap_after, clamped } = outcome else {
                debug!(task_id = %signal.task_id, "completion signal already consumed");
                continue;
            };
            released += 1;

            info!(
                task_id = %signal.task_id,
                node = %signal.node,
                cpu_units = signal.cpu_units,
                status = signal.status,
                slot_returned = signal.slot_held,
                cap_after,
                "released"
            );
            if clamped > 0 {
                warn!(node = %signal.node, clamped, "release would exceed cap_total; capacity clamped");
            }
        }
        Ok(released)
    }

    async fn dispatch_head(&mut self) -> StoreResult<TickOutcome> {
        let Some(raw) = self.store.peek_front(keys::PENDING).await? else {
            self.blocked_on = None;
            return Ok(TickOutcome::Idle);
        };

        let task: Task = match serde_json::from_str::<Task>(&raw) {
            Ok(task) if task.cpu_units > 0 => task,
            Ok(task) => {
                error!(task_id = %task.task_id, "pending task declares zero cpu_units, moving to rejected");
                return self.reject_head(&raw).await;
            }
            Err(e) => {
                error!(error = %e, payload = %raw, "undecodable pending task, moving to rejected");
                return self.reject_head(&raw).await;
            }
        };

        let view = ClusterView::read(self.store.as_ref()).await?;
        let need = task.cpu_units as i64;
        let Some(placement) = place(&view, need, self.config.weigher.as_ref()) else {
            if self.blocked_on != Some(task.task_id) {
                info!(
                    task_id = %task.task_id,
                    seq = task.seq,
                    cpu_units = task.cpu_units,
                    nodes = view.nodes.len(),
                    "head task infeasible, holding queue"
                );
                self.blocked_on = Some(task.task_id);
            }
            return Ok(TickOutcome::Blocked {
                task_id: task.task_id,
                cpu_units: task.cpu_units,
            });
        };
        self.blocked_on = None;

        if placement.mode == PlacementMode::Fallback {
            warn!(
                task_id = %task.task_id,
                node = %placement.node,
                pooled_tokens = view.pooled_tokens(),
                stale_tokens = view.stale_tokens,
                "no node has a usable slot token, dispatching on capacity only"
            );
        }

        let assignment = Assignment {
            task: task.clone(),
            node: placement.node.clone(),
            slot_held: placement.take_slot(),
            ts_dispatch: self.clock.now_ms(),
        };
        let payload = serde_json::to_string(&assignment).map_err(|e| StoreError::Protocol(e.to_string()))?;

        let outcome = self
            .store
            .commit_dispatch(&DispatchCommit {
                node: &placement.node,
                expected_head: &raw,
                cpu_units: task.cpu_units,
                take_slot: placement.take_slot(),
                assignment: &payload,
            })
            .await?;

        match outcome {
            CommitOutcome::Committed { cap_before, cap_after } => {
                info!(
                    task_id = %task.task_id,
                    seq = task.seq,
                    profile = %task.profile,
                    node = %placement.node,
                    cpu_units = task.cpu_units,
                    cap_before,
                    cap_after,
                    slot = placement.take_slot(),
                    input = %task.input,
                    "dispatched"
                );
                Ok(TickOutcome::Dispatched {
                    task_id: task.task_id,
                    node: placement.node,
                    cap_before,
                    cap_after,
                    mode: placement.mode,
                })
            }
            other => {
                debug!(task_id = %task.task_id, node = %placement.node, outcome = ?other, "commit lost a race");
                Ok(TickOutcome::Retry)
            }
        }
    }

    async fn reject_head(&mut self, raw: &str) -> StoreResult<TickOutcome> {
        self.blocked_on = None;
        if let Some(popped) = self.store.pop_front(keys::PENDING).await? {
            self.store.push_back(keys::REJECTED, &popped).await?;
            if popped != raw {
                warn!("pending head changed while rejecting; moved the new head instead");
            }
        }
        Ok(TickOutcome::Rejected)
    }

    /// Runs dispatch cycles until `shutdown` flips to true. Store failures
    /// halt dispatching and are retried with exponential backoff.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            weigher = %self.config.weigher.map(|w| w.to_string()).unwrap_or_else(|| "first-fit".to_string()),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "central scheduler started"
        );
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.tick().await {
                Ok(TickOutcome::Dispatched { .. } | TickOutcome::Retry | TickOutcome::Rejected) => {
                    failures = 0;
                    Duration::ZERO
                }
                Ok(TickOutcome::Idle | TickOutcome::Blocked { .. }) => {
                    failures = 0;
                    self.config.poll_interval
                }
                Err(e) => {
                    failures += 1;
                    let wait = backoff(self.config.poll_interval, failures, self.config.max_backoff);
                    warn!(error = %e, failures, backoff_ms = wait.as_millis() as u64, "store error, dispatch halted");
                    wait
                }
            };

            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = self.clock.sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("stopping central scheduler");
        Ok(())
    }
}
