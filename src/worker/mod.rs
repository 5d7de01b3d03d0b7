//! Per-node worker: registers capacity and slot tokens, pops assignments from
//! its own queue, runs the transcoder under the configured CPU binding and
//! reports every exit back on `q:done`.

pub mod binding;
pub mod process;
pub mod record;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ConfigError, StoreError, WorkerError};
use crate::model::cores::CoreSet;
use crate::model::{Assignment, CompletionSignal, Task};
use crate::store::{CoordinationStore, StoreResult, keys};

pub use self::binding::{BindingMode, CoreAllocator, CpuBinder, LaunchSpec, NoBinder, binder_for, which};
pub use self::process::ProcessExit;
pub use self::record::{CompletionRecord, EventSink};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub node_id: String,
    /// Explicit capacity; otherwise `floor(allocation_ratio * logical cores)`.
    pub capacity: Option<u32>,
    pub allocation_ratio: f64,
    /// Concurrency slots. 0 disables slot tokens.
    pub parallel: u32,
    pub reset_capacity: bool,
    pub purge_stale_slots: bool,
    pub clear_queue: bool,
    pub binding: BindingMode,
    pub cpuweight_per_vcpu: u32,
    pub executable: String,
    pub events: Option<PathBuf>,
    pub run_id: Option<String>,
    pub pop_timeout: Duration,
    pub max_backoff: Duration,
    /// Overrides the detected core count.
    pub logical_cores: Option<usize>,
}

impl WorkerConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            capacity: None,
            allocation_ratio: 1.0,
            parallel: 0,
            reset_capacity: false,
            purge_stale_slots: false,
            clear_queue: false,
            binding: BindingMode::None,
            cpuweight_per_vcpu: 100,
            executable: "ffmpeg".to_string(),
            events: None,
            run_id: None,
            pop_timeout: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            logical_cores: None,
        }
    }

    pub fn logical_cores(&self) -> usize {
        self.logical_cores
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }

    pub fn resolved_capacity(&self) -> Result<u32, ConfigError> {
        if let Some(capacity) = self.capacity {
            if capacity == 0 {
                return Err(ConfigError::Capacity("capacity override must be positive".into()));
            }
            return Ok(capacity);
        }
        if !self.allocation_ratio.is_finite() || self.allocation_ratio <= 0.0 {
            return Err(ConfigError::Capacity(format!(
                "allocation ratio {} must be a positive number",
                self.allocation_ratio
            )));
        }
        let capacity = (self.allocation_ratio * self.logical_cores() as f64).floor();
        if capacity < 1.0 {
            return Err(ConfigError::Capacity(format!(
                "allocation ratio {} over {} cores leaves no capacity",
                self.allocation_ratio,
                self.logical_cores()
            )));
        }
        Ok(capacity.min(u32::MAX as f64) as u32)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let id = self.node_id.as_str();
        // Node queues share the `q:` namespace with the global lists.
        if id.trim().is_empty() || id.contains(char::is_whitespace) || matches!(id, "pending" | "done" | "rejected") {
            return Err(ConfigError::NodeId(self.node_id.clone()));
        }
        self.resolved_capacity()?;
        Ok(())
    }

    /// Exclusive pinning with slots hands each running task its own cores,
    /// which only works while capacity does not exceed the core count.
    pub fn validate_pinning(&self) -> Result<(), ConfigError> {
        let capacity = self.resolved_capacity()? as usize;
        let cores = self.logical_cores();
        if self.parallel > 0 && capacity > cores {
            return Err(ConfigError::Capacity(format!(
                "exclusive binding with slots needs capacity <= {} logical cores, got {}",
                cores, capacity
            )));
        }
        Ok(())
    }
}

/// State written to the store at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub cap_total: i64,
    pub cap: i64,
    pub slots_total: i64,
    pub tokens_pushed: u64,
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    executable: PathBuf,
    binder: Arc<dyn CpuBinder>,
    cores: Mutex<CoreAllocator>,
    events: Option<EventSink>,
}

pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    /// Resolves the executable and the CPU binder. A missing executable is fatal.
    pub async fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let binder: Arc<dyn CpuBinder> = Arc::from(binder_for(config.binding, config.cpuweight_per_vcpu).await?);
        Self::with_binder(store, clock, config, binder)
    }

    pub fn with_binder(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
        binder: Arc<dyn CpuBinder>,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        if binder.mode() == BindingMode::Exclusive {
            config.validate_pinning()?;
        }
        let executable =
            which(&config.executable).ok_or_else(|| WorkerError::ExecutableNotFound(config.executable.clone()))?;
        let cores = Mutex::new(CoreAllocator::new(config.logical_cores()));
        let events = config.events.clone().map(EventSink::new);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                clock,
                config,
                executable,
                binder,
                cores,
                events,
            }),
        })
    }

    pub fn binding(&self) -> BindingMode {
        self.inner.binder.mode()
    }

    /// Publishes this node's capacity and slot tokens.
    ///
    /// `cap_total` is always rewritten. `cap` is initialised when absent or
    /// when `reset_capacity` is set, and clamped to the new total otherwise.
    /// Tokens are topped up to `parallel` for this node.
    pub async fn register(&self) -> Result<Registration, WorkerError> {
        let inner = &self.inner;
        let config = &inner.config;
        let node = config.node_id.as_str();
        let capacity = config.resolved_capacity()? as i64;
        let cap_key = keys::cap(node);
        let total_key = keys::cap_total(node);
        let run_key = keys::run_count(node);
        let slots_key = keys::slots_total(node);

        inner.retry(|| inner.store.set(&total_key, capacity)).await?;

        let existing = inner.retry(|| inner.store.get(&cap_key)).await?;
        let cap = match existing {
            Some(cap) if !config.reset_capacity => {
                if cap > capacity {
                    warn!(node, cap, cap_total = capacity, "stale capacity above total, clamping");
                    inner.retry(|| inner.store.set(&cap_key, capacity)).await?;
                    capacity
                } else {
                    cap
                }
            }
            _ => {
                inner.retry(|| inner.store.set(&cap_key, capacity)).await?;
                capacity
            }
        };
        if config.reset_capacity {
            inner.retry(|| inner.store.set(&run_key, 0)).await?;
        }

        if config.purge_stale_slots {
            let purged = inner.retry(|| inner.store.remove(keys::SLOTS, node, 0)).await?;
            if purged > 0 {
                info!(node, purged, "purged stale slot tokens");
            }
        }
        if config.clear_queue {
            let queue = keys::node_queue(node);
            let dropped = inner.retry(|| inner.store.len(&queue)).await?;
            inner.retry(|| inner.store.delete(&queue)).await?;
            if dropped > 0 {
                warn!(node, dropped, "cleared node queue");
            }
        }

        let slots_total = config.parallel as i64;
        inner.retry(|| inner.store.set(&slots_key, slots_total)).await?;
        let mut tokens_pushed = 0;
        if config.parallel > 0 {
            let pool = inner.retry(|| inner.store.range(keys::SLOTS)).await?;
            let present = pool.iter().filter(|t| t.as_str() == node).count() as u64;
            for _ in present..config.parallel as u64 {
                inner.retry(|| inner.store.push_back(keys::SLOTS, node)).await?;
                tokens_pushed += 1;
            }
        }

        info!(
            node,
            cap_total = capacity,
            cap,
            slots = slots_total,
            tokens_pushed,
            binding = %inner.binder.mode(),
            executable = %inner.executable.display(),
            "worker registered"
        );
        Ok(Registration {
            cap_total: capacity,
            cap,
            slots_total,
            tokens_pushed,
        })
    }

    /// Pops and executes assignments until `shutdown` flips to true, then
    /// waits for every in-flight task to finish. Children are never killed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let inner = &self.inner;
        let queue = keys::node_queue(&inner.config.node_id);
        let permits = (inner.config.parallel > 0).then(|| Arc::new(Semaphore::new(inner.config.parallel as usize)));
        let mut inflight = JoinSet::new();
        let mut failures: u32 = 0;

        info!(node = %inner.config.node_id, queue = %queue, parallel = inner.config.parallel, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = inflight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "task supervisor panicked");
                }
            }

            let permit = match &permits {
                Some(sem) => tokio::select! {
                    permit = sem.clone().acquire_owned() => Some(permit?),
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                },
                None => None,
            };

            // Not raced against shutdown: a BLPOP dropped mid-flight can lose
            // the element it already removed.
            match inner.store.pop_front_blocking(&queue, inner.config.pop_timeout).await {
                Ok(Some(raw)) => {
                    failures = 0;
                    match serde_json::from_str::<Assignment>(&raw) {
                        Ok(assignment) => {
                            let inner = Arc::clone(inner);
                            inflight.spawn(async move {
                                let _permit = permit;
                                inner.execute(assignment).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, payload = %raw, "undecodable assignment, moving to rejected");
                            if let Err(e) = inner.retry(|| inner.store.push_back(keys::REJECTED, &raw)).await {
                                error!(error = %e, payload = %raw, "failed to record rejected assignment");
                            }
                        }
                    }
                }
                Ok(None) => failures = 0,
                Err(e) => {
                    failures += 1;
                    let wait = backoff(inner.config.pop_timeout, failures, inner.config.max_backoff);
                    warn!(error = %e, failures, backoff_ms = wait.as_millis() as u64, "queue pop failed");
                    tokio::select! {
                        _ = inner.clock.sleep(wait) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        if !inflight.is_empty() {
            info!(in_flight = inflight.len(), "draining in-flight tasks");
        }
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task supervisor panicked");
            }
        }
        info!(node = %inner.config.node_id, "worker stopped");
        Ok(())
    }

    /// Runs one assignment to completion and reports it. Exposed for
    /// callers that pop on their own.
    pub async fn execute(&self, assignment: Assignment) -> CompletionRecord {
        self.inner.execute(assignment).await
    }
}

impl Inner {
    async fn execute(&self, assignment: Assignment) -> CompletionRecord {
        let task = &assignment.task;
        let node = self.config.node_id.as_str();
        if assignment.node != node {
            warn!(task_id = %task.task_id, assigned = %assignment.node, node, "assignment addressed to another node");
        }

        let mut record = CompletionRecord {
            trace_id: Uuid::new_v4(),
            task_id: task.task_id,
            pid: None,
            node: assignment.node.clone(),
            profile: task.profile.clone(),
            input: Some(task.input.clone()),
            output: Some(task.output.clone()),
            cpuset: None,
            binding: self.binder.mode().to_string(),
            cpu_units: task.cpu_units,
            ts_enqueue: task.ts_enqueue,
            ts_dispatch: assignment.ts_dispatch,
            ts_start: 0,
            ts_end: 0,
            bytes_in: 0,
            bytes_out: 0,
            status: -1,
        };

        let input = Path::new(&task.input);
        match tokio::fs::metadata(input).await {
            Ok(meta) if meta.is_file() => {
                record.bytes_in = meta.len();
                self.launch(&assignment, &mut record).await;
            }
            _ => {
                let now = self.clock.now_ms();
                record.ts_start = now;
                record.ts_end = now;
                error!(task_id = %task.task_id, input = %task.input, "input file missing, failing task");
            }
        }

        self.report(&assignment, record.status).await;
        if let Some(events) = &self.events {
            if let Err(e) = events.append(&record).await {
                error!(error = %e, task_id = %task.task_id, path = %events.path().display(), "failed to append completion record");
            }
        }
        record
    }

    async fn launch(&self, assignment: &Assignment, record: &mut CompletionRecord) {
        let task = &assignment.task;
        if let Some(parent) = Path::new(&task.output).parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, dir = %parent.display(), "failed to create output directory");
            }
        }

        let (cores, allocated) = self.cores_for(task, assignment.slot_held);
        record.cpuset = cores.as_ref().map(|c| c.to_string());

        let mut launch = self.launch_spec(assignment, record.trace_id);
        self.binder.apply(&mut launch, task, cores.as_ref());
        debug!(task_id = %task.task_id, command = ?launch.command_line(), "launching");

        match process::run(&launch, self.clock.as_ref()).await {
            Ok(exit) => {
                record.pid = Some(exit.pid);
                record.ts_start = exit.ts_start;
                record.ts_end = exit.ts_end;
                record.status = exit.status;
                record.bytes_out = tokio::fs::metadata(&task.output).await.map(|m| m.len()).unwrap_or(0);
                if exit.success() {
                    info!(
                        task_id = %task.task_id,
                        node = %assignment.node,
                        pid = exit.pid,
                        cpuset = ?record.cpuset,
                        elapsed_ms = exit.ts_end - exit.ts_start,
                        "task finished"
                    );
                } else {
                    warn!(
                        task_id = %task.task_id,
                        node = %assignment.node,
                        pid = exit.pid,
                        status = exit.status,
                        "task failed"
                    );
                }
            }
            Err(e) => {
                let now = self.clock.now_ms();
                record.ts_start = now;
                record.ts_end = now;
                error!(error = %e, task_id = %task.task_id, program = %launch.program, "failed to spawn task");
            }
        }

        if let Some(cores) = allocated {
            if let Ok(mut allocator) = self.cores.lock() {
                allocator.release(&cores);
            }
        }
    }

    /// Core set for exclusive mode. The second value is set when the cores
    /// came from the allocator and must be handed back.
    fn cores_for(&self, task: &Task, slot_held: bool) -> (Option<CoreSet>, Option<CoreSet>) {
        if self.binder.mode() != BindingMode::Exclusive {
            return (None, None);
        }
        let units = task.cpu_units.max(1) as usize;
        if self.config.parallel > 0 || slot_held {
            let allocated = self.cores.lock().ok().and_then(|mut a| a.allocate(units));
            match allocated {
                Some(cores) => return (Some(cores.clone()), Some(cores)),
                // Only reachable when the node's counters disagree with what runs here.
                None => warn!(task_id = %task.task_id, units, "no free core range, using profile default"),
            }
        }
        let fixed = task
            .affinity_hint
            .as_deref()
            .and_then(|hint| match hint.parse::<CoreSet>() {
                Ok(cores) => Some(cores),
                Err(e) => {
                    warn!(error = %e, task_id = %task.task_id, "ignoring affinity hint");
                    None
                }
            })
            .unwrap_or_else(|| CoreSet::range(0, units));
        (Some(fixed), None)
    }

    fn launch_spec(&self, assignment: &Assignment, trace_id: Uuid) -> LaunchSpec {
        let task = &assignment.task;
        let codec = match task.vcodec.to_lowercase().as_str() {
            "h264" | "x264" | "libx264" => "libx264".to_string(),
            "hevc" | "h265" | "x265" | "libx265" => "libx265".to_string(),
            other => other.to_string(),
        };

        let mut launch = LaunchSpec::new(self.executable.display().to_string());
        launch.args = vec![
            "-y".to_string(),
            "-i".to_string(),
            task.input.clone(),
            "-vf".to_string(),
            format!("scale={}", task.scale),
            "-filter_threads".to_string(),
            task.filter_threads.to_string(),
            "-c:v".to_string(),
            codec,
            "-preset".to_string(),
            task.preset.clone(),
            "-crf".to_string(),
            task.crf.to_string(),
            "-threads".to_string(),
            task.thread_hint.to_string(),
            "-c:a".to_string(),
            "copy".to_string(),
            task.output.clone(),
        ];
        launch.env.push(("NODE_ID".to_string(), assignment.node.clone()));
        launch.env.push(("TS_ENQUEUE".to_string(), task.ts_enqueue.to_string()));
        launch.env.push(("TRACE_ID".to_string(), trace_id.to_string()));
        if let Some(run_id) = &self.config.run_id {
            launch.env.push(("RUN_ID".to_string(), run_id.clone()));
        }
        launch
    }

    /// Pushes the completion signal, retrying for as long as the store is
    /// unreachable.
    async fn report(&self, assignment: &Assignment, status: i32) {
        let signal = CompletionSignal::for_assignment(assignment, status);
        let payload = match serde_json::to_string(&signal) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, task_id = %signal.task_id, "failed to encode completion signal");
                return;
            }
        };
        let id = signal.task_id.to_string();
        match self.retry(|| self.store.push_back_once(keys::DONE, &id, &payload)).await {
            Ok(Some(_)) => debug!(task_id = %signal.task_id, status, "completion signalled"),
            Ok(None) => debug!(task_id = %signal.task_id, "completion already signalled"),
            Err(e) => error!(error = %e, payload = %payload, "completion signal lost"),
        }
    }

    /// Retries `op` with backoff while the store is unavailable. Other
    /// errors are returned immediately.
    async fn retry<T, F, Fut>(&self, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        let mut failures = 0u32;
        loop {
            match op().await {
                Err(StoreError::Unavailable(msg)) => {
                    failures += 1;
                    let wait = backoff(Duration::from_millis(100), failures, self.config.max_backoff);
                    warn!(error = %msg, failures, backoff_ms = wait.as_millis() as u64, "store unavailable, retrying");
                    self.clock.sleep(wait).await;
                }
                other => return other,
            }
        }
    }
}

fn backoff(base: Duration, failures: u32, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(failures.min(8))).min(max)
}

/// Default node identity: the kernel hostname, else `$HOSTNAME`.
pub fn hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
}
