//! Task generation and paced admission into `q:pending`.

pub mod inputs;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ConfigError, DispatchError, StoreError};
use crate::model::Task;
use crate::model::mix::Mix;
use crate::model::profile::ProfileRegistry;
use crate::store::{CoordinationStore, keys};

pub use self::inputs::discover_inputs;

/// How tasks are spread over time.
#[derive(Debug, Clone, PartialEq)]
pub enum Pacing {
    /// `size` tasks per pulse, `stagger` apart, then `interval` between pulses.
    Pulse {
        size: usize,
        interval: Duration,
        stagger: Duration,
    },
    /// Up to `batch_size` tasks per round, `interval` between rounds.
    Drip { batch_size: usize, interval: Duration },
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub mix: Mix,
    pub total: usize,
    pub seed: u64,
    pub inputs: PathBuf,
    pub outputs: PathBuf,
    /// Input file extension, without the dot.
    pub extension: String,
    pub pacing: Pacing,
    /// Pending depth is never pushed past this. `None` leaves it unbounded.
    pub max_pending: Option<u64>,
    /// How often to re-check depth while the queue is full.
    pub depth_poll: Duration,
    /// Consecutive store failures tolerated per push before giving up.
    pub store_retries: u32,
}

impl DispatcherConfig {
    pub fn validate(&self, registry: &ProfileRegistry) -> Result<(), ConfigError> {
        if self.total == 0 {
            return Err(ConfigError::ZeroTotal);
        }
        self.mix.validate(registry)?;
        match &self.pacing {
            Pacing::Pulse { size: 0, .. } => return Err(ConfigError::Pacing("pulse size must be positive".into())),
            Pacing::Drip { batch_size: 0, .. } => return Err(ConfigError::Pacing("batch size must be positive".into())),
            _ => {}
        }
        if self.max_pending == Some(0) {
            return Err(ConfigError::Pacing("max pending depth must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    pub admitted: usize,
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
}

pub struct Dispatcher {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    registry: ProfileRegistry,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        registry: ProfileRegistry,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
            config,
        }
    }

    /// Builds the full task sequence without touching the store.
    /// `ts_enqueue` is left at 0 until admission.
    pub fn plan(&self) -> Result<Vec<Task>, DispatchError> {
        self.config.validate(&self.registry)?;
        let files = discover_inputs(&self.config.inputs, &self.config.extension)?;
        let sequence = self.config.mix.sample(self.config.total, self.config.seed)?;

        let mut tasks = Vec::with_capacity(sequence.len());
        for (idx, name) in sequence.iter().enumerate() {
            let profile = self
                .registry
                .get(name)
                .ok_or_else(|| ConfigError::UnknownProfile(name.clone()))?;
            let input = &files[idx % files.len()];
            let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("input");
            let output = self.config.outputs.join(format!(
                "{}_{}_{}_{}_n{:04}.mp4",
                stem,
                profile.scale.replace(':', "x"),
                profile.vcodec,
                profile.preset,
                idx
            ));

            tasks.push(Task {
                task_id: Uuid::new_v4(),
                seq: idx as u64,
                profile: profile.name.clone(),
                cpu_units: profile.cpu_units,
                thread_hint: profile.vthreads,
                filter_threads: profile.fthreads,
                affinity_hint: profile.cpuset.clone(),
                input: input.display().to_string(),
                output: output.display().to_string(),
                scale: profile.scale.clone(),
                vcodec: profile.vcodec.clone(),
                preset: profile.preset.clone(),
                crf: profile.crf,
                ts_enqueue: 0,
            });
        }
        Ok(tasks)
    }

    /// Plans and admits every task.
    pub async fn run(&self) -> Result<AdmissionReport, DispatchError> {
        let tasks = self.plan()?;
        info!(
            mix = %self.config.mix,
            total = tasks.len(),
            seed = self.config.seed,
            max_pending = ?self.config.max_pending,
            "dispatching"
        );
        self.admit(tasks).await
    }

    /// Pushes `tasks` onto the pending queue in order, honoring pacing and
    /// the depth cap.
    pub async fn admit(&self, tasks: Vec<Task>) -> Result<AdmissionReport, DispatchError> {
        let mut admission = Admission {
            dispatcher: self,
            report: AdmissionReport::default(),
            last_ts: 0,
        };

        match self.config.pacing.clone() {
            Pacing::Pulse { size, interval, stagger } => {
                let pulses: Vec<&[Task]> = tasks.chunks(size).collect();
                let count = pulses.len();
                for (p, pulse) in pulses.into_iter().enumerate() {
                    for (i, task) in pulse.iter().enumerate() {
                        admission.wait_for_room().await?;
                        admission.push(task.clone()).await?;
                        if i + 1 < pulse.len() && !stagger.is_zero() {
                            self.clock.sleep(stagger).await;
                        }
                    }
                    info!(pulse = pulse.len(), total = admission.report.admitted, "pending pulse enqueued");
                    if p + 1 < count {
                        self.clock.sleep(interval).await;
                    }
                }
            }
            Pacing::Drip { batch_size, interval } => {
                let mut remaining = tasks.into_iter().peekable();
                while remaining.peek().is_some() {
                    let mut depth = admission.depth().await?;
                    let mut sent = 0;
                    while sent < batch_size && self.config.max_pending.is_none_or(|max| depth < max) {
                        let Some(task) = remaining.next() else {
                            break;
                        };
                        admission.push(task).await?;
                        depth += 1;
                        sent += 1;
                    }
                    if sent > 0 {
                        info!(batch = sent, total = admission.report.admitted, depth, "pending batch enqueued");
                    }
                    if remaining.peek().is_some() {
                        self.clock.sleep(interval).await;
                    }
                }
            }
        }

        info!(total = admission.report.admitted, "admission done");
        Ok(admission.report)
    }
}

struct Admission<'a> {
    dispatcher: &'a Dispatcher,
    report: AdmissionReport,
    last_ts: i64,
}

impl Admission<'_> {
    async fn depth(&self) -> Result<u64, DispatchError> {
        let store = &self.dispatcher.store;
        self.retry(|| store.len(keys::PENDING)).await
    }

    async fn wait_for_room(&self) -> Result<(), DispatchError> {
        let Some(max) = self.dispatcher.config.max_pending else {
            return Ok(());
        };
        while self.depth().await? >= max {
            self.dispatcher.clock.sleep(self.dispatcher.config.depth_poll).await;
        }
        Ok(())
    }

    async fn push(&mut self, mut task: Task) -> Result<(), DispatchError> {
        let mut now = self.dispatcher.clock.now_ms();
        if now <= self.last_ts {
            now = self.last_ts + 1;
        }
        self.last_ts = now;
        task.ts_enqueue = now;

        let payload = serde_json::to_string(&task)?;
        let store = &self.dispatcher.store;
        let id = task.task_id.to_string();
        // Keyed on task_id: a retry after a lost reply cannot enqueue twice.
        let depth = self.retry(|| store.push_back_once(keys::PENDING, &id, &payload)).await?;
        if depth.is_none() {
            debug!(task_id = %task.task_id, "task already enqueued by an earlier attempt");
        }

        self.report.admitted += 1;
        self.report.first_ts.get_or_insert(now);
        self.report.last_ts = Some(now);
        info!(
            task_id = %task.task_id,
            seq = task.seq,
            profile = %task.profile,
            cpu_units = task.cpu_units,
            input = %task.input,
            ts_enqueue = now,
            depth = ?depth,
            "admitted"
        );
        Ok(())
    }

    async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, DispatchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let config = &self.dispatcher.config;
        let mut failures = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(StoreError::Unavailable(msg)) if failures < config.store_retries => {
                    failures += 1;
                    let wait = config.depth_poll.saturating_mul(2u32.saturating_pow(failures.min(6)));
                    warn!(error = %msg, failures, backoff_ms = wait.as_millis() as u64, "store unavailable, retrying");
                    self.dispatcher.clock.sleep(wait).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
