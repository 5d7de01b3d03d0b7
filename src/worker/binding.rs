//! CPU binding strategies applied to each task launch.
//!
//! Exclusive mode pins the child to a core list with `taskset`. Shared mode
//! runs it in a transient systemd scope with `CPUWeight` proportional to its
//! cpu_units. When systemd cannot create scopes the worker falls back to
//! plain unbound execution.

use std::env;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use tracing::{info, warn};

use crate::error::{ConfigError, WorkerError};
use crate::model::Task;
use crate::model::cores::CoreSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    Exclusive,
    Shared,
    None,
}

impl FromStr for BindingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exclusive" | "pin" => Ok(Self::Exclusive),
            "shared" | "weight" => Ok(Self::Shared),
            "none" | "off" => Ok(Self::None),
            _ => Err(ConfigError::UnknownBinding(s.to_string())),
        }
    }
}

impl fmt::Display for BindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exclusive => "exclusive",
            Self::Shared => "shared",
            Self::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Program, arguments and extra environment for one child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Runs the current command line under `prefix` (e.g. `taskset -c 0-1`).
    pub fn wrap(&mut self, prefix: Vec<String>) {
        let mut iter = prefix.into_iter();
        let Some(program) = iter.next() else {
            return;
        };
        let mut args: Vec<String> = iter.collect();
        args.push(std::mem::replace(&mut self.program, program));
        args.append(&mut self.args);
        self.args = args;
    }

    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.clone()).chain(self.args.iter().cloned()).collect()
    }
}

/// Applies a CPU allocation policy to a task's launch.
pub trait CpuBinder: Send + Sync + fmt::Debug {
    fn mode(&self) -> BindingMode;
    fn apply(&self, launch: &mut LaunchSpec, task: &Task, cores: Option<&CoreSet>);
}

#[derive(Debug)]
pub struct ExclusiveBinder {
    taskset: PathBuf,
}

impl ExclusiveBinder {
    pub fn new(taskset: PathBuf) -> Self {
        Self { taskset }
    }

    pub fn detect() -> Result<Self, WorkerError> {
        let taskset = which("taskset").ok_or_else(|| WorkerError::ExecutableNotFound("taskset".to_string()))?;
        Ok(Self::new(taskset))
    }
}

impl CpuBinder for ExclusiveBinder {
    fn mode(&self) -> BindingMode {
        BindingMode::Exclusive
    }

    fn apply(&self, launch: &mut LaunchSpec, task: &Task, cores: Option<&CoreSet>) {
        let Some(cores) = cores else {
            warn!(task_id = %task.task_id, "exclusive mode without a core set, launching unpinned");
            return;
        };
        launch.env.push(("CPUSET".to_string(), cores.to_string()));
        launch.wrap(vec![
            self.taskset.display().to_string(),
            "-c".to_string(),
            cores.to_string(),
        ]);
    }
}

#[derive(Debug)]
pub struct SharedBinder {
    systemd_run: PathBuf,
    weight_per_unit: u32,
}

impl SharedBinder {
    pub fn new(systemd_run: PathBuf, weight_per_unit: u32) -> Self {
        Self {
            systemd_run,
            weight_per_unit,
        }
    }

    /// Probes whether transient scopes with CPUWeight can be created here.
    pub async fn detect(weight_per_unit: u32) -> Option<Self> {
        let systemd_run = which("systemd-run")?;
        let probe = tokio::process::Command::new(&systemd_run)
            .args(["--scope", "--quiet", "-p", "CPUAccounting=1", "-p", "CPUWeight=100", "--", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match probe {
            Ok(status) if status.success() => Some(Self::new(systemd_run, weight_per_unit)),
            Ok(status) => {
                warn!(code = ?status.code(), "systemd-run scope probe failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "systemd-run scope probe failed");
                None
            }
        }
    }

    pub fn weight_for(&self, cpu_units: u32) -> u32 {
        self.weight_per_unit.saturating_mul(cpu_units).clamp(1, 10_000)
    }
}

impl CpuBinder for SharedBinder {
    fn mode(&self) -> BindingMode {
        BindingMode::Shared
    }

    fn apply(&self, launch: &mut LaunchSpec, task: &Task, _cores: Option<&CoreSet>) {
        let weight = self.weight_for(task.cpu_units);
        launch.env.push(("CPU_WEIGHT".to_string(), weight.to_string()));
        launch.wrap(vec![
            self.systemd_run.display().to_string(),
            "--scope".to_string(),
            "--quiet".to_string(),
            "-p".to_string(),
            "CPUAccounting=1".to_string(),
            "-p".to_string(),
            format!("CPUWeight={}", weight),
            "--".to_string(),
        ]);
    }
}

/// Unpinned, unweighted execution.
#[derive(Debug, Default)]
pub struct NoBinder;

impl CpuBinder for NoBinder {
    fn mode(&self) -> BindingMode {
        BindingMode::None
    }

    fn apply(&self, _launch: &mut LaunchSpec, _task: &Task, _cores: Option<&CoreSet>) {}
}

/// Builds the binder for `mode`. Shared mode degrades to `NoBinder` when no
/// fair-share controller is available.
pub async fn binder_for(mode: BindingMode, weight_per_unit: u32) -> Result<Box<dyn CpuBinder>, WorkerError> {
    match mode {
        BindingMode::Exclusive => Ok(Box::new(ExclusiveBinder::detect()?)),
        BindingMode::Shared => match SharedBinder::detect(weight_per_unit).await {
            Some(binder) => {
                info!(weight_per_unit, "shared CPU mode via systemd scopes");
                Ok(Box::new(binder))
            }
            None => {
                warn!("no fair-share CPU controller available, running tasks unbound");
                Ok(Box::new(NoBinder))
            }
        },
        BindingMode::None => Ok(Box::new(NoBinder)),
    }
}

/// Hands out non-overlapping core ranges to concurrently running tasks.
#[derive(Debug, Clone)]
pub struct CoreAllocator {
    busy: Vec<bool>,
}

impl CoreAllocator {
    pub fn new(cores: usize) -> Self {
        Self {
            busy: vec![false; cores],
        }
    }

    pub fn free(&self) -> usize {
        self.busy.iter().filter(|b| !**b).count()
    }

    /// Lowest contiguous free range of `units` cores, else the lowest free
    /// cores in any position. `None` if fewer than `units` are free.
    pub fn allocate(&mut self, units: usize) -> Option<CoreSet> {
        if units == 0 || self.free() < units {
            return None;
        }
        let contiguous = (0..=self.busy.len() - units).find(|start| self.busy[*start..*start + units].iter().all(|b| !*b));
        let cores: Vec<usize> = match contiguous {
            Some(start) => (start..start + units).collect(),
            None => (0..self.busy.len()).filter(|c| !self.busy[*c]).take(units).collect(),
        };
        for core in &cores {
            self.busy[*core] = true;
        }
        Some(CoreSet::from_cores(cores))
    }

    pub fn release(&mut self, cores: &CoreSet) {
        for core in cores.iter() {
            if let Some(slot) = self.busy.get_mut(core) {
                *slot = false;
            }
        }
    }
}

/// Resolves `program` the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn which(program: &str) -> Option<PathBuf> {
    let is_executable = |p: &Path| {
        p.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}
