pub mod cores;
pub mod mix;
pub mod profile;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn one() -> u32 {
    1
}

/// A unit of work admitted into `q:pending`. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: Uuid,
    /// Position in the generated sequence.
    pub seq: u64,
    pub profile: String,
    #[serde(default = "one")]
    pub cpu_units: u32,
    #[serde(default = "one")]
    pub thread_hint: u32,
    #[serde(default = "one")]
    pub filter_threads: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_hint: Option<String>,
    pub input: String,
    pub output: String,
    pub scale: String,
    pub vcodec: String,
    pub preset: String,
    pub crf: u32,
    /// Epoch milliseconds at admission; strictly increasing per dispatcher run.
    #[serde(default)]
    pub ts_enqueue: i64,
}

/// What the scheduler pushes onto `q:<node>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub task: Task,
    pub node: String,
    /// Whether a slot token was consumed for this dispatch.
    pub slot_held: bool,
    pub ts_dispatch: i64,
}

/// Pushed by a worker onto `q:done` when a task's process has exited (or
/// could not be started). The scheduler turns it into a resource release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionSignal {
    pub task_id: Uuid,
    pub node: String,
    pub cpu_units: u32,
    pub slot_held: bool,
    /// Exit code of the external program; -1 if it never ran or was killed.
    pub status: i32,
}

impl CompletionSignal {
    pub fn for_assignment(assignment: &Assignment, status: i32) -> Self {
        Self {
            task_id: assignment.task.task_id,
            node: assignment.node.clone(),
            cpu_units: assignment.task.cpu_units,
            slot_held: assignment.slot_held,
            status,
        }
    }
}
