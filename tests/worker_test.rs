mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use tracekit::clock::{ManualClock, SystemClock};
use tracekit::error::{ConfigError, WorkerError};
use tracekit::model::cores::CoreSet;
use tracekit::model::{Assignment, CompletionSignal, Task};
use tracekit::scheduler::{Scheduler, SchedulerConfig, TickOutcome};
use tracekit::store::{CoordinationStore, InMemoryStore, keys};
use tracekit::worker::binding::{ExclusiveBinder, SharedBinder};
use tracekit::worker::{
    BindingMode, CompletionRecord, CoreAllocator, CpuBinder, LaunchSpec, NoBinder, Worker, WorkerConfig,
};

use common::LossyStore;

fn task(input: &Path, output: &Path, cpu_units: u32) -> Task {
    Task {
        task_id: Uuid::new_v4(),
        seq: 0,
        profile: "fast1080p".to_string(),
        cpu_units,
        thread_hint: 2,
        filter_threads: 2,
        affinity_hint: None,
        input: input.display().to_string(),
        output: output.display().to_string(),
        scale: "1920:1080".to_string(),
        vcodec: "h264".to_string(),
        preset: "fast".to_string(),
        crf: 28,
        ts_enqueue: 42,
    }
}

fn assignment(task: Task, node: &str) -> Assignment {
    Assignment {
        task,
        node: node.to_string(),
        slot_held: false,
        ts_dispatch: 50,
    }
}

fn worker_config(node: &str, executable: &str) -> WorkerConfig {
    WorkerConfig {
        capacity: Some(4),
        executable: executable.to_string(),
        pop_timeout: Duration::from_millis(50),
        logical_cores: Some(4),
        ..WorkerConfig::new(node)
    }
}

fn worker(store: Arc<InMemoryStore>, config: WorkerConfig) -> Worker {
    Worker::with_binder(store, Arc::new(ManualClock::new(1_000)), config, Arc::new(NoBinder)).unwrap()
}

async fn signals(store: &InMemoryStore) -> Vec<CompletionSignal> {
    store
        .range(keys::DONE)
        .await
        .unwrap()
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap())
        .collect()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[derive(Debug, Default)]
struct RecordingBinder {
    seen: Mutex<Vec<Option<String>>>,
}

impl CpuBinder for RecordingBinder {
    fn mode(&self) -> BindingMode {
        BindingMode::Exclusive
    }

    fn apply(&self, _launch: &mut LaunchSpec, _task: &Task, cores: Option<&CoreSet>) {
        self.seen.lock().unwrap().push(cores.map(|c| c.to_string()));
    }
}

#[tokio::test]
async fn test_register_publishes_capacity_and_slots() {
    let store = Arc::new(InMemoryStore::new());
    let config = WorkerConfig {
        parallel: 2,
        ..worker_config("vm1", "/bin/true")
    };
    let registration = worker(store.clone(), config).register().await.unwrap();

    assert_eq!(registration.cap_total, 4);
    assert_eq!(registration.cap, 4);
    assert_eq!(registration.tokens_pushed, 2);
    assert_eq!(store.get(&keys::cap("vm1")).await.unwrap(), Some(4));
    assert_eq!(store.get(&keys::cap_total("vm1")).await.unwrap(), Some(4));
    assert_eq!(store.get(&keys::slots_total("vm1")).await.unwrap(), Some(2));
    assert_eq!(store.range(keys::SLOTS).await.unwrap(), vec!["vm1", "vm1"]);
}

#[tokio::test]
async fn test_register_keeps_existing_capacity_without_reset() {
    let store = Arc::new(InMemoryStore::new());
    let config = WorkerConfig {
        parallel: 2,
        ..worker_config("vm1", "/bin/true")
    };
    worker(store.clone(), config.clone()).register().await.unwrap();
    store.set(&keys::cap("vm1"), 1).await.unwrap();

    let again = worker(store.clone(), config).register().await.unwrap();
    assert_eq!(again.cap, 1);
    assert_eq!(again.tokens_pushed, 0);
    assert_eq!(store.len(keys::SLOTS).await.unwrap(), 2);
}

#[tokio::test]
async fn test_register_reset_purge_and_clear() {
    let store = Arc::new(InMemoryStore::new());
    store.set(&keys::cap("vm1"), 9).await.unwrap();
    store.set(&keys::run_count("vm1"), 3).await.unwrap();
    for token in ["vm1", "ghost", "vm1", "vm1"] {
        store.push_back(keys::SLOTS, token).await.unwrap();
    }
    store.push_back(&keys::node_queue("vm1"), "leftover").await.unwrap();

    let config = WorkerConfig {
        parallel: 1,
        reset_capacity: true,
        purge_stale_slots: true,
        clear_queue: true,
        ..worker_config("vm1", "/bin/true")
    };
    worker(store.clone(), config).register().await.unwrap();

    assert_eq!(store.get(&keys::cap("vm1")).await.unwrap(), Some(4));
    assert_eq!(store.get(&keys::run_count("vm1")).await.unwrap(), Some(0));
    assert_eq!(store.range(keys::SLOTS).await.unwrap(), vec!["ghost", "vm1"]);
    assert_eq!(store.len(&keys::node_queue("vm1")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_register_clamps_stale_capacity() {
    let store = Arc::new(InMemoryStore::new());
    store.set(&keys::cap("vm1"), 16).await.unwrap();

    let registration = worker(store.clone(), worker_config("vm1", "/bin/true")).register().await.unwrap();
    assert_eq!(registration.cap, 4);
    assert_eq!(store.get(&keys::cap("vm1")).await.unwrap(), Some(4));
}

#[test]
fn test_capacity_from_allocation_ratio() {
    let config = WorkerConfig {
        allocation_ratio: 0.75,
        logical_cores: Some(8),
        ..WorkerConfig::new("vm1")
    };
    assert_eq!(config.resolved_capacity().unwrap(), 6);

    let override_wins = WorkerConfig {
        capacity: Some(3),
        ..config.clone()
    };
    assert_eq!(override_wins.resolved_capacity().unwrap(), 3);

    let too_small = WorkerConfig {
        allocation_ratio: 0.1,
        logical_cores: Some(4),
        ..WorkerConfig::new("vm1")
    };
    assert!(matches!(too_small.resolved_capacity(), Err(ConfigError::Capacity(_))));
}

#[test]
fn test_reserved_node_ids_rejected() {
    for id in ["", "pending", "done", "rejected", "vm 1"] {
        assert!(matches!(
            WorkerConfig::new(id).validate(),
            Err(ConfigError::NodeId(_))
        ));
    }
}

#[test]
fn test_missing_executable_is_fatal() {
    let store = Arc::new(InMemoryStore::new());
    let result = Worker::with_binder(
        store,
        Arc::new(ManualClock::new(0)),
        worker_config("vm1", "definitely-not-a-transcoder"),
        Arc::new(NoBinder),
    );
    assert!(matches!(result, Err(WorkerError::ExecutableNotFound(name)) if name == "definitely-not-a-transcoder"));
}

#[tokio::test]
async fn test_unbound_mode_uses_no_binder() {
    let store = Arc::new(InMemoryStore::new());
    let w = Worker::new(store, Arc::new(ManualClock::new(0)), worker_config("vm1", "/bin/true"))
        .await
        .unwrap();
    assert_eq!(w.binding(), BindingMode::None);
}

#[tokio::test]
async fn test_execute_success_reports_completion() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"0123456789").unwrap();
    let store = Arc::new(InMemoryStore::new());
    let w = worker(store.clone(), worker_config("vm1", "/bin/true"));

    let t = task(&input, &dir.path().join("out/o.mp4"), 2);
    let record = w.execute(assignment(t.clone(), "vm1")).await;

    assert_eq!(record.status, 0);
    assert!(record.pid.is_some());
    assert!(record.ts_start <= record.ts_end);
    assert_eq!(record.bytes_in, 10);
    assert_eq!(record.ts_enqueue, 42);
    assert!(dir.path().join("out").is_dir());

    let done = signals(&store).await;
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].task_id, t.task_id);
    assert_eq!(done[0].cpu_units, 2);
    assert_eq!(done[0].status, 0);
}

#[tokio::test]
async fn test_execute_failure_still_releases() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"x").unwrap();
    let store = Arc::new(InMemoryStore::new());
    let w = worker(store.clone(), worker_config("vm1", "/bin/false"));
    w.register().await.unwrap();
    // State after the scheduler committed a 1-unit task to vm1.
    store.set(&keys::cap("vm1"), 3).await.unwrap();
    store.set(&keys::run_count("vm1"), 1).await.unwrap();

    let record = w.execute(assignment(task(&input, &dir.path().join("o.mp4"), 1), "vm1")).await;

    assert_eq!(record.status, 1);
    let done = signals(&store).await;
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, 1);

    let mut scheduler = Scheduler::new(store.clone(), Arc::new(ManualClock::new(2_000)), SchedulerConfig::default());
    assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Idle);
    assert_eq!(store.get(&keys::cap("vm1")).await.unwrap(), Some(4));
    assert_eq!(store.get(&keys::run_count("vm1")).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_completion_waits_for_store_to_return() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"x").unwrap();
    let store = Arc::new(InMemoryStore::new());
    let config = WorkerConfig {
        max_backoff: Duration::from_millis(20),
        ..worker_config("vm1", "/bin/true")
    };
    let w = Worker::with_binder(store.clone(), Arc::new(SystemClock), config, Arc::new(NoBinder)).unwrap();

    store.set_offline(true);
    let a = assignment(task(&input, &dir.path().join("o.mp4"), 1), "vm1");
    let handle = tokio::spawn(async move { w.execute(a).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());

    store.set_offline(false);
    let record = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(record.status, 0);
    let done = signals(&store).await;
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].task_id, record.task_id);
}

#[tokio::test]
async fn test_lost_completion_reply_signals_once() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"x").unwrap();
    let store = Arc::new(LossyStore::new());
    store.lose_push_replies(1);
    let w = Worker::with_binder(
        store.clone(),
        Arc::new(ManualClock::new(1_000)),
        worker_config("vm1", "/bin/true"),
        Arc::new(NoBinder),
    )
    .unwrap();

    w.execute(assignment(task(&input, &dir.path().join("o.mp4"), 1), "vm1")).await;

    assert_eq!(signals(&store.inner).await.len(), 1);
}

#[tokio::test]
async fn test_missing_input_fails_without_launch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let w = worker(store.clone(), worker_config("vm1", "/bin/true"));

    let record = w
        .execute(assignment(task(&dir.path().join("nope.mp4"), &dir.path().join("o.mp4"), 1), "vm1"))
        .await;

    assert_eq!(record.status, -1);
    assert_eq!(record.pid, None);
    assert_eq!(signals(&store).await[0].status, -1);
}

#[tokio::test]
async fn test_launch_arguments_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"x").unwrap();
    let script = write_script(
        dir.path(),
        "fake-ffmpeg",
        r#"for last; do :; done
printf '%s\n' "$@" > "$last"
echo "node=$NODE_ID enqueue=$TS_ENQUEUE run=$RUN_ID" >> "$last""#,
    );
    let store = Arc::new(InMemoryStore::new());
    let config = WorkerConfig {
        run_id: Some("run-7".to_string()),
        ..worker_config("vm1", &script.display().to_string())
    };
    let w = worker(store.clone(), config);

    let output = dir.path().join("o.mp4");
    let record = w.execute(assignment(task(&input, &output, 2), "vm1")).await;
    assert_eq!(record.status, 0);
    assert!(record.bytes_out > 0);

    let written = fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    let input_str = input.display().to_string();
    let output_str = output.display().to_string();
    assert_eq!(
        &lines[..18],
        &[
            "-y",
            "-i",
            input_str.as_str(),
            "-vf",
            "scale=1920:1080",
            "-filter_threads",
            "2",
            "-c:v",
            "libx264",
            "-preset",
            "fast",
            "-crf",
            "28",
            "-threads",
            "2",
            "-c:a",
            "copy",
            output_str.as_str(),
        ]
    );
    assert_eq!(lines[18], "node=vm1 enqueue=42 run=run-7");
}

#[tokio::test]
async fn test_events_file_gets_one_line_per_task() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"x").unwrap();
    let events = dir.path().join("logs/events.jsonl");
    let store = Arc::new(InMemoryStore::new());
    let config = WorkerConfig {
        events: Some(events.clone()),
        ..worker_config("vm1", "/bin/true")
    };
    let w = worker(store.clone(), config);

    w.execute(assignment(task(&input, &dir.path().join("a.mp4"), 1), "vm1")).await;
    w.execute(assignment(task(&dir.path().join("missing.mp4"), &dir.path().join("b.mp4"), 1), "vm1"))
        .await;

    let records: Vec<CompletionRecord> = fs::read_to_string(&events)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, 0);
    assert_eq!(records[0].node, "vm1");
    assert_eq!(records[1].status, -1);
    assert_ne!(records[0].trace_id, records[1].trace_id);
}

#[tokio::test]
async fn test_exclusive_cores_from_allocator_when_slots_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"x").unwrap();
    let store = Arc::new(InMemoryStore::new());
    let binder = Arc::new(RecordingBinder::default());
    let config = WorkerConfig {
        parallel: 2,
        ..worker_config("vm1", "/bin/true")
    };
    let w = Worker::with_binder(store, Arc::new(ManualClock::new(0)), config, binder.clone()).unwrap();

    let record = w.execute(assignment(task(&input, &dir.path().join("o.mp4"), 2), "vm1")).await;
    assert_eq!(record.cpuset.as_deref(), Some("0-1"));
    // Released after exit, so the next task gets the same range.
    w.execute(assignment(task(&input, &dir.path().join("o.mp4"), 2), "vm1")).await;

    assert_eq!(
        *binder.seen.lock().unwrap(),
        vec![Some("0-1".to_string()), Some("0-1".to_string())]
    );
}

#[tokio::test]
async fn test_exclusive_cores_from_profile_without_slots() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"x").unwrap();
    let store = Arc::new(InMemoryStore::new());
    let binder = Arc::new(RecordingBinder::default());
    let w = Worker::with_binder(
        store,
        Arc::new(ManualClock::new(0)),
        worker_config("vm1", "/bin/true"),
        binder.clone(),
    )
    .unwrap();

    let mut hinted = task(&input, &dir.path().join("o.mp4"), 2);
    hinted.affinity_hint = Some("2-3".to_string());
    w.execute(assignment(hinted, "vm1")).await;
    w.execute(assignment(task(&input, &dir.path().join("o.mp4"), 2), "vm1")).await;

    assert_eq!(
        *binder.seen.lock().unwrap(),
        vec![Some("2-3".to_string()), Some("0-1".to_string())]
    );
}

#[test]
fn test_exclusive_slots_need_a_core_per_unit() {
    let oversubscribed = WorkerConfig {
        capacity: Some(6),
        parallel: 2,
        ..worker_config("vm1", "/bin/true")
    };
    let result = Worker::with_binder(
        Arc::new(InMemoryStore::new()),
        Arc::new(ManualClock::new(0)),
        oversubscribed.clone(),
        Arc::new(RecordingBinder::default()),
    );
    assert!(matches!(result, Err(WorkerError::Config(ConfigError::Capacity(_)))));

    // Unpinned, or pinned without slots, the same capacity is fine.
    assert!(
        Worker::with_binder(
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(0)),
            oversubscribed.clone(),
            Arc::new(NoBinder),
        )
        .is_ok()
    );
    assert!(
        Worker::with_binder(
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(0)),
            WorkerConfig {
                parallel: 0,
                ..oversubscribed
            },
            Arc::new(RecordingBinder::default()),
        )
        .is_ok()
    );
}

#[tokio::test]
async fn test_run_loop_executes_and_drains_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"x").unwrap();
    let store = Arc::new(InMemoryStore::new());
    let w = Worker::with_binder(
        store.clone(),
        Arc::new(SystemClock),
        worker_config("vm1", "/bin/true"),
        Arc::new(NoBinder),
    )
    .unwrap();

    store.push_back(&keys::node_queue("vm1"), "garbage").await.unwrap();
    for _ in 0..3 {
        let a = assignment(task(&input, &dir.path().join("o.mp4"), 1), "vm1");
        store
            .push_back(&keys::node_queue("vm1"), &serde_json::to_string(&a).unwrap())
            .await
            .unwrap();
    }

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { w.run(rx).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while store.len(keys::DONE).await.unwrap() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "tasks did not complete");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(store.len(&keys::node_queue("vm1")).await.unwrap(), 0);
    assert_eq!(store.range(keys::REJECTED).await.unwrap(), vec!["garbage"]);
}

#[test]
fn test_core_allocator_hands_out_disjoint_ranges() {
    let mut cores = CoreAllocator::new(4);
    let a = cores.allocate(2).unwrap();
    let b = cores.allocate(2).unwrap();
    assert_eq!(a.to_string(), "0-1");
    assert_eq!(b.to_string(), "2-3");
    assert!(a.is_disjoint(&b));
    assert!(cores.allocate(1).is_none());

    cores.release(&a);
    assert_eq!(cores.free(), 2);
    assert_eq!(cores.allocate(1).unwrap().to_string(), "0");
}

#[test]
fn test_core_allocator_scatters_when_fragmented() {
    let mut cores = CoreAllocator::new(4);
    let singles: Vec<CoreSet> = (0..4).map(|_| cores.allocate(1).unwrap()).collect();
    cores.release(&singles[0]);
    cores.release(&singles[2]);

    assert_eq!(cores.allocate(2).unwrap().to_string(), "0,2");
    assert_eq!(cores.free(), 0);
}

#[test]
fn test_binders_wrap_launch() {
    let t = task(Path::new("in.mp4"), Path::new("out.mp4"), 3);

    let mut launch = LaunchSpec::new("ffmpeg");
    launch.args = vec!["-y".to_string()];
    ExclusiveBinder::new(PathBuf::from("/usr/bin/taskset")).apply(&mut launch, &t, Some(&"4-6".parse::<CoreSet>().unwrap()));
    assert_eq!(launch.command_line(), vec!["/usr/bin/taskset", "-c", "4-6", "ffmpeg", "-y"]);
    assert!(launch.env.contains(&("CPUSET".to_string(), "4-6".to_string())));

    let shared = SharedBinder::new(PathBuf::from("/usr/bin/systemd-run"), 100);
    let mut launch = LaunchSpec::new("ffmpeg");
    shared.apply(&mut launch, &t, None);
    assert_eq!(
        launch.command_line(),
        vec![
            "/usr/bin/systemd-run",
            "--scope",
            "--quiet",
            "-p",
            "CPUAccounting=1",
            "-p",
            "CPUWeight=300",
            "--",
            "ffmpeg"
        ]
    );
    assert_eq!(shared.weight_for(1_000), 10_000);

    let mut launch = LaunchSpec::new("ffmpeg");
    NoBinder.apply(&mut launch, &t, None);
    assert_eq!(launch, LaunchSpec::new("ffmpeg"));
}

#[test]
fn test_binding_mode_parse() {
    assert_eq!("exclusive".parse::<BindingMode>().unwrap(), BindingMode::Exclusive);
    assert_eq!("Shared".parse::<BindingMode>().unwrap(), BindingMode::Shared);
    assert_eq!("off".parse::<BindingMode>().unwrap(), BindingMode::None);
    assert!(matches!(
        "pinned-ish".parse::<BindingMode>(),
        Err(ConfigError::UnknownBinding(_))
    ));
}
