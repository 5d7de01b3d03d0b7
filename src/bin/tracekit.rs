use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tracekit::clock::{Clock, SystemClock};
use tracekit::dispatcher::{Dispatcher, DispatcherConfig, Pacing};
use tracekit::model::mix::Mix;
use tracekit::model::profile::ProfileRegistry;
use tracekit::scheduler::{ClusterView, Scheduler, SchedulerConfig, WeighOrder, Weigher, WeigherKind};
use tracekit::store::{CoordinationStore, RedisStore, keys};
use tracekit::worker::{BindingMode, Worker, WorkerConfig, hostname};

#[derive(Parser)]
#[command(author, version, about = "Central FIFO batch scheduler for CPU-bound transcoding tasks", long_about = None)]
struct Cli {
    /// Coordination store URL (redis://[:password@]host:port/db)
    #[arg(long, global = true, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    redis: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PacingMode {
    Pulse,
    Drip,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate tasks from a profile mix and admit them into q:pending
    Dispatch {
        /// Profile mix, e.g. fast1080p=50,medium480p=30,hevc1080p=20
        #[arg(long)]
        mix: String,

        /// Number of tasks to generate
        #[arg(long)]
        total: usize,

        /// Shuffle seed; a random one is chosen and logged when omitted
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value = "inputs")]
        inputs: PathBuf,

        #[arg(long, default_value = "outputs")]
        outputs: PathBuf,

        /// Input file extension
        #[arg(long, default_value = "mp4")]
        ext: String,

        /// Extra profile definitions (YAML, `profiles: [...]`)
        #[arg(long)]
        profiles: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "pulse")]
        pacing: PacingMode,

        /// Tasks per pulse
        #[arg(long, default_value_t = 10)]
        pulse_size: usize,

        /// Seconds between pulses
        #[arg(long, default_value_t = 300.0)]
        pulse_interval: f64,

        /// Seconds between tasks within one pulse
        #[arg(long, default_value_t = 1.0)]
        stagger: f64,

        /// Tasks per drip round
        #[arg(long, default_value_t = 1)]
        batch_size: usize,

        /// Seconds between drip rounds
        #[arg(long, default_value_t = 1.0)]
        drip_interval: f64,

        /// Never let q:pending grow beyond this depth
        #[arg(long)]
        max_pending: Option<u64>,

        /// Print the generated tasks as JSON lines and exit
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the central scheduler loop
    Schedule {
        /// Break ties among feasible nodes: instances or vcpu
        #[arg(long)]
        weigher: Option<String>,

        /// min or max
        #[arg(long, default_value = "min")]
        weigher_order: String,

        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 50)]
        poll_ms: u64,
    },

    /// Run a worker for one node
    Worker {
        /// Node identity; defaults to the hostname
        #[arg(long, env = "NODE_ID")]
        node_id: Option<String>,

        /// Capacity in cpu units; defaults to floor(ratio * logical cores)
        #[arg(long)]
        capacity: Option<u32>,

        #[arg(long, default_value_t = 1.0)]
        allocation_ratio: f64,

        /// Concurrency slots; 0 disables slot tokens
        #[arg(long, default_value_t = 0)]
        parallel: u32,

        /// Overwrite cap:<node> and zero run_count:<node>
        #[arg(long)]
        reset_capacity: bool,

        /// Remove this node's leftover tokens from slots:available
        #[arg(long)]
        purge_stale_slots: bool,

        /// Drop anything left in q:<node>
        #[arg(long)]
        clear_queue: bool,

        /// exclusive, shared or none
        #[arg(long, default_value = "shared")]
        binding: String,

        #[arg(long, default_value_t = 100)]
        cpuweight_per_vcpu: u32,

        /// Transcoder executable
        #[arg(long, default_value = "ffmpeg")]
        executable: String,

        /// Append completion records to this JSONL file
        #[arg(long)]
        events: Option<PathBuf>,

        #[arg(long, env = "RUN_ID")]
        run_id: Option<String>,
    },

    /// Clear queues, counters and slot tokens left by a previous run
    Reset,

    /// Print queue depths and per-node accounting
    Status,
}

fn secs(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {} `{}`", what, value))
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::Dispatch {
            mix,
            total,
            seed,
            inputs,
            outputs,
            ext,
            profiles,
            pacing,
            pulse_size,
            pulse_interval,
            stagger,
            batch_size,
            drip_interval,
            max_pending,
            dry_run,
        } => {
            let mut registry = ProfileRegistry::builtin();
            if let Some(path) = &profiles {
                registry.load_file(path)?;
            }
            let mix: Mix = mix.parse()?;
            let seed = seed.unwrap_or_else(rand::random);
            let pacing = match pacing {
                PacingMode::Pulse => Pacing::Pulse {
                    size: pulse_size,
                    interval: secs(pulse_interval, "pulse interval")?,
                    stagger: secs(stagger, "stagger")?,
                },
                PacingMode::Drip => Pacing::Drip {
                    batch_size,
                    interval: secs(drip_interval, "drip interval")?,
                },
            };
            let config = DispatcherConfig {
                mix,
                total,
                seed,
                inputs,
                outputs,
                extension: ext,
                pacing,
                max_pending,
                depth_poll: Duration::from_millis(200),
                store_retries: 5,
            };
            info!(seed, "dispatcher seed");

            let store: Arc<dyn CoordinationStore> = Arc::new(RedisStore::open(&cli.redis)?);
            let dispatcher = Dispatcher::new(store.clone(), clock, registry, config);
            if dry_run {
                for task in dispatcher.plan()? {
                    println!("{}", serde_json::to_string(&task)?);
                }
                return Ok(());
            }
            store.len(keys::PENDING).await.context("Coordination store unreachable")?;
            let report = dispatcher.run().await?;
            info!(
                admitted = report.admitted,
                first_ts = ?report.first_ts,
                last_ts = ?report.last_ts,
                "dispatch complete"
            );
        }
        Commands::Schedule {
            weigher,
            weigher_order,
            poll_ms,
        } => {
            let weigher = match weigher {
                Some(kind) => Some(Weigher::new(kind.parse::<WeigherKind>()?, weigher_order.parse::<WeighOrder>()?)),
                None => None,
            };
            let config = SchedulerConfig {
                weigher,
                poll_interval: Duration::from_millis(poll_ms.max(1)),
                ..SchedulerConfig::default()
            };
            let store: Arc<dyn CoordinationStore> = Arc::new(RedisStore::open(&cli.redis)?);
            let mut scheduler = Scheduler::new(store, clock, config);
            scheduler.run(shutdown_signal()).await?;
        }
        Commands::Worker {
            node_id,
            capacity,
            allocation_ratio,
            parallel,
            reset_capacity,
            purge_stale_slots,
            clear_queue,
            binding,
            cpuweight_per_vcpu,
            executable,
            events,
            run_id,
        } => {
            let Some(node_id) = node_id.or_else(hostname) else {
                bail!("cannot determine node identity; pass --node-id or set NODE_ID");
            };
            let config = WorkerConfig {
                capacity,
                allocation_ratio,
                parallel,
                reset_capacity,
                purge_stale_slots,
                clear_queue,
                binding: binding.parse::<BindingMode>()?,
                cpuweight_per_vcpu,
                executable,
                events,
                run_id,
                ..WorkerConfig::new(node_id)
            };
            let store: Arc<dyn CoordinationStore> = Arc::new(RedisStore::open(&cli.redis)?);
            let worker = Worker::new(store, clock, config).await?;
            worker.register().await?;
            worker.run(shutdown_signal()).await?;
        }
        Commands::Reset => {
            let store = RedisStore::open(&cli.redis)?;
            reset(&store).await?;
        }
        Commands::Status => {
            let store = RedisStore::open(&cli.redis)?;
            status(&store).await?;
        }
    }
    Ok(())
}

async fn reset(store: &dyn CoordinationStore) -> Result<()> {
    let mut removed = 0;
    for key in [keys::PENDING, keys::DONE, keys::REJECTED, keys::SLOTS] {
        removed += store.delete(key).await? as usize;
    }
    for cap_key in store.keys_with_prefix(keys::CAP_PREFIX).await? {
        let Some(node) = keys::node_from_cap_key(&cap_key) else {
            continue;
        };
        for key in [
            keys::node_queue(node),
            keys::cap(node),
            keys::cap_total(node),
            keys::run_count(node),
            keys::slots_total(node),
        ] {
            removed += store.delete(&key).await? as usize;
        }
    }
    for marker in store.keys_with_prefix(keys::PUSHED_PREFIX).await? {
        removed += store.delete(&marker).await? as usize;
    }
    info!(removed, "store reset");
    Ok(())
}

async fn status(store: &dyn CoordinationStore) -> Result<()> {
    let view = ClusterView::read(store).await?;
    println!("pending\t{}", store.len(keys::PENDING).await?);
    println!("done\t{}", store.len(keys::DONE).await?);
    println!("rejected\t{}", store.len(keys::REJECTED).await?);
    println!("stale_tokens\t{}", view.stale_tokens);
    println!("node\tqueue\tcap\tcap_total\trun_count\tslots_total\ttokens");
    for node in &view.nodes {
        let depth = store.len(&keys::node_queue(&node.id)).await?;
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            node.id,
            depth,
            node.cap,
            node.cap_total.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
            node.run_count,
            node.slots_total,
            node.tokens
        );
    }
    if view.nodes.is_empty() {
        warn!("no registered nodes");
    }
    Ok(())
}
