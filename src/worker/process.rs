use std::io;
use std::process::Stdio;

use tokio::process::Command;

use crate::clock::Clock;
use crate::worker::binding::LaunchSpec;

/// Outcome of one supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    /// Exit code, or -1 when the child was terminated by a signal.
    pub status: i32,
    pub ts_start: i64,
    pub ts_end: i64,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Spawns `launch` and waits for it to exit.
///
/// The child gets its own process group so an interrupt aimed at the worker's
/// terminal does not reach it; in-flight tasks run to completion.
pub async fn run(launch: &LaunchSpec, clock: &dyn Clock) -> io::Result<ProcessExit> {
    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(false)
        .process_group(0);

    let mut child = command.spawn()?;
    let ts_start = clock.now_ms();
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;

    let status = child.wait().await?;
    let ts_end = clock.now_ms().max(ts_start);

    Ok(ProcessExit {
        pid,
        status: status.code().unwrap_or(-1),
        ts_start,
        ts_end,
    })
}
