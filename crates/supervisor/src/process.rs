//! Platform plumbing for the worker process: spawn, output capture,
//! termination and the TCP readiness probe.

use std::{path::Path, process::Stdio, time::Duration};

use chrono::Utc;
use shared::domain::LogLevel;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    net::TcpStream,
    process::Command,
    sync::broadcast,
};

use crate::{SupervisorEvent, WorkerLog};

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Builds the worker command: stdin discarded, output captured, working
/// directory set to the executable's own directory, and detached into its
/// own process group so the host can terminate it independently.
pub(crate) fn build_command(executable: &Path, args: &[String]) -> Command {
    let mut cmd = Command::new(executable);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = executable.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);

    cmd
}

/// Forwards each non-empty line of `reader` as a `log` event at `level`.
pub(crate) async fn pump_lines<R>(
    reader: R,
    level: LogLevel,
    events: broadcast::Sender<SupervisorEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if line.trim().is_empty() {
                    continue;
                }
                match level {
                    LogLevel::Info => tracing::debug!(target: "worker", "{line}"),
                    _ => tracing::warn!(target: "worker", "{line}"),
                }
                let _ = events.send(SupervisorEvent::Log(WorkerLog {
                    level,
                    message: line.to_string(),
                    at: Utc::now(),
                }));
            }
            Err(err) => {
                tracing::debug!(%err, "worker output stream closed");
                break;
            }
        }
    }
}

/// One readiness attempt: a plain connect that is dropped immediately.
pub(crate) async fn probe_port(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Asks the worker to shut down gracefully. Returns `false` when the process
/// is already gone.
#[cfg(unix)]
pub(crate) fn request_terminate(pid: u32) -> bool {
    use nix::{
        errno::Errno,
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    // 0 and negative pids address process groups, never a single worker.
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => {
            tracing::warn!(pid, "refusing to signal an invalid worker pid");
            return false;
        }
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            tracing::warn!(pid, %err, "failed to signal worker");
            true
        }
    }
}

/// Kills the worker and every process it started.
#[cfg(windows)]
pub(crate) fn kill_tree(pid: u32) {
    let result = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/f", "/t"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(err) = result {
        tracing::warn!(pid, %err, "failed to run taskkill");
    }
}

#[cfg(unix)]
pub(crate) fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub(crate) fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
