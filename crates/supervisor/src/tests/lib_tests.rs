use super::*;
use shared::error::FaultKind;
use std::{fs, path::Path};
use tokio::{net::TcpListener, sync::broadcast::error::RecvError};

const EVENT_WAIT: Duration = Duration::from_secs(5);

fn test_config(executable: PathBuf, ready_port: u16) -> SupervisorConfig {
    SupervisorConfig {
        candidates: vec![executable],
        args: Vec::new(),
        ready_host: "127.0.0.1".into(),
        ready_port,
        poll_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(50),
        startup_timeout: Duration::from_millis(200),
        restart: RestartPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(50),
        },
        stop_grace: Duration::from_millis(300),
        restart_pause: Duration::from_millis(20),
    }
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn run_count(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|raw| raw.lines().count())
        .unwrap_or(0)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<SupervisorEvent>, mut pred: F) -> SupervisorEvent
where
    F: FnMut(&SupervisorEvent) -> bool,
{
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("supervisor event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for supervisor event")
}

async fn wait_for_runs(path: &Path, expected: usize) {
    let deadline = Instant::now() + EVENT_WAIT;
    while run_count(path) < expected {
        assert!(Instant::now() < deadline, "expected {expected} worker runs");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn start_fails_when_executable_is_missing() {
    let supervisor = ProcessSupervisor::new(test_config(
        PathBuf::from("/nonexistent/pos-server"),
        unused_port(),
    ));

    let err = supervisor.start().await.expect_err("missing executable");
    assert!(matches!(err, SupervisorError::ExecutableNotFound { .. }));
    assert_eq!(err.kind(), FaultKind::ExecutableNotFound);
    assert_eq!(supervisor.status(), ProcessStatus::default());

    // The supervisor stays usable; a later call reports the same failure.
    assert!(supervisor.start().await.is_err());
}

#[test]
fn spawned_worker_without_pid_is_a_spawn_failure() {
    let path = Path::new("/opt/pos/pos-server");
    assert_eq!(worker_pid(Some(4242), path).expect("pid"), 4242);

    for missing in [None, Some(0)] {
        let err = worker_pid(missing, path).expect_err("no usable pid");
        assert!(matches!(err, SupervisorError::SpawnFailure { .. }));
        assert_eq!(err.kind(), FaultKind::SpawnFailure);
    }
}

#[test]
fn signal_deaths_count_as_crashes() {
    let killed = ExitInfo {
        pid: 7,
        code: None,
        signal: Some(9),
        superseded: false,
    };
    assert_eq!(killed.kind(), FaultKind::CrashExit);
}

#[tokio::test]
async fn status_reports_not_running_before_start() {
    let supervisor = ProcessSupervisor::new(SupervisorConfig::default());
    let status = supervisor.status();
    assert!(!status.running);
    assert_eq!(status.pid, None);
    assert_eq!(status.uptime_ms, None);
    assert_eq!(supervisor.restart_count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn spawn_failure_is_returned_and_emitted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let not_executable = dir.path().join("pos-server");
    fs::write(&not_executable, b"not a program").expect("write");

    let supervisor = ProcessSupervisor::new(test_config(not_executable, unused_port()));
    let mut events = supervisor.subscribe_events();

    let err = supervisor.start().await.expect_err("spawn should fail");
    assert!(matches!(err, SupervisorError::SpawnFailure { .. }));

    let event = wait_for(&mut events, |event| matches!(event, SupervisorEvent::Error(_))).await;
    let SupervisorEvent::Error(fault) = event else {
        unreachable!()
    };
    assert_eq!(fault.kind, FaultKind::SpawnFailure);
    assert!(!supervisor.is_running());
}

#[cfg(unix)]
#[tokio::test]
async fn ready_is_emitted_once_port_accepts_and_stop_terminates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "pos-server", "exec sleep 30");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let supervisor = ProcessSupervisor::new(test_config(script, port));
    let mut events = supervisor.subscribe_events();

    supervisor.start().await.expect("start");
    wait_for(&mut events, |event| *event == SupervisorEvent::Ready).await;

    let status = supervisor.status();
    assert!(status.running);
    assert!(status.pid.is_some());
    assert!(status.uptime_ms.is_some());

    // A second start while live is a no-op.
    supervisor.start().await.expect("idempotent start");
    assert_eq!(supervisor.status().pid, status.pid);

    supervisor.stop();
    assert!(!supervisor.is_running(), "handle is released immediately");

    let exit = wait_for(&mut events, |event| matches!(event, SupervisorEvent::Exit(_))).await;
    let SupervisorEvent::Exit(info) = exit else {
        unreachable!()
    };
    assert_eq!(Some(info.pid), status.pid);
    assert_eq!(info.signal, Some(15));
    assert!(!info.superseded);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!supervisor.is_running(), "stopped worker is not restarted");
}

#[cfg(unix)]
#[tokio::test]
async fn readiness_timeout_still_emits_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "pos-server", "exec sleep 30");

    let supervisor = ProcessSupervisor::new(test_config(script, unused_port()));
    let mut events = supervisor.subscribe_events();

    supervisor.start().await.expect("start proceeds after timeout");
    wait_for(&mut events, |event| *event == SupervisorEvent::Ready).await;
    assert!(supervisor.is_running());

    supervisor.stop();
}

#[cfg(unix)]
#[tokio::test]
async fn crash_exits_restart_until_budget_is_exhausted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runs = dir.path().join("runs.log");
    let script = write_script(dir.path(), "pos-server", "echo run >> \"$1\"\nexit 3");

    let mut config = test_config(script, unused_port());
    config.args = vec![runs.to_string_lossy().into_owned()];
    let supervisor = ProcessSupervisor::new(config);
    let mut events = supervisor.subscribe_events();

    supervisor.start().await.expect("start");

    let crash = wait_for(&mut events, |event| matches!(event, SupervisorEvent::Exit(_))).await;
    let SupervisorEvent::Exit(info) = crash else {
        unreachable!()
    };
    assert_eq!(info.code, Some(3));
    assert_eq!(info.kind(), FaultKind::CrashExit);

    let exhausted = wait_for(&mut events, |event| {
        matches!(event, SupervisorEvent::Error(fault) if fault.kind == FaultKind::RestartBudgetExhausted)
    })
    .await;
    let SupervisorEvent::Error(fault) = exhausted else {
        unreachable!()
    };
    assert!(fault.message.contains("manual restart required"));

    // Initial run plus one restart per budgeted attempt, then nothing more.
    wait_for_runs(&runs, 3).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(run_count(&runs), 3);
    assert_eq!(supervisor.restart_count(), 2);
    assert!(!supervisor.is_running());
}

#[cfg(unix)]
#[tokio::test]
async fn clean_exit_is_never_restarted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runs = dir.path().join("runs.log");
    let script = write_script(dir.path(), "pos-server", "echo run >> \"$1\"\nexit 0");

    let mut config = test_config(script, unused_port());
    config.args = vec![runs.to_string_lossy().into_owned()];
    let supervisor = ProcessSupervisor::new(config);
    let mut events = supervisor.subscribe_events();

    supervisor.start().await.expect("start");
    let exit = wait_for(&mut events, |event| matches!(event, SupervisorEvent::Exit(_))).await;
    let SupervisorEvent::Exit(info) = exit else {
        unreachable!()
    };
    assert_eq!(info.kind(), FaultKind::CleanExit);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(run_count(&runs), 1);
    assert_eq!(supervisor.restart_count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn stop_during_restart_delay_cancels_the_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runs = dir.path().join("runs.log");
    let script = write_script(dir.path(), "pos-server", "echo run >> \"$1\"\nexit 1");

    let mut config = test_config(script, unused_port());
    config.args = vec![runs.to_string_lossy().into_owned()];
    config.restart.delay = Duration::from_millis(300);
    let supervisor = ProcessSupervisor::new(config);
    let mut events = supervisor.subscribe_events();

    supervisor.start().await.expect("start");
    wait_for(&mut events, |event| matches!(event, SupervisorEvent::Exit(_))).await;
    assert_eq!(supervisor.restart_count(), 1, "a restart was scheduled");

    supervisor.stop();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(run_count(&runs), 1);
    assert!(!supervisor.is_running());
}

#[cfg(unix)]
#[tokio::test]
async fn output_lines_are_forwarded_as_log_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "pos-server",
        "echo listening on 8989\necho device missing >&2\nexec sleep 30",
    );

    let supervisor = ProcessSupervisor::new(test_config(script, unused_port()));
    let mut events = supervisor.subscribe_events();
    supervisor.start().await.expect("start");

    let mut stdout_line = None;
    let mut stderr_line = None;
    while stdout_line.is_none() || stderr_line.is_none() {
        let event = wait_for(&mut events, |event| matches!(event, SupervisorEvent::Log(_))).await;
        if let SupervisorEvent::Log(log) = event {
            match log.level {
                LogLevel::Info => stdout_line = Some(log.message),
                _ => stderr_line = Some(log.message),
            }
        }
    }
    assert_eq!(stdout_line.as_deref(), Some("listening on 8989"));
    assert_eq!(stderr_line.as_deref(), Some("device missing"));

    let mut events = supervisor.subscribe_events();
    supervisor.stop();
    wait_for(&mut events, |event| matches!(event, SupervisorEvent::Exit(_))).await;
}

#[cfg(unix)]
#[tokio::test]
async fn restart_replaces_the_worker_and_resets_the_counter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "pos-server", "exec sleep 30");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let supervisor = ProcessSupervisor::new(test_config(script, port));
    let mut events = supervisor.subscribe_events();

    supervisor.start().await.expect("start");
    wait_for(&mut events, |event| *event == SupervisorEvent::Ready).await;
    let first_pid = supervisor.status().pid;

    supervisor.restart().await.expect("restart");
    wait_for(&mut events, |event| *event == SupervisorEvent::Ready).await;

    let second_pid = supervisor.status().pid;
    assert!(second_pid.is_some());
    assert_ne!(first_pid, second_pid);
    assert_eq!(supervisor.restart_count(), 0);

    supervisor.stop();
}
