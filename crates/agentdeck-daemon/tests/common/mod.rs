//! Fixtures shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use agentdeck_daemon::reaper::ProcessReaper;
use agentdeck_daemon::supervisor::{
    EventHub, ExecutableResolver, ProcessSupervisor, SessionEvent, SupervisorConfig,
};

/// Run git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A repository with one commit containing `README.md`.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "--quiet"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    std::fs::write(dir.join("README.md"), "# project\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "--quiet", "-m", "initial"]);
}

pub fn commit_count(dir: &Path) -> usize {
    git(dir, &["rev-list", "--count", "HEAD"]).parse().unwrap()
}

/// Write an executable script.
#[cfg(unix)]
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Supervisor launching `program`, with short timings for tests.
pub fn supervisor(program: &Path, events: Arc<EventHub>) -> ProcessSupervisor {
    let config = SupervisorConfig {
        program: program.to_string_lossy().into_owned(),
        stop_confirm_timeout: Duration::from_secs(5),
        ..SupervisorConfig::default()
    };
    let resolver = ExecutableResolver::new(config.program.clone(), Vec::new());
    ProcessSupervisor::new(
        config,
        resolver,
        ProcessReaper::new(Duration::from_millis(200), Duration::from_millis(100)),
        events,
    )
}

/// Collect events for `session_id` until `stop` matches one or the timeout
/// passes. The matching event is included.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<SessionEvent>,
    session_id: &str,
    timeout: Duration,
    stop: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let Ok(received) = tokio::time::timeout_at(deadline, rx.recv()).await else {
            return seen;
        };
        match received {
            Ok(event) if event.session_id() == session_id => {
                let done = stop(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return seen,
        }
    }
}

/// Running and not a zombie. Orphans are reaped by init, but a zombie still
/// answers `kill(0)`, so `/proc` is checked where available.
#[cfg(unix)]
pub fn alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(i32::try_from(pid).unwrap()), None).is_err() {
        return false;
    }
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| !stat.contains(") Z "))
        .unwrap_or(true)
}

/// Pids written one per line by a test agent.
pub fn read_pids(path: &Path) -> Vec<u32> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

pub fn is_exit(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Exit { .. })
}
