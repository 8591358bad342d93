#![cfg(unix)]
#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! PTY supervision against small shell-script agents.

mod common;

use std::sync::Arc;
use std::time::Duration;

use agentdeck_core::stream::AgentMessage;
use agentdeck_daemon::supervisor::{
    DiagnosticKind, EventHub, OutputKind, SessionEvent, SpawnRequest, SupervisorError,
};

use common::{alive, collect_until, is_exit, read_pids, script, supervisor};

const WAIT: Duration = Duration::from_secs(15);

fn request(session_id: &str, dir: &std::path::Path) -> SpawnRequest {
    SpawnRequest {
        session_id: session_id.to_string(),
        working_dir: dir.to_path_buf(),
        args: Vec::new(),
        env: Vec::new(),
    }
}

fn outputs(events: &[SessionEvent]) -> Vec<(OutputKind, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Output { kind, data, .. } => Some((*kind, data.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn stream_lines_become_messages_and_classified_output() {
    let dir = tempfile::tempdir().unwrap();
    let agent = script(
        dir.path(),
        "agent",
        "#!/bin/sh\n\
         echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"agent-7\",\"model\":\"m\",\"cwd\":\"/tmp\"}'\n\
         echo 'hello world'\n\
         echo ''\n\
         echo 'fatal: could not read config'\n\
         exit 3\n",
    );
    let hub = Arc::new(EventHub::new(256));
    let sup = supervisor(&agent, Arc::clone(&hub));
    let mut rx = hub.subscribe("s1").await;

    let handle = sup.spawn(request("s1", dir.path())).await.unwrap();
    assert!(handle.pid > 0);
    let events = collect_until(&mut rx, "s1", WAIT, is_exit).await;

    assert!(matches!(events.first(), Some(SessionEvent::Spawned { pid, .. }) if *pid == handle.pid));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Message { message: AgentMessage::SystemInit(init), .. } if init.session_id == "agent-7"
    )));
    assert_eq!(
        outputs(&events),
        vec![
            (OutputKind::Stdout, "hello world".to_string()),
            (OutputKind::Stderr, "fatal: could not read config".to_string()),
        ]
    );
    assert!(matches!(events.last(), Some(SessionEvent::Exit { code: Some(3), .. })));
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::Diagnostic { .. })));
    assert!(!sup.is_running("s1").await);
}

#[tokio::test]
async fn silent_exit_reports_startup_failure_with_code() {
    let dir = tempfile::tempdir().unwrap();
    let agent = script(dir.path(), "agent", "#!/bin/sh\nexit 7\n");
    let hub = Arc::new(EventHub::new(64));
    let sup = supervisor(&agent, Arc::clone(&hub));
    let mut rx = hub.subscribe("quiet").await;

    sup.spawn(request("quiet", dir.path())).await.unwrap();
    let events = collect_until(&mut rx, "quiet", WAIT, is_exit).await;

    let diagnostic = events.iter().position(|e| {
        matches!(
            e,
            SessionEvent::Diagnostic {
                kind: DiagnosticKind::NoOutputStartupFailure,
                ..
            }
        )
    });
    let exit = events.iter().position(is_exit);
    assert!(diagnostic.is_some());
    assert!(diagnostic < exit);
    assert!(matches!(events.last(), Some(SessionEvent::Exit { code: Some(7), .. })));
}

#[tokio::test]
async fn input_reaches_the_agent_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let agent = script(
        dir.path(),
        "agent",
        "#!/bin/sh\necho ready\nread line\necho \"got $line\"\n",
    );
    let hub = Arc::new(EventHub::new(64));
    let sup = supervisor(&agent, Arc::clone(&hub));
    let mut rx = hub.subscribe("io").await;

    sup.spawn(request("io", dir.path())).await.unwrap();
    collect_until(&mut rx, "io", WAIT, |e| {
        matches!(e, SessionEvent::Output { data, .. } if data == "ready")
    })
    .await;
    sup.send_input("io", b"ping\n").await.unwrap();
    let events = collect_until(&mut rx, "io", WAIT, is_exit).await;

    assert!(outputs(&events).iter().any(|(_, line)| line == "got ping"));
    assert!(matches!(
        sup.send_input("io", b"late\n").await,
        Err(SupervisorError::SessionNotRunning { .. })
    ));
}

#[tokio::test]
async fn restart_leaves_exactly_one_live_process() {
    let dir = tempfile::tempdir().unwrap();
    let agent = script(
        dir.path(),
        "agent",
        "#!/bin/sh\necho started\nsleep 30 &\nwait\n",
    );
    let hub = Arc::new(EventHub::new(256));
    let sup = supervisor(&agent, Arc::clone(&hub));
    let mut rx = hub.subscribe("r").await;

    let first = sup.spawn(request("r", dir.path())).await.unwrap();
    collect_until(&mut rx, "r", WAIT, |e| {
        matches!(e, SessionEvent::Output { data, .. } if data == "started")
    })
    .await;

    let second = sup.spawn(request("r", dir.path())).await.unwrap();
    assert_ne!(first.pid, second.pid);
    assert!(second.generation > first.generation);
    assert_eq!(sup.pid_of("r").await, Some(second.pid));
    assert_eq!(sup.running_sessions().await, vec!["r".to_string()]);

    // The first process's exit was confirmed before the second was spawned.
    let events = collect_until(&mut rx, "r", WAIT, |e| {
        matches!(e, SessionEvent::Spawned { pid, .. } if *pid == second.pid)
    })
    .await;
    assert!(events.iter().any(is_exit));
    assert!(nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(i32::try_from(first.pid).unwrap()),
        None
    )
    .is_err());

    let report = sup.kill("r").await.unwrap();
    assert!(report.zombies.is_empty(), "{}", report.zombie_message());
    assert!(!sup.is_running("r").await);
    assert!(sup.kill("r").await.is_none());
}

#[tokio::test]
async fn kill_takes_down_background_children() {
    let dir = tempfile::tempdir().unwrap();
    let agent = script(
        dir.path(),
        "agent",
        "#!/bin/sh\nsleep 30 &\nsleep 30 &\necho up\nwait\n",
    );
    let hub = Arc::new(EventHub::new(64));
    let sup = supervisor(&agent, Arc::clone(&hub));
    let mut rx = hub.subscribe("k").await;

    sup.spawn(request("k", dir.path())).await.unwrap();
    collect_until(&mut rx, "k", WAIT, |e| {
        matches!(e, SessionEvent::Output { data, .. } if data == "up")
    })
    .await;

    let report = sup.kill("k").await.unwrap();
    assert!(report.success(), "{report:?}");
    assert!(report.discovered.len() >= 2);
    let events = collect_until(&mut rx, "k", WAIT, is_exit).await;
    assert!(events.iter().any(is_exit));
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::ZombieProcessesDetected { .. })));
}

#[tokio::test]
async fn missing_executable_is_reported_with_search_locations() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Arc::new(EventHub::new(16));
    let sup = supervisor(&dir.path().join("no-such-agent"), hub);

    match sup.spawn(request("m", dir.path())).await {
        Err(SupervisorError::ExecutableNotFound { program, searched }) => {
            assert!(program.ends_with("no-such-agent"));
            assert!(!searched.is_empty());
        }
        other => panic!("expected ExecutableNotFound, got {other:?}"),
    }
    assert!(!sup.is_running("m").await);
}

#[tokio::test]
async fn missing_shebang_interpreter_runs_through_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let agent = script(
        dir.path(),
        "agent",
        "#!/nonexistent/bin/sh\necho \"via fallback $1\"\n",
    );
    let hub = Arc::new(EventHub::new(64));
    let sup = supervisor(&agent, Arc::clone(&hub));
    let mut rx = hub.subscribe("f").await;

    let mut req = request("f", dir.path());
    req.args = vec!["ok".to_string()];
    let handle = sup.spawn(req).await.unwrap();
    assert_eq!(handle.executable, agent);

    let events = collect_until(&mut rx, "f", WAIT, is_exit).await;
    assert!(outputs(&events).iter().any(|(_, line)| line == "via fallback ok"));
    assert!(matches!(events.last(), Some(SessionEvent::Exit { code: Some(0), .. })));
}

#[tokio::test]
async fn normal_exit_cleans_up_orphaned_children() {
    let dir = tempfile::tempdir().unwrap();
    let agent = script(
        dir.path(),
        "agent",
        "#!/bin/sh\n\
         (trap '' HUP; sleep 30) > /dev/null 2>&1 &\n\
         echo $! > orphan.pid\n\
         echo hello\n\
         exit 0\n",
    );
    let hub = Arc::new(EventHub::new(64));
    let sup = supervisor(&agent, Arc::clone(&hub));
    let mut rx = hub.subscribe("o").await;

    sup.spawn(request("o", dir.path())).await.unwrap();
    let events = collect_until(&mut rx, "o", WAIT, is_exit).await;
    assert!(matches!(events.last(), Some(SessionEvent::Exit { code: Some(0), .. })));

    let orphans = read_pids(&dir.path().join("orphan.pid"));
    assert_eq!(orphans.len(), 1);
    assert!(!alive(orphans[0]), "orphan {} outlived the agent", orphans[0]);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::ZombieProcessesDetected { .. })));
}

#[tokio::test]
async fn processes_escaping_termination_are_reported_by_pid() {
    let dir = tempfile::tempdir().unwrap();
    // On SIGTERM, start a job in its own process group. It is neither in the
    // agent's group nor known at discovery, so the kill pass misses it.
    let agent = script(
        dir.path(),
        "agent",
        "#!/bin/sh\n\
         trap 'set -m; sleep 30 > /dev/null 2>&1 & echo $! >> escaped.pid; trap - TERM' TERM\n\
         echo ready\n\
         sleep 30 &\n\
         wait\n\
         wait\n",
    );
    let hub = Arc::new(EventHub::new(64));
    let sup = supervisor(&agent, Arc::clone(&hub));
    let mut rx = hub.subscribe("z").await;

    sup.spawn(request("z", dir.path())).await.unwrap();
    collect_until(&mut rx, "z", WAIT, |e| {
        matches!(e, SessionEvent::Output { data, .. } if data == "ready")
    })
    .await;

    let report = sup.kill("z").await.unwrap();
    let escaped = read_pids(&dir.path().join("escaped.pid"));
    assert!(!escaped.is_empty(), "agent never forked during termination");

    let mut zombies = report.zombie_pids();
    zombies.sort_unstable();
    let mut expected = escaped.clone();
    expected.sort_unstable();
    assert_eq!(zombies, expected);
    assert!(!report.success());

    let events = collect_until(&mut rx, "z", WAIT, |e| {
        matches!(e, SessionEvent::ZombieProcessesDetected { .. })
    })
    .await;
    let Some(SessionEvent::ZombieProcessesDetected { pids, message, .. }) = events.last() else {
        panic!("no zombie event in {events:?}");
    };
    assert_eq!(pids, &report.zombie_pids());
    for pid in &escaped {
        assert!(message.contains(&pid.to_string()));
    }

    for pid in escaped {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(i32::try_from(pid).unwrap()),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
}
