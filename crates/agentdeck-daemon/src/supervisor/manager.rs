//! Agent subprocess supervisor.
//!
//! Each session runs its agent inside a pseudo-terminal. The supervisor owns
//! the live handle, streams output as [`SessionEvent`]s and, when the process
//! exits or is stopped, hands the whole tree to the [`ProcessReaper`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use agentdeck_core::config::Config;

use super::error::SupervisorError;
use super::events::{DiagnosticKind, EventHub, SessionEvent};
use super::output::{Line, LineAssembler, interpret};
use super::resolve::{ExecutableResolver, LaunchPlan};
use crate::reaper::{ProcessReaper, ReapReport};

const READ_BUF_LEN: usize = 8192;
const READ_CHANNEL_CAPACITY: usize = 256;

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: String,
    pub extra_search_dirs: Vec<PathBuf>,
    pub pty_rows: u16,
    pub pty_cols: u16,
    /// How long a restart or stop waits for the old monitor to confirm exit.
    pub stop_confirm_timeout: Duration,
    /// How long output is still collected after the process exits.
    pub drain_timeout: Duration,
}

impl SupervisorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.agent.binary.clone(),
            extra_search_dirs: config.agent.extra_search_dirs.clone(),
            pty_rows: config.agent.pty_rows,
            pty_cols: config.agent.pty_cols,
            stop_confirm_timeout: Duration::from_millis(config.reaper.stop_confirm_timeout_ms),
            drain_timeout: Duration::from_millis(200),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What to start for a session.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    /// Extra environment on top of the supervisor's own.
    pub env: Vec<(String, String)>,
}

/// Public view of a live agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub session_id: String,
    pub pid: u32,
    /// Increases with every spawn; distinguishes a restart from its
    /// predecessor.
    pub generation: u64,
    pub spawned_at: SystemTime,
    pub executable: PathBuf,
}

struct LiveProcess {
    handle: ProcessHandle,
    master: Box<dyn MasterPty + Send>,
    writer: Arc<std::sync::Mutex<Box<dyn Write + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Set once someone has started tree cleanup for this process.
    reaped: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
}

struct Launched {
    pid: u32,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

struct Inner {
    config: SupervisorConfig,
    resolver: ExecutableResolver,
    reaper: ProcessReaper,
    events: Arc<EventHub>,
    processes: Mutex<HashMap<String, LiveProcess>>,
    start_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
}

/// Spawns, streams and terminates one PTY subprocess per session.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        resolver: ExecutableResolver,
        reaper: ProcessReaper,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                resolver,
                reaper,
                events,
                processes: Mutex::new(HashMap::new()),
                start_locks: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Supervisor for the configured agent binary.
    pub fn from_config(config: &Config, events: Arc<EventHub>) -> Self {
        let supervisor_config = SupervisorConfig::from_config(config);
        let resolver = ExecutableResolver::new(
            supervisor_config.program.clone(),
            supervisor_config.extra_search_dirs.clone(),
        );
        Self::new(
            supervisor_config,
            resolver,
            ProcessReaper::from_config(&config.reaper),
            events,
        )
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    /// Start the agent for a session.
    ///
    /// A process already running for the session is stopped first; the new
    /// one is only started once the old monitor has confirmed exit.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<ProcessHandle, SupervisorError> {
        let start_lock = self.start_lock(&request.session_id).await;
        let _start_guard = start_lock.lock().await;

        self.stop_previous(&request.session_id).await?;

        let search_path = child_search_path(&request.env);
        let plan = self.inner.resolver.resolve(search_path.as_deref())?;

        let attempt = match launch(&self.inner.config, &request, &plan) {
            Ok(launched) => Ok((launched, plan)),
            Err(err) => match plan.with_interpreter().filter(|_| is_interpreter_failure(&err)) {
                Some(retry) => {
                    warn!(
                        session_id = %request.session_id,
                        executable = %plan.executable.display(),
                        error = %err,
                        "Direct launch refused, retrying through interpreter"
                    );
                    self.inner
                        .events
                        .emit(SessionEvent::Diagnostic {
                            session_id: request.session_id.clone(),
                            kind: DiagnosticKind::InterpreterFallback,
                            detail: format!(
                                "direct launch failed ({err}); retrying as: {}",
                                retry.describe(&request.args)
                            ),
                        })
                        .await;
                    match launch(&self.inner.config, &request, &retry) {
                        Ok(launched) => Ok((launched, retry)),
                        Err(err) => Err((err, retry)),
                    }
                }
                None => Err((err, plan)),
            },
        };

        let (launched, plan) = match attempt {
            Ok(ok) => ok,
            Err((err, plan)) => {
                let searched: Vec<String> = plan
                    .searched
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                let detail = format!(
                    "command: {}; cwd: {}; searched: [{}]; error: {err}",
                    plan.describe(&request.args),
                    request.working_dir.display(),
                    searched.join(", ")
                );
                error!(session_id = %request.session_id, %detail, "Failed to spawn agent");
                self.inner
                    .events
                    .emit(SessionEvent::Diagnostic {
                        session_id: request.session_id.clone(),
                        kind: DiagnosticKind::SpawnRefused,
                        detail,
                    })
                    .await;
                return Err(SupervisorError::SpawnFailure {
                    reason: err.to_string(),
                });
            }
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ProcessHandle {
            session_id: request.session_id.clone(),
            pid: launched.pid,
            generation,
            spawned_at: SystemTime::now(),
            executable: plan.executable.clone(),
        };
        let (exited_tx, exited_rx) = watch::channel(false);
        let reaped = Arc::new(AtomicBool::new(false));
        let killer = launched.child.clone_killer();

        self.inner.processes.lock().await.insert(
            request.session_id.clone(),
            LiveProcess {
                handle: handle.clone(),
                master: launched.master,
                writer: Arc::new(std::sync::Mutex::new(launched.writer)),
                killer,
                reaped: Arc::clone(&reaped),
                exited: exited_rx,
            },
        );

        info!(
            session_id = %handle.session_id,
            pid = handle.pid,
            generation,
            working_dir = %request.working_dir.display(),
            "Agent process spawned"
        );
        self.inner
            .events
            .emit(SessionEvent::Spawned {
                session_id: handle.session_id.clone(),
                pid: handle.pid,
            })
            .await;

        start_monitor(
            Arc::clone(&self.inner),
            handle.clone(),
            launched.reader,
            launched.child,
            reaped,
            exited_tx,
        );

        Ok(handle)
    }

    /// Write raw bytes to the session's terminal.
    pub async fn send_input(&self, session_id: &str, data: &[u8]) -> Result<(), SupervisorError> {
        let writer = {
            let processes = self.inner.processes.lock().await;
            let process = processes.get(session_id).ok_or_else(|| not_running(session_id))?;
            Arc::clone(&process.writer)
        };
        let data = data.to_vec();
        let len = data.len();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut writer = writer
                .lock()
                .map_err(|_| io::Error::other("PTY writer lock poisoned"))?;
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(io::Error::other)??;
        debug!(session_id, bytes = len, "Input delivered");
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), SupervisorError> {
        let processes = self.inner.processes.lock().await;
        let process = processes.get(session_id).ok_or_else(|| not_running(session_id))?;
        process
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(pty_error)?;
        drop(processes);
        debug!(session_id, rows, cols, "Terminal resized");
        Ok(())
    }

    /// Stop the session's process tree. Returns `None` when nothing was
    /// running, so repeated calls are harmless.
    pub async fn kill(&self, session_id: &str) -> Option<ReapReport> {
        self.terminate(session_id).await.map(|(report, _)| report)
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.inner.processes.lock().await.contains_key(session_id)
    }

    pub async fn pid_of(&self, session_id: &str) -> Option<u32> {
        self.handle(session_id).await.map(|h| h.pid)
    }

    pub async fn handle(&self, session_id: &str) -> Option<ProcessHandle> {
        self.inner
            .processes
            .lock()
            .await
            .get(session_id)
            .map(|p| p.handle.clone())
    }

    pub async fn running_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.inner.processes.lock().await.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    /// Stop every live session concurrently.
    pub async fn shutdown_all(&self) -> Vec<ReapReport> {
        let mut set = JoinSet::new();
        for session_id in self.running_sessions().await {
            let supervisor = self.clone();
            set.spawn(async move { supervisor.kill(&session_id).await });
        }
        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Shutdown task failed"),
            }
        }
        info!(stopped = reports.len(), "All agent processes stopped");
        reports
    }

    /// Drop per-session bookkeeping for a session that will not run again.
    /// A live process is stopped first.
    pub async fn forget(&self, session_id: &str) -> Option<ReapReport> {
        let report = self.kill(session_id).await;
        self.inner.start_locks.lock().await.remove(session_id);
        self.inner.events.close(session_id).await;
        debug!(session_id, "Session forgotten");
        report
    }

    async fn start_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.start_locks.lock().await;
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    async fn stop_previous(&self, session_id: &str) -> Result<(), SupervisorError> {
        match self.terminate(session_id).await {
            None | Some((_, true)) => Ok(()),
            Some((report, false)) => Err(SupervisorError::PreviousInstanceStillRunning {
                session_id: session_id.to_string(),
                pid: report.pid,
            }),
        }
    }

    /// Reap the session's tree and wait (bounded) for its monitor to
    /// confirm exit.
    async fn terminate(&self, session_id: &str) -> Option<(ReapReport, bool)> {
        let (pid, reaped, mut exited) = {
            let processes = self.inner.processes.lock().await;
            let process = processes.get(session_id)?;
            (
                process.handle.pid,
                Arc::clone(&process.reaped),
                process.exited.clone(),
            )
        };

        info!(session_id, pid, "Stopping agent process");
        reaped.store(true, Ordering::SeqCst);
        let report = self.inner.reaper.kill_tree(pid, process_group(pid)).await;
        self.inner.report_reap(session_id, &report).await;

        let confirmed = matches!(
            tokio::time::timeout(
                self.inner.config.stop_confirm_timeout,
                exited.wait_for(|done| *done)
            )
            .await,
            Ok(Ok(_))
        );

        if !confirmed {
            warn!(session_id, pid, "Agent process did not confirm exit in time");
            let mut processes = self.inner.processes.lock().await;
            if let Some(process) = processes.get_mut(session_id)
                && process.handle.pid == pid
                && let Err(e) = process.killer.kill()
            {
                warn!(session_id, pid, error = %e, "Direct kill of agent process failed");
            }
        }

        Some((report, confirmed))
    }
}

impl Inner {
    async fn emit_line(&self, session_id: &str, line: String) {
        let event = match interpret(line) {
            Line::Message(message) => {
                debug!(session_id, kind = message.kind(), "Agent message");
                SessionEvent::Message {
                    session_id: session_id.to_string(),
                    message,
                }
            }
            Line::Text { kind, text } => SessionEvent::Output {
                session_id: session_id.to_string(),
                kind,
                data: text,
            },
        };
        self.events.emit(event).await;
    }

    async fn report_reap(&self, session_id: &str, report: &ReapReport) {
        if !report.zombies.is_empty() {
            warn!(session_id, pids = ?report.zombie_pids(), "Processes survived termination");
            self.events
                .emit(SessionEvent::ZombieProcessesDetected {
                    session_id: session_id.to_string(),
                    pids: report.zombie_pids(),
                    message: report.zombie_message(),
                })
                .await;
        }
        if !report.failures.is_empty() {
            self.events
                .emit(SessionEvent::Error {
                    session_id: session_id.to_string(),
                    message: format!(
                        "Cleanup of pid {} hit OS errors: {}",
                        report.pid,
                        report.failures.join("; ")
                    ),
                })
                .await;
        }
    }

    async fn finish(
        &self,
        handle: &ProcessHandle,
        received_any: bool,
        code: Option<i32>,
        signal: Option<String>,
        reaped: &AtomicBool,
        exited_tx: &watch::Sender<bool>,
    ) {
        let session_id = handle.session_id.as_str();

        if !received_any {
            warn!(session_id, pid = handle.pid, ?code, "Agent exited without any output");
            self.events
                .emit(SessionEvent::Diagnostic {
                    session_id: session_id.to_string(),
                    kind: DiagnosticKind::NoOutputStartupFailure,
                    detail: format!(
                        "{} (pid {}) exited with code {code:?} before writing any output",
                        handle.executable.display(),
                        handle.pid
                    ),
                })
                .await;
        }

        // The root is already waited on, so only its group still links the
        // orphans it left behind.
        if !reaped.swap(true, Ordering::SeqCst) {
            let report = self
                .reaper
                .kill_tree(handle.pid, process_group(handle.pid))
                .await;
            self.report_reap(session_id, &report).await;
        }

        {
            let mut processes = self.processes.lock().await;
            if processes
                .get(session_id)
                .is_some_and(|p| p.handle.generation == handle.generation)
            {
                processes.remove(session_id);
            }
        }

        info!(session_id, pid = handle.pid, ?code, ?signal, "Agent process exited");
        self.events
            .emit(SessionEvent::Exit {
                session_id: session_id.to_string(),
                pid: handle.pid,
                code,
                signal,
            })
            .await;
        // Only now may a waiting restart proceed, so its `Spawned` always
        // follows this `Exit`.
        exited_tx.send_replace(true);
    }
}

fn start_monitor(
    inner: Arc<Inner>,
    handle: ProcessHandle,
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    reaped: Arc<AtomicBool>,
    exited_tx: watch::Sender<bool>,
) {
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(READ_CHANNEL_CAPACITY);
    let spawned = std::thread::Builder::new()
        .name(format!("agentdeck-pty-{}", handle.pid))
        .spawn(move || read_pty(reader, &chunk_tx));
    if let Err(e) = spawned {
        error!(session_id = %handle.session_id, error = %e, "Failed to start PTY reader thread");
    }

    tokio::spawn(async move {
        let session_id = handle.session_id.as_str();
        let mut assembler = LineAssembler::new();
        let mut wait = tokio::task::spawn_blocking(move || {
            let mut child = child;
            child.wait()
        });

        let status = loop {
            tokio::select! {
                chunk = chunk_rx.recv() => match chunk {
                    Some(chunk) => {
                        for line in assembler.push(&chunk) {
                            inner.emit_line(session_id, line).await;
                        }
                    }
                    None => break (&mut wait).await,
                },
                status = &mut wait => break status,
            }
        };

        // Descendants may still hold the terminal open; collect what is
        // already buffered without waiting on them.
        let deadline = tokio::time::Instant::now() + inner.config.drain_timeout;
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, chunk_rx.recv()).await {
            for line in assembler.push(&chunk) {
                inner.emit_line(session_id, line).await;
            }
        }
        drop(chunk_rx);
        if let Some(rest) = assembler.finish() {
            inner.emit_line(session_id, rest).await;
        }

        let (code, signal) = match status {
            Ok(Ok(status)) => match status.signal() {
                Some(signal) => (None, Some(signal.to_string())),
                None => (i32::try_from(status.exit_code()).ok(), None),
            },
            Ok(Err(e)) => {
                warn!(session_id, error = %e, "Failed to wait for agent process");
                (None, None)
            }
            Err(e) => {
                warn!(session_id, error = %e, "Agent wait task failed");
                (None, None)
            }
        };

        inner
            .finish(
                &handle,
                assembler.received_any(),
                code,
                signal,
                &reaped,
                &exited_tx,
            )
            .await;
    });
}

fn read_pty(mut reader: Box<dyn Read + Send>, tx: &mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_BUF_LEN];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            // EIO once the last slave descriptor closes.
            Err(_) => break,
        }
    }
}

fn launch(
    config: &SupervisorConfig,
    request: &SpawnRequest,
    plan: &LaunchPlan,
) -> io::Result<Launched> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: config.pty_rows,
            cols: config.pty_cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(pty_error)?;

    let (program, argv) = plan.command_line(&request.args);
    let mut cmd = CommandBuilder::new(&program);
    cmd.args(&argv);
    cmd.cwd(&request.working_dir);
    for (key, value) in &request.env {
        cmd.env(key, value);
    }
    if let Some(path) = child_path(request, plan) {
        cmd.env("PATH", path);
    }
    if cmd.get_env("TERM").is_none() {
        cmd.env("TERM", "xterm-256color");
    }

    let mut child = pair.slave.spawn_command(cmd).map_err(pty_error)?;
    // Only the child may hold the slave, so reads see EOF when it exits.
    drop(pair.slave);

    let Some(pid) = child.process_id() else {
        let _ = child.kill();
        return Err(io::Error::other("spawned process reported no pid"));
    };
    let reader = pair.master.try_clone_reader().map_err(pty_error)?;
    let writer = pair.master.take_writer().map_err(pty_error)?;

    Ok(Launched {
        pid,
        master: pair.master,
        child,
        reader,
        writer,
    })
}

/// The group the agent runs in. The PTY child becomes a session leader, so
/// its group id is its pid; Windows has no groups.
const fn process_group(pid: u32) -> Option<u32> {
    if cfg!(unix) { Some(pid) } else { None }
}

fn pty_error(err: anyhow::Error) -> io::Error {
    match err.downcast::<io::Error>() {
        Ok(io) => io,
        Err(other) => io::Error::other(format!("{other:#}")),
    }
}

/// Errors that mean the kernel could not run the file as-is, usually a
/// script whose `#!` interpreter is missing.
fn is_interpreter_failure(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::NotFound {
        return true;
    }
    #[cfg(unix)]
    let exec_format = nix::errno::Errno::ENOEXEC as i32;
    #[cfg(windows)]
    let exec_format = 193; // ERROR_BAD_EXE_FORMAT
    err.raw_os_error() == Some(exec_format)
}

fn is_path_key(key: &str) -> bool {
    if cfg!(windows) {
        key.eq_ignore_ascii_case("PATH")
    } else {
        key == "PATH"
    }
}

/// `PATH` as the child will see it before any adjustment.
fn child_search_path(env: &[(String, String)]) -> Option<OsString> {
    env.iter()
        .rev()
        .find(|(key, _)| is_path_key(key))
        .map(|(_, value)| OsString::from(value))
        .or_else(|| std::env::var_os("PATH"))
}

/// Child `PATH` with the directories of the resolved executable and
/// interpreter appended, so nested `env node` lookups succeed.
fn child_path(request: &SpawnRequest, plan: &LaunchPlan) -> Option<OsString> {
    let mut dirs: Vec<PathBuf> = child_search_path(&request.env)
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    for dir in plan.required_dirs() {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    std::env::join_paths(dirs).ok()
}

fn not_running(session_id: &str) -> SupervisorError {
    SupervisorError::SessionNotRunning {
        session_id: session_id.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_path_overrides_inherited_path() {
        let env = vec![
            ("PATH".to_string(), "/first".to_string()),
            ("HOME".to_string(), "/home/x".to_string()),
            ("PATH".to_string(), "/second".to_string()),
        ];
        assert_eq!(child_search_path(&env), Some(OsString::from("/second")));
    }

    #[test]
    fn interpreter_failures_are_recognised() {
        assert!(is_interpreter_failure(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(!is_interpreter_failure(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        #[cfg(unix)]
        assert!(is_interpreter_failure(&io::Error::from_raw_os_error(
            nix::errno::Errno::ENOEXEC as i32
        )));
    }

    #[test]
    fn pty_errors_keep_the_io_error() {
        let err = anyhow::Error::new(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(pty_error(err).kind(), io::ErrorKind::NotFound);
        let err = anyhow::anyhow!("no pty available");
        assert_eq!(pty_error(err).to_string(), "no pty available");
    }

    #[tokio::test]
    async fn operations_on_unknown_session() {
        let supervisor = ProcessSupervisor::new(
            SupervisorConfig::default(),
            ExecutableResolver::new("agentdeck-none", Vec::new()),
            ProcessReaper::default(),
            Arc::new(EventHub::default()),
        );
        assert!(supervisor.kill("ghost").await.is_none());
        assert!(!supervisor.is_running("ghost").await);
        assert!(matches!(
            supervisor.send_input("ghost", b"hi").await,
            Err(SupervisorError::SessionNotRunning { .. })
        ));
        assert!(matches!(
            supervisor.resize("ghost", 10, 10).await,
            Err(SupervisorError::SessionNotRunning { .. })
        ));
        assert!(supervisor.shutdown_all().await.is_empty());
    }

    #[tokio::test]
    async fn forget_releases_session_bookkeeping() {
        let events = Arc::new(EventHub::default());
        let supervisor = ProcessSupervisor::new(
            SupervisorConfig::default(),
            ExecutableResolver::new("agentdeck-none", Vec::new()),
            ProcessReaper::default(),
            Arc::clone(&events),
        );
        let mut rx = events.subscribe("s1").await;
        supervisor.start_lock("s1").await;
        assert_eq!(events.session_count().await, 1);

        assert!(supervisor.forget("s1").await.is_none());
        assert!(supervisor.inner.start_locks.lock().await.is_empty());
        assert_eq!(events.session_count().await, 0);
        assert!(matches!(
            rx.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Closed)
        ));
    }
}
