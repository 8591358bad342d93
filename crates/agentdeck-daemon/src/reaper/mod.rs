//! Process-tree termination.
//!
//! Killing an agent must also kill everything it started: language servers,
//! shells, `git` children, dev servers. [`ProcessReaper::kill`] discovers the
//! tree, terminates it in two phases and then checks for survivors, which are
//! reported rather than dropped.
//!
//! Both the process group and each discovered pid are signalled. A process
//! started through an intermediate shell does not always keep a clean group
//! relationship, and on Windows there are no groups at all. Members of the
//! session the root led are tracked too, so orphans of an already-exited
//! root are still found.

mod table;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as platform;
#[cfg(windows)]
use windows as platform;

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use agentdeck_core::config::ReaperConfig;

pub use table::{ProcessEntry, ProcessTable};

/// A process that survived termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZombieProcess {
    pub pid: u32,
    /// Best-effort executable name.
    pub name: Option<String>,
}

/// Outcome of one [`ProcessReaper::kill`] pass.
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    pub pid: u32,
    /// Descendants and group members found before signalling.
    pub discovered: BTreeSet<u32>,
    pub zombies: Vec<ZombieProcess>,
    /// OS-level failures (enumeration or signalling) other than
    /// "no such process".
    pub failures: Vec<String>,
    /// Whether the survivor check could run.
    pub verified: bool,
}

impl ReapReport {
    pub fn success(&self) -> bool {
        self.verified && self.zombies.is_empty()
    }

    pub fn zombie_pids(&self) -> Vec<u32> {
        self.zombies.iter().map(|z| z.pid).collect()
    }

    /// Human-readable summary for the session's warning stream.
    pub fn zombie_message(&self) -> String {
        let listed: Vec<String> = self
            .zombies
            .iter()
            .map(|z| match &z.name {
                Some(name) => format!("{} ({name})", z.pid),
                None => z.pid.to_string(),
            })
            .collect();
        format!(
            "{} process(es) from pid {} survived termination: {}. Kill them manually.",
            self.zombies.len(),
            self.pid,
            listed.join(", ")
        )
    }
}

/// Discovers and terminates whole process trees.
#[derive(Debug, Clone)]
pub struct ProcessReaper {
    grace_period: Duration,
    settle: Duration,
}

impl Default for ProcessReaper {
    fn default() -> Self {
        Self::from_config(&ReaperConfig::default())
    }
}

impl ProcessReaper {
    pub const fn new(grace_period: Duration, settle: Duration) -> Self {
        Self {
            grace_period,
            settle,
        }
    }

    pub const fn from_config(config: &ReaperConfig) -> Self {
        Self::new(
            Duration::from_millis(config.grace_period_ms),
            Duration::from_millis(config.settle_ms),
        )
    }

    /// Transitive descendants of `pid` as seen right now.
    pub async fn descendants(&self, pid: u32) -> Result<BTreeSet<u32>, String> {
        Ok(platform::snapshot().await?.descendants(pid))
    }

    /// Terminate `pid` and every process it spawned.
    ///
    /// Never fails: problems are carried in the report. Calling it for a pid
    /// that is already gone is harmless.
    pub async fn kill(&self, pid: u32) -> ReapReport {
        self.kill_tree(pid, None).await
    }

    /// Like [`ProcessReaper::kill`], with the process group the caller
    /// started `pid` in. The group is signalled and checked even when the
    /// root has already been waited on.
    pub async fn kill_tree(&self, pid: u32, known_group: Option<u32>) -> ReapReport {
        let mut report = ReapReport {
            pid,
            ..ReapReport::default()
        };

        if pid == 0 || pid == std::process::id() {
            warn!(pid, "Refusing to reap invalid or own pid");
            report.failures.push(format!("refused to reap pid {pid}"));
            return report;
        }

        let table = match platform::snapshot().await {
            Ok(table) => Some(table),
            Err(e) => {
                warn!(pid, error = %e, "Process enumeration failed, signalling root only");
                report.failures.push(e);
                None
            }
        };

        let pgid = platform::target_group(pid, known_group, table.as_ref());
        if let Some(table) = &table {
            report.discovered = table.descendants(pid);
            report.discovered.extend(platform::session_members(table, pid));
            if let Some(pgid) = pgid {
                report.discovered.extend(table.group_members(pgid, pid));
            }
        }
        report.discovered.remove(&std::process::id());

        debug!(
            pid,
            ?pgid,
            discovered = report.discovered.len(),
            "Terminating process tree"
        );

        platform::graceful(pid, pgid, &mut report.failures).await;
        tokio::time::sleep(self.grace_period).await;
        platform::forceful(pid, pgid, &report.discovered, &mut report.failures).await;
        tokio::time::sleep(self.settle).await;

        match platform::snapshot().await {
            Ok(after) => {
                report.verified = true;
                // Anything started after discovery that escaped the group
                // shows up here by ancestry or session.
                let mut suspects: BTreeSet<u32> = report.discovered.clone();
                suspects.insert(pid);
                suspects.extend(after.descendants(pid));
                suspects.extend(platform::session_members(&after, pid));
                if let Some(pgid) = pgid {
                    suspects.extend(after.group_members(pgid, pid));
                }
                suspects.remove(&std::process::id());
                report.zombies = suspects
                    .into_iter()
                    .filter(|p| after.is_alive(*p))
                    .map(|p| ZombieProcess {
                        pid: p,
                        name: after.name_of(p).map(String::from),
                    })
                    .collect();
            }
            Err(e) => {
                warn!(pid, error = %e, "Could not verify process tree termination");
                report.failures.push(e);
            }
        }

        if report.zombies.is_empty() {
            info!(
                pid,
                killed = report.discovered.len() + 1,
                verified = report.verified,
                "Process tree terminated"
            );
        } else {
            warn!(pid, zombies = ?report.zombie_pids(), "Processes survived termination");
        }
        report
    }
}
