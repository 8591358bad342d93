//! Unix process enumeration and signalling.

use std::collections::BTreeSet;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use tokio::process::Command;
use tracing::warn;

use super::table::ProcessTable;

pub(super) async fn snapshot() -> Result<ProcessTable, String> {
    let output = Command::new("ps")
        .args(["-A", "-o", "pid=,ppid=,pgid=,stat=,comm="])
        .output()
        .await
        .map_err(|e| format!("failed to run ps: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "ps exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(ProcessTable::parse_ps(&String::from_utf8_lossy(&output.stdout)))
}

/// The process group to signal alongside `pid`, if it is safe to do so.
///
/// `known` is the group the caller created the process in; it is used as is,
/// since an already-reaped root has no row and no `getpgid` answer.
///
/// Our own group is never returned: a child that failed to become a group
/// leader shares it, and signalling it would take the supervisor down too.
pub(super) fn target_group(
    pid: u32,
    known: Option<u32>,
    table: Option<&ProcessTable>,
) -> Option<u32> {
    let pgid = known
        .or_else(|| table.and_then(|t| t.pgid_of(pid)))
        .or_else(|| {
            let target = to_pid(pid)?;
            unistd::getpgid(Some(target))
                .ok()
                .and_then(|g| u32::try_from(g.as_raw()).ok())
        })?;
    let own = u32::try_from(unistd::getpgrp().as_raw()).ok();
    (pgid > 1 && Some(pgid) != own).then_some(pgid)
}

/// Live processes in the session led by `pid`. A member that moved to its
/// own process group, or was orphaned to init, still keeps the session id.
pub(super) fn session_members(table: &ProcessTable, pid: u32) -> BTreeSet<u32> {
    let Some(leader) = to_pid(pid) else {
        return BTreeSet::new();
    };
    table
        .pids()
        .filter(|&member| member != pid)
        .filter(|&member| {
            to_pid(member).is_some_and(|p| unistd::getsid(Some(p)).is_ok_and(|sid| sid == leader))
        })
        .collect()
}

#[allow(clippy::unused_async)]
pub(super) async fn graceful(pid: u32, pgid: Option<u32>, failures: &mut Vec<String>) {
    signal_pid(pid, Signal::SIGTERM, failures);
    if let Some(pgid) = pgid {
        signal_group(pgid, Signal::SIGTERM, failures);
    }
}

#[allow(clippy::unused_async)]
pub(super) async fn forceful(
    pid: u32,
    pgid: Option<u32>,
    discovered: &BTreeSet<u32>,
    failures: &mut Vec<String>,
) {
    signal_pid(pid, Signal::SIGKILL, failures);
    if let Some(pgid) = pgid {
        signal_group(pgid, Signal::SIGKILL, failures);
    }
    for &child in discovered {
        signal_pid(child, Signal::SIGKILL, failures);
    }
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

fn signal_pid(pid: u32, sig: Signal, failures: &mut Vec<String>) {
    let Some(target) = to_pid(pid) else {
        return;
    };
    match signal::kill(target, sig) {
        // Already gone.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(pid, signal = sig.as_str(), error = %e, "Failed to signal process");
            failures.push(format!("{} to pid {pid}: {e}", sig.as_str()));
        }
    }
}

fn signal_group(pgid: u32, sig: Signal, failures: &mut Vec<String>) {
    let Some(target) = to_pid(pgid) else {
        return;
    };
    match signal::killpg(target, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(pgid, signal = sig.as_str(), error = %e, "Failed to signal process group");
            failures.push(format!("{} to group {pgid}: {e}", sig.as_str()));
        }
    }
}
