//! Windows process enumeration and tree termination.
//!
//! Windows has no signals or process groups; `taskkill /T` walks the tree
//! natively, and every individually discovered id is killed as well in case
//! an intermediate process already exited and broke the parent chain.

use std::collections::BTreeSet;
use std::os::windows::process::CommandExt;

use tokio::process::Command;
use tracing::warn;

use super::table::ProcessTable;

const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// `taskkill` exit code for "process not found".
const TASKKILL_NOT_FOUND: i32 = 128;

const CIM_QUERY: &str = "Get-CimInstance Win32_Process | \
     Select-Object ProcessId,ParentProcessId,Name | ConvertTo-Csv -NoTypeInformation";

pub(super) async fn snapshot() -> Result<ProcessTable, String> {
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", CIM_QUERY])
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .await
        .map_err(|e| format!("failed to query Win32_Process: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "process query exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(ProcessTable::parse_cim_csv(&String::from_utf8_lossy(
        &output.stdout,
    )))
}

pub(super) fn target_group(
    _pid: u32,
    _known: Option<u32>,
    _table: Option<&ProcessTable>,
) -> Option<u32> {
    None
}

pub(super) fn session_members(_table: &ProcessTable, _pid: u32) -> BTreeSet<u32> {
    BTreeSet::new()
}

pub(super) async fn graceful(pid: u32, _pgid: Option<u32>, failures: &mut Vec<String>) {
    taskkill(pid, false, failures).await;
}

pub(super) async fn forceful(
    pid: u32,
    _pgid: Option<u32>,
    discovered: &BTreeSet<u32>,
    failures: &mut Vec<String>,
) {
    taskkill(pid, true, failures).await;
    for &child in discovered {
        taskkill(child, true, failures).await;
    }
}

async fn taskkill(pid: u32, force: bool, failures: &mut Vec<String>) {
    let pid_arg = pid.to_string();
    let mut cmd = Command::new("taskkill");
    cmd.args(["/PID", pid_arg.as_str(), "/T"]);
    if force {
        cmd.arg("/F");
    }
    match cmd.creation_flags(CREATE_NO_WINDOW).output().await {
        Ok(output) if output.status.success() => {}
        Ok(output) if output.status.code() == Some(TASKKILL_NOT_FOUND) => {}
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(pid, force, error = %stderr.trim(), "taskkill failed");
            failures.push(format!("taskkill {pid}: {}", stderr.trim()));
        }
        Err(e) => {
            warn!(pid, force, error = %e, "Failed to run taskkill");
            failures.push(format!("taskkill {pid}: {e}"));
        }
    }
}
