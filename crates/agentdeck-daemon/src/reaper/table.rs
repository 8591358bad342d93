//! Process-table snapshots and tree walks.
//!
//! A snapshot is taken in one shot (one `ps` / CIM query) and every
//! descendant and group lookup in a reap pass is answered from it, which keeps
//! the enumeration self-consistent even while processes come and go.

use std::collections::{BTreeSet, HashMap, VecDeque};

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    /// Process group; `None` on platforms without the concept.
    pub pgid: Option<u32>,
    /// Exited but not yet waited for by its parent.
    pub defunct: bool,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: HashMap<u32, ProcessEntry>,
}

impl ProcessTable {
    pub fn from_entries(entries: impl IntoIterator<Item = ProcessEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.pid, e)).collect(),
        }
    }

    /// Parse `ps -A -o pid=,ppid=,pgid=,stat=,comm=` output.
    ///
    /// The command name is last because it may contain spaces.
    pub fn parse_ps(output: &str) -> Self {
        Self::from_entries(output.lines().filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            let pgid = fields.next()?.parse().ok()?;
            let stat = fields.next()?;
            let name = fields.collect::<Vec<_>>().join(" ");
            Some(ProcessEntry {
                pid,
                ppid,
                pgid: Some(pgid),
                defunct: stat.starts_with('Z'),
                name,
            })
        }))
    }

    /// Parse `Win32_Process` rows exported with
    /// `Select-Object ProcessId,ParentProcessId,Name | ConvertTo-Csv`.
    pub fn parse_cim_csv(output: &str) -> Self {
        Self::from_entries(output.lines().filter_map(|line| {
            let mut fields = line.splitn(3, ',').map(|f| f.trim().trim_matches('"'));
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            let name = fields.next().unwrap_or_default().to_string();
            Some(ProcessEntry {
                pid,
                ppid,
                pgid: None,
                defunct: false,
                name,
            })
        }))
    }

    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessEntry> {
        self.entries.get(&pid)
    }

    /// Present in the table and not a defunct entry.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.entries.get(&pid).is_some_and(|e| !e.defunct)
    }

    pub fn name_of(&self, pid: u32) -> Option<&str> {
        self.entries
            .get(&pid)
            .map(|e| e.name.as_str())
            .filter(|n| !n.is_empty())
    }

    pub fn pgid_of(&self, pid: u32) -> Option<u32> {
        self.entries.get(&pid).and_then(|e| e.pgid)
    }

    /// All transitive descendants of `root`, excluding `root` itself.
    pub fn descendants(&self, root: u32) -> BTreeSet<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in self.entries.values() {
            if entry.pid != entry.ppid {
                children.entry(entry.ppid).or_default().push(entry.pid);
            }
        }

        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            for &child in children.get(&pid).map_or(&[][..], Vec::as_slice) {
                if child != root && found.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        found
    }

    /// Members of process group `pgid`, excluding `except`.
    pub fn group_members(&self, pgid: u32, except: u32) -> BTreeSet<u32> {
        self.entries
            .values()
            .filter(|e| e.pgid == Some(pgid) && e.pid != except)
            .map(|e| e.pid)
            .collect()
    }
}
