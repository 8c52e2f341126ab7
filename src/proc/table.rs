use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use log::*;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::proc::ProcError;

/// A live process as listed by the OS: PID plus argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub argv: Vec<String>,
}

impl ProcessEntry {
    /// Basename of `argv[0]`.
    pub fn exe_name(&self) -> &str {
        let first = self.argv.first().map(String::as_str).unwrap_or_default();
        Path::new(first)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(first)
    }

    /// The full command line, arguments separated by NUL as in procfs.
    pub fn cmdline(&self) -> String {
        self.argv.join("\0")
    }
}

/// A process that matched a monitored name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
}

/// Lists the processes currently running. Listing order is kept by callers.
pub trait ProcessTable: Send + Sync {
    fn processes(&self) -> Result<Vec<ProcessEntry>, ProcError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProcessTableKind {
    /// Enumerate through the sysinfo crate.
    #[default]
    Sysinfo,
    /// Walk the numeric directories of the procfs root.
    Procfs,
}

/// Process table backed by sysinfo. A fresh `System` is built on every call
/// so nothing is carried between scrapes. Threads are not processes and are
/// left out.
#[derive(Debug, Default)]
pub struct SysinfoTable;

impl ProcessTable for SysinfoTable {
    fn processes(&self) -> Result<Vec<ProcessEntry>, ProcError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ProcError::EnumerationUnavailable(
                "sysinfo does not support this platform".to_string(),
            ));
        }
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::Always)
                .without_tasks(),
        );
        let mut entries: Vec<ProcessEntry> = sys
            .processes()
            .iter()
            .filter(|(_, info)| info.thread_kind().is_none())
            .map(|(pid, info)| ProcessEntry {
                pid: pid.as_u32(),
                argv: info
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect();
        entries.sort_by_key(|e| e.pid);
        Ok(entries)
    }
}

/// Process table read straight from `<root>/<pid>/cmdline`.
#[derive(Debug, Clone)]
pub struct ProcfsTable {
    root: PathBuf,
}

impl ProcfsTable {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcessTable for ProcfsTable {
    fn processes(&self) -> Result<Vec<ProcessEntry>, ProcError> {
        let dir = fs::read_dir(&self.root).map_err(|e| {
            ProcError::EnumerationUnavailable(format!("{:?}: {}", self.root, e))
        })?;
        let mut entries = Vec::new();
        for entry in dir.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Gone between listing and reading: not a match.
            let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
                trace!(target: "Procfs", "Skipping PID {}: cmdline unreadable", pid);
                continue;
            };
            let cmdline = String::from_utf8_lossy(&raw);
            let argv = cmdline
                .strip_suffix('\0')
                .unwrap_or(&cmdline)
                .split('\0')
                .map(str::to_string)
                .collect();
            entries.push(ProcessEntry { pid, argv });
        }
        entries.sort_by_key(|e| e.pid);
        Ok(entries)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    /// Name fragment appears in the executable name or command line.
    #[default]
    Substring,
    /// Executable name equals the configured name.
    Exact,
    /// Configured name is a regular expression over executable name or command line.
    Regex,
}

/// A monitored name compiled for one [`MatchStrategy`].
#[derive(Debug, Clone)]
pub enum NameMatcher {
    Substring(String),
    Exact(String),
    Regex(regex::Regex),
}

impl NameMatcher {
    pub fn new(strategy: MatchStrategy, name: &str) -> Result<Self, regex::Error> {
        Ok(match strategy {
            MatchStrategy::Substring => NameMatcher::Substring(name.to_string()),
            MatchStrategy::Exact => NameMatcher::Exact(name.to_string()),
            MatchStrategy::Regex => NameMatcher::Regex(regex::Regex::new(name)?),
        })
    }

    pub fn matches(&self, entry: &ProcessEntry) -> bool {
        let exe = entry.exe_name();
        match self {
            NameMatcher::Substring(name) => {
                exe.contains(name.as_str()) || entry.cmdline().contains(name.as_str())
            }
            NameMatcher::Exact(name) => exe == name,
            NameMatcher::Regex(re) => re.is_match(exe) || re.is_match(&entry.cmdline()),
        }
    }

    /// Processes in `entries` this matcher selects, in listing order.
    /// Entries without a command line (kernel threads) never match.
    pub fn find(&self, entries: &[ProcessEntry]) -> Vec<ProcessRecord> {
        entries
            .iter()
            .filter(|e| e.argv.iter().any(|a| !a.is_empty()))
            .filter(|e| self.matches(e))
            .map(|e| ProcessRecord {
                pid: e.pid,
                name: e.exe_name().to_string(),
            })
            .collect()
    }
}
