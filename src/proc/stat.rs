//! Start time resolution from kernel process accounting.
//!
//! `/proc/<pid>/stat` field 22 (`starttime`) holds the number of clock
//! ticks between system boot and process start. Adding that, converted to
//! seconds, to `btime` from `/proc/stat` gives the absolute start time.

use std::{fs, path::PathBuf};

use log::*;

use crate::proc::ProcError;

/// Fallback when the platform cannot report its tick rate.
pub const DEFAULT_CLOCK_TICKS: u64 = 100;

/// 1-based position of `starttime` in `/proc/<pid>/stat`.
const STARTTIME_FIELD: usize = 22;

/// Fields before the ones following `comm`: `pid` and `comm` itself.
const LEADING_FIELDS: usize = 2;

/// Kernel scheduling ticks per second.
///
/// Resolved once at startup. Kernels built with a `USER_HZ` other than the
/// value reported here will produce skewed start times unless the rate is
/// configured explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTicks(u64);

impl ClockTicks {
    /// Returns `None` for a zero rate.
    pub fn new(per_second: u64) -> Option<Self> {
        (per_second > 0).then_some(Self(per_second))
    }

    /// The rate reported by `sysconf(_SC_CLK_TCK)`, or [`DEFAULT_CLOCK_TICKS`].
    pub fn platform() -> Self {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no preconditions and only reads configuration.
            let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
            if ticks > 0 {
                return Self(ticks as u64);
            }
        }
        warn!(target: "Procfs", "Cannot detect clock tick rate, assuming {}", DEFAULT_CLOCK_TICKS);
        Self(DEFAULT_CLOCK_TICKS)
    }

    pub fn per_second(&self) -> u64 {
        self.0
    }

    pub fn to_seconds(&self, ticks: u64) -> f64 {
        ticks as f64 / self.0 as f64
    }
}

/// System boot time in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTime(pub u64);

/// Reader for the procfs files the resolver depends on.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn boot_time(&self) -> Result<BootTime, ProcError> {
        let path = self.root.join("stat");
        let content = fs::read_to_string(&path)
            .map_err(|e| ProcError::BootTimeUnavailable(format!("failed to read {:?}: {}", path, e)))?;
        parse_boot_time(&content).map(BootTime).map_err(ProcError::BootTimeUnavailable)
    }

    /// Ticks between boot and the start of `pid`.
    pub fn start_ticks(&self, pid: u32) -> Result<u64, ProcError> {
        let path = self.root.join(pid.to_string()).join("stat");
        let content = fs::read_to_string(&path).map_err(|source| ProcError::Unavailable {
            pid,
            path: path.clone(),
            source,
        })?;
        parse_start_ticks(&content).map_err(|reason| ProcError::Malformed { pid, reason })
    }
}

/// Extract `btime` from the contents of `/proc/stat`.
pub fn parse_boot_time(content: &str) -> Result<u64, String> {
    let line = content
        .lines()
        .find(|l| l.starts_with("btime "))
        .ok_or_else(|| "btime not found".to_string())?;
    let value = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| "btime has no value".to_string())?;
    value
        .parse()
        .map_err(|e| format!("failed to parse btime {:?}: {}", value, e))
}

/// Extract `starttime` from the contents of `/proc/<pid>/stat`.
///
/// `comm` is wrapped in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_start_ticks(stat: &str) -> Result<u64, String> {
    let close = stat.rfind(')').ok_or_else(|| "missing comm field".to_string())?;
    let index = STARTTIME_FIELD - LEADING_FIELDS - 1;
    let rest: Vec<&str> = stat[close + 1..].split_whitespace().collect();
    let field = rest.get(index).ok_or_else(|| {
        format!(
            "expected at least {} fields, got {}",
            STARTTIME_FIELD,
            rest.len() + LEADING_FIELDS
        )
    })?;
    field
        .parse()
        .map_err(|e| format!("failed to parse starttime {:?}: {}", field, e))
}

/// Turns a PID into its absolute start time.
#[derive(Debug, Clone)]
pub struct StartTimeResolver {
    procfs: ProcFs,
    clock_ticks: ClockTicks,
}

impl StartTimeResolver {
    pub fn new(procfs: ProcFs, clock_ticks: ClockTicks) -> Self {
        Self { procfs, clock_ticks }
    }

    pub fn boot_time(&self) -> Result<BootTime, ProcError> {
        self.procfs.boot_time()
    }

    /// Start time of `pid` in Unix seconds, given the boot time of this scrape.
    pub fn resolve(&self, pid: u32, boot_time: BootTime) -> Result<f64, ProcError> {
        let ticks = self.procfs.start_ticks(pid)?;
        Ok(boot_time.0 as f64 + self.clock_ticks.to_seconds(ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_line(pid: u32, comm: &str, ticks: u64) -> String {
        format!("{pid} ({comm}) S 1 {pid} {pid} 0 -1 4194560 1021 0 0 0 3 5 0 0 20 0 1 0 {ticks} 16953344 1652 18446744073709551615\n")
    }

    #[test]
    fn boot_time_from_proc_stat() {
        let content = "cpu  10 0 20 300 0 0 0 0 0 0\nintr 5\nctxt 99\nbtime 1700000000\nprocesses 42\n";
        assert_eq!(parse_boot_time(content), Ok(1_700_000_000));
    }

    #[test]
    fn boot_time_missing_or_garbled() {
        assert!(parse_boot_time("cpu 1 2 3\n").unwrap_err().contains("not found"));
        assert!(parse_boot_time("btime soon\n").unwrap_err().contains("failed to parse"));
    }

    #[test]
    fn start_ticks_from_stat() {
        assert_eq!(parse_start_ticks(&stat_line(1234, "sshd", 500)), Ok(500));
    }

    #[test]
    fn start_ticks_with_awkward_comm() {
        assert_eq!(parse_start_ticks(&stat_line(77, "tmux: server (1)", 4242)), Ok(4242));
    }

    #[test]
    fn start_ticks_malformed() {
        assert!(parse_start_ticks("1234 sshd S 1").unwrap_err().contains("missing comm"));
        assert!(parse_start_ticks("1234 (sshd) S 1 2 3").unwrap_err().contains("at least 22 fields, got 6"));
        let garbled = stat_line(1, "init", 0).replace(" 0 16953344", " soon 16953344");
        assert!(parse_start_ticks(&garbled).unwrap_err().contains("failed to parse starttime"));
    }

    #[test]
    fn clock_ticks_convert_to_seconds() {
        let ticks = ClockTicks::new(100).unwrap();
        assert_eq!(ticks.to_seconds(550), 5.5);
        assert!(ClockTicks::new(0).is_none());
        assert!(ClockTicks::platform().per_second() > 0);
    }

    #[test]
    fn resolve_adds_ticks_to_boot_time() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("1234")).unwrap();
        fs::write(root.path().join("1234/stat"), stat_line(1234, "sshd", 500)).unwrap();
        fs::write(root.path().join("stat"), "btime 1000000\n").unwrap();

        let resolver = StartTimeResolver::new(ProcFs::new(root.path()), ClockTicks::new(100).unwrap());
        let boot = resolver.boot_time().unwrap();
        assert_eq!(boot, BootTime(1_000_000));
        assert_eq!(resolver.resolve(1234, boot).unwrap(), 1_000_005.0);
    }

    #[test]
    fn resolve_reports_distinct_failures() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("9")).unwrap();
        fs::write(root.path().join("9/stat"), "9 (x) S").unwrap();
        let resolver = StartTimeResolver::new(ProcFs::new(root.path()), ClockTicks::new(100).unwrap());

        assert!(matches!(resolver.boot_time(), Err(ProcError::BootTimeUnavailable(_))));
        assert!(matches!(
            resolver.resolve(8, BootTime(0)),
            Err(ProcError::Unavailable { pid: 8, .. })
        ));
        assert!(matches!(
            resolver.resolve(9, BootTime(0)),
            Err(ProcError::Malformed { pid: 9, .. })
        ));
    }
}
