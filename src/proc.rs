//! Process discovery and start time resolution from procfs.

use std::{io, path::PathBuf};

use thiserror::Error;

pub mod collector;
pub mod stat;
pub mod table;

pub use collector::ProcessStartTimeCollector;
pub use stat::{BootTime, ClockTicks, ProcFs, StartTimeResolver};
pub use table::{
    MatchStrategy, NameMatcher, ProcessEntry, ProcessRecord, ProcessTable, ProcessTableKind,
    ProcfsTable, SysinfoTable,
};

#[derive(Debug, Error)]
pub enum ProcError {
    /// The process table as a whole could not be listed.
    #[error("process table unavailable: {0}")]
    EnumerationUnavailable(String),

    /// The accounting record of one process could not be read.
    #[error("failed to read {path:?}: {source}")]
    Unavailable {
        pid: u32,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed stat record for PID {pid}: {reason}")]
    Malformed { pid: u32, reason: String },

    #[error("boot time unavailable: {0}")]
    BootTimeUnavailable(String),
}
