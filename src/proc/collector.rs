use std::sync::Arc;

use async_trait::async_trait;
use log::*;

use crate::{
    metrics::{Collector, Desc, Metric},
    proc::{
        ProcError,
        stat::{BootTime, StartTimeResolver},
        table::{MatchStrategy, NameMatcher, ProcessTable},
    },
};

pub const METRIC_NAME: &str = "process_start_time_seconds";

/// Reports `process_start_time_seconds{process_name, pid}` for every running
/// process that matches one of the monitored names.
///
/// Each scrape lists the process table once and reads boot time at most
/// once; nothing is kept between scrapes. The scan is blocking I/O and runs
/// on the blocking thread pool.
pub struct ProcessStartTimeCollector {
    scan: Arc<Scan>,
}

struct Scan {
    names: Vec<(String, NameMatcher)>,
    table: Box<dyn ProcessTable>,
    resolver: StartTimeResolver,
    desc: Arc<Desc>,
}

impl ProcessStartTimeCollector {
    pub fn new(
        names: &[String],
        strategy: MatchStrategy,
        table: Box<dyn ProcessTable>,
        resolver: StartTimeResolver,
    ) -> Result<Self, regex::Error> {
        let names = names
            .iter()
            .map(|name| Ok((name.clone(), NameMatcher::new(strategy, name)?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        let scan = Scan {
            names,
            table,
            resolver,
            desc: Desc::gauge(
                METRIC_NAME,
                "Process start time in seconds since epoch",
                &["process_name", "pid"],
            ),
        };
        Ok(Self {
            scan: Arc::new(scan),
        })
    }

    /// One produce pass on the calling thread. A failure for one process
    /// only costs that process's sample.
    pub fn produce(&self, out: &mut Vec<Metric>) {
        self.scan.produce(out);
    }
}

impl Scan {
    fn produce(&self, out: &mut Vec<Metric>) {
        let entries = match self.table.processes() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(target: "Collector", "{}", err);
                out.push(Metric::invalid(&self.desc, err));
                return;
            }
        };

        let mut boot_time: Option<BootTime> = None;
        for (name, matcher) in &self.names {
            let matches = matcher.find(&entries);
            debug!(target: "Collector", "{} matched {} processes", name, matches.len());
            for record in matches {
                let boot = match boot_time {
                    Some(boot) => boot,
                    None => match self.resolver.boot_time() {
                        Ok(boot) => *boot_time.insert(boot),
                        Err(err) => {
                            out.push(Metric::invalid(
                                &self.desc,
                                format!("failed to get boot time: {}", err),
                            ));
                            return;
                        }
                    },
                };
                let pid = record.pid.to_string();
                let metric = match self.resolver.resolve(record.pid, boot) {
                    Ok(start) => Metric::gauge(&self.desc, start, &[name.as_str(), pid.as_str()]),
                    Err(err) => {
                        if let ProcError::Unavailable { .. } = err {
                            debug!(target: "Collector", "PID {} vanished: {}", record.pid, err);
                        }
                        Metric::invalid(
                            &self.desc,
                            format!("failed to get start time for PID {}: {}", record.pid, err),
                        )
                    }
                };
                out.push(metric);
            }
        }
    }
}

#[async_trait]
impl Collector for ProcessStartTimeCollector {
    fn describe(&self) -> Vec<Arc<Desc>> {
        vec![Arc::clone(&self.scan.desc)]
    }

    async fn collect(&self, out: &mut Vec<Metric>) {
        let scan = Arc::clone(&self.scan);
        let pass = tokio::task::spawn_blocking(move || {
            let mut produced = Vec::new();
            scan.produce(&mut produced);
            produced
        });
        match pass.await {
            Ok(produced) => out.extend(produced),
            Err(err) => out.push(Metric::invalid(
                &self.scan.desc,
                format!("process scan did not complete: {}", err),
            )),
        }
    }
}
