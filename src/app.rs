use std::{fmt::Write, sync::Arc};

use color_eyre::eyre::Result;
use log::*;

use crate::{
    config::{ExporterConfig, NodeKind},
    metrics::Registry,
    proc::{
        ProcFs, ProcessStartTimeCollector, ProcessTable, ProcessTableKind, ProcfsTable,
        StartTimeResolver, SysinfoTable,
    },
    rpc::{RpcClient, eth_collectors, evm_collectors},
    server,
};

/// The exporter: effective configuration plus the registry built from it.
pub struct App {
    pub config: ExporterConfig,
    pub registry: Registry,
}

impl App {
    /// Build every collector the configuration enables and register it.
    pub fn new(config: ExporterConfig) -> Result<Self> {
        let mut registry = Registry::new();

        let rpc_collectors = match config.node {
            NodeKind::None => vec![],
            kind => {
                let client = Arc::new(RpcClient::new(&config.url, config.rpc_timeout())?);
                info!(target: "App", "Scraping {:?} node at {}", kind, client.url());
                match kind {
                    NodeKind::Eth => eth_collectors(&client),
                    _ => evm_collectors(&client),
                }
            }
        };
        for collector in rpc_collectors {
            registry.register(collector)?;
        }

        if !config.processes.is_empty() {
            let table: Box<dyn ProcessTable> = match config.process_table {
                ProcessTableKind::Sysinfo => Box::new(SysinfoTable),
                ProcessTableKind::Procfs => Box::new(ProcfsTable::new(&config.proc_root)),
            };
            let clock_ticks = config.clock_ticks();
            let resolver = StartTimeResolver::new(ProcFs::new(&config.proc_root), clock_ticks);
            let collector = ProcessStartTimeCollector::new(
                &config.processes,
                config.match_strategy,
                table,
                resolver,
            )?;
            registry.register(Box::new(collector))?;
            info!(
                target: "App",
                "Monitoring start times of {:?} ({} ticks/s)",
                config.processes,
                clock_ticks.per_second()
            );
        }

        if registry.is_empty() {
            warn!(target: "App", "No collectors enabled; /metrics will be empty");
        }
        Ok(Self { config, registry })
    }

    /// Serve scrapes until interrupted.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen_addr()?;
        server::serve(addr, Arc::new(self.registry)).await
    }

    /// One line per registered metric shape.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for desc in self.registry.descs() {
            let _ = write!(out, "{} (gauge)", desc.name);
            if !desc.labels.is_empty() {
                let _ = write!(out, " [{}]", desc.labels.join(", "));
            }
            let _ = writeln!(out, ": {}", desc.help);
        }
        out
    }
}
