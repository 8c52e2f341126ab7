//! Layered exporter configuration.
//!
//! Built-in defaults, then an optional TOML file, then `ETHEREUM_EXPORTER_*`
//! environment variables, then command line flags.

use std::{
    collections::HashSet,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::{Result, eyre::eyre};
use log::*;
use serde::{Deserialize, Serialize};

use crate::proc::{ClockTicks, MatchStrategy, NameMatcher, ProcessTableKind};

pub const DEFAULT_FILE: &str = "ethereum_exporter.toml";
pub const DEFAULT_URL: &str = "http://localhost:8545";
pub const DEFAULT_ADDR: &str = ":9368";
pub const DEFAULT_PROC_ROOT: &str = "/proc";
const ENV_PREFIX: &str = "ETHEREUM_EXPORTER";

/// Which RPC collector set to register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// No RPC collectors.
    #[default]
    None,
    /// Block number and timestamp only.
    Evm,
    /// Every RPC collector.
    Eth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    pub url: String,
    pub addr: String,
    #[serde(default)]
    pub processes: Vec<String>,
    #[serde(default)]
    pub node: NodeKind,
    #[serde(default, rename = "match")]
    pub match_strategy: MatchStrategy,
    #[serde(default)]
    pub process_table: ProcessTableKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_ticks: Option<u64>,
    pub proc_root: PathBuf,
    pub rpc_timeout_seconds: u64,
}

/// Values given on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub url: Option<String>,
    pub addr: Option<String>,
    /// Comma separated process names.
    pub processes: Option<String>,
    pub evm: bool,
    pub eth: bool,
    pub match_strategy: Option<MatchStrategy>,
    pub process_table: Option<ProcessTableKind>,
    pub clock_ticks: Option<u64>,
    pub proc_root: Option<PathBuf>,
}

impl ExporterConfig {
    /// Load, apply overrides, normalise and validate.
    pub fn load(file_path: &Path, overrides: Overrides) -> Result<ExporterConfig> {
        if file_path.exists() {
            info!(target: "Config", "Loading {:?}", file_path);
        } else {
            debug!(target: "Config", "No config file at {:?}, using defaults", file_path);
        }
        let raw = config::Config::builder()
            .set_default("url", DEFAULT_URL)?
            .set_default("addr", DEFAULT_ADDR)?
            .set_default("proc_root", DEFAULT_PROC_ROOT)?
            .set_default("rpc_timeout_seconds", 10)?
            .add_source(config::File::from(file_path.to_path_buf()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("processes"),
            )
            .build()?;
        let mut config: ExporterConfig = raw.try_deserialize()?;
        config.apply(overrides);
        config.normalise();
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, overrides: Overrides) {
        if let Some(url) = overrides.url {
            self.url = url;
        }
        if let Some(addr) = overrides.addr {
            self.addr = addr;
        }
        if let Some(processes) = overrides.processes {
            self.processes = processes.split(',').map(str::to_string).collect();
        }
        if overrides.eth {
            self.node = NodeKind::Eth;
        } else if overrides.evm {
            self.node = NodeKind::Evm;
        }
        if let Some(strategy) = overrides.match_strategy {
            self.match_strategy = strategy;
        }
        if let Some(table) = overrides.process_table {
            self.process_table = table;
        }
        if let Some(ticks) = overrides.clock_ticks {
            self.clock_ticks = Some(ticks);
        }
        if let Some(root) = overrides.proc_root {
            self.proc_root = root;
        }
    }

    /// Trim process names, drop empty ones and repeats of earlier ones.
    fn normalise(&mut self) {
        let mut seen = HashSet::new();
        self.processes = self
            .processes
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty() && seen.insert(name.clone()))
            .collect();
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if self.clock_ticks == Some(0) {
            return Err(eyre!("clock_ticks must be greater than zero"));
        }
        if self.process_table == ProcessTableKind::Sysinfo
            && self.proc_root != Path::new(DEFAULT_PROC_ROOT)
        {
            return Err(eyre!(
                "proc_root {:?} needs process_table = \"procfs\"; sysinfo always lists the host's processes",
                self.proc_root
            ));
        }
        if self.rpc_timeout_seconds == 0 {
            return Err(eyre!("rpc_timeout_seconds must be greater than zero"));
        }
        for name in &self.processes {
            if name.contains(',') {
                return Err(eyre!("Process name {:?} contains a comma", name));
            }
            NameMatcher::new(self.match_strategy, name)
                .map_err(|e| eyre!("Bad process pattern {:?}: {}", name, e))?;
        }
        Ok(())
    }

    /// The listen address; `:port` listens on all interfaces.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let addr = match self.addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => self.addr.clone(),
        };
        addr.parse()
            .map_err(|e| eyre!("Bad listen address {:?}: {}", self.addr, e))
    }

    pub fn clock_ticks(&self) -> ClockTicks {
        self.clock_ticks
            .and_then(ClockTicks::new)
            .unwrap_or_else(ClockTicks::platform)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_seconds)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn load_str(contents: &str, overrides: Overrides) -> Result<ExporterConfig> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exporter.toml");
        fs::write(&path, contents).unwrap();
        ExporterConfig::load(&path, overrides)
    }

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExporterConfig::load(&dir.path().join("absent.toml"), Overrides::default()).unwrap();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert!(config.processes.is_empty());
        assert_eq!(config.node, NodeKind::None);
        assert_eq!(config.match_strategy, MatchStrategy::Substring);
        assert_eq!(config.process_table, ProcessTableKind::Sysinfo);
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(10));
        assert_eq!(config.listen_addr().unwrap(), "0.0.0.0:9368".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn file_values() {
        let config = load_str(
            r#"
url = "http://node:8545"
addr = "127.0.0.1:9000"
processes = ["geth", " lighthouse "]
node = "evm"
match = "exact"
process_table = "procfs"
clock_ticks = 250
"#,
            Overrides::default(),
        )
        .unwrap();
        assert_eq!(config.url, "http://node:8545");
        assert_eq!(config.processes, vec!["geth", "lighthouse"]);
        assert_eq!(config.node, NodeKind::Evm);
        assert_eq!(config.match_strategy, MatchStrategy::Exact);
        assert_eq!(config.process_table, ProcessTableKind::Procfs);
        assert_eq!(config.clock_ticks().per_second(), 250);
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn flags_override_file() {
        let config = load_str(
            "processes = [\"geth\"]\nnode = \"evm\"\n",
            Overrides {
                processes: Some("sshd, prysm,,".to_string()),
                eth: true,
                evm: true,
                addr: Some(":9999".to_string()),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.processes, vec!["sshd", "prysm"]);
        assert_eq!(config.node, NodeKind::Eth);
        assert_eq!(config.listen_addr().unwrap().port(), 9999);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(load_str("clock_ticks = 0\n", Overrides::default()).is_err());
        assert!(load_str("addr = \"nowhere\"\n", Overrides::default()).is_err());
        assert!(load_str("match = \"regex\"\nprocesses = [\"(geth\"]\n", Overrides::default()).is_err());
        assert!(load_str("processes = [\"a,b\"]\n", Overrides::default()).is_err());
        assert!(load_str("match = \"glob\"\n", Overrides::default()).is_err());
    }

    #[test]
    fn repeated_names_are_kept_once() {
        let config = load_str(
            "processes = [\"geth\", \"prysm\"]\n",
            Overrides {
                processes: Some("geth, prysm,geth,lighthouse,prysm".to_string()),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.processes, vec!["geth", "prysm", "lighthouse"]);
    }

    #[test]
    fn custom_proc_root_needs_procfs_table() {
        let err = load_str("proc_root = \"/host/proc\"\n", Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("procfs"), "{err}");

        let config = load_str(
            "proc_root = \"/host/proc\"\nprocess_table = \"procfs\"\n",
            Overrides::default(),
        )
        .unwrap();
        assert_eq!(config.proc_root, PathBuf::from("/host/proc"));

        let err = load_str(
            "",
            Overrides {
                proc_root: Some(PathBuf::from("/host/proc")),
                ..Overrides::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("process_table"), "{err}");
    }

    #[test]
    fn toml_round_trip_of_effective_config() {
        let config = load_str("processes = [\"geth\"]\nclock_ticks = 100\n", Overrides::default()).unwrap();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("match = \"substring\""));
        let reparsed: ExporterConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed, config);
    }
}
