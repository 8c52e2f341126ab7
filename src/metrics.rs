//! Two-phase metric collection protocol.
//!
//! A [`Collector`] first describes the shapes of everything it can emit
//! ([`Desc`]), once, at registration. It is then asked to produce current
//! values on every scrape. Production never fails as a whole: a collector
//! that cannot compute one value pushes a [`Metric::Invalid`] marker in its
//! place and carries on.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use prometheus::Opts;

pub mod registry;

pub use registry::{GatherError, Gathered, Registry, RegistryError};

/// Static shape of a gauge: name, help text and label schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Desc {
    pub name: String,
    pub help: String,
    pub labels: Vec<String>,
}

impl Desc {
    pub fn gauge(name: &str, help: &str, labels: &[&str]) -> Arc<Desc> {
        Arc::new(Desc {
            name: name.to_string(),
            help: help.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        })
    }

    pub fn opts(&self) -> Opts {
        Opts::new(self.name.as_str(), self.help.as_str())
    }
}

/// One value for one label set.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub desc: Arc<Desc>,
    pub label_values: Vec<String>,
    pub value: f64,
}

impl Sample {
    /// Label name/value pairs in schema order.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.desc
            .labels
            .iter()
            .map(String::as_str)
            .zip(self.label_values.iter().map(String::as_str))
    }
}

/// What a collector emits: a value, or an error marker standing in for one.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    Sample(Sample),
    Invalid { desc: Arc<Desc>, error: String },
}

impl Metric {
    /// Build a gauge sample. A label count that does not match the
    /// descriptor yields an error marker instead of a sample.
    pub fn gauge(desc: &Arc<Desc>, value: f64, label_values: &[&str]) -> Metric {
        if label_values.len() != desc.labels.len() {
            return Metric::invalid(
                desc,
                format!(
                    "{} expects {} label values, got {}",
                    desc.name,
                    desc.labels.len(),
                    label_values.len()
                ),
            );
        }
        Metric::Sample(Sample {
            desc: Arc::clone(desc),
            label_values: label_values.iter().map(|v| v.to_string()).collect(),
            value,
        })
    }

    pub fn invalid(desc: &Arc<Desc>, error: impl fmt::Display) -> Metric {
        Metric::Invalid {
            desc: Arc::clone(desc),
            error: error.to_string(),
        }
    }

    pub fn desc(&self) -> &Arc<Desc> {
        match self {
            Metric::Sample(s) => &s.desc,
            Metric::Invalid { desc, .. } => desc,
        }
    }

    pub fn as_sample(&self) -> Option<&Sample> {
        match self {
            Metric::Sample(s) => Some(s),
            Metric::Invalid { .. } => None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Metric::Invalid { .. })
    }
}

/// A source of metrics scraped by the [`Registry`].
///
/// `describe` must be side-effect free and return the same shapes every
/// time. `collect` runs once per scrape and must not keep state between
/// runs; everything it emits goes into `out`.
#[async_trait]
pub trait Collector: Send + Sync {
    fn describe(&self) -> Vec<Arc<Desc>>;
    async fn collect(&self, out: &mut Vec<Metric>);
}
