//! Scrape orchestration on top of [`prometheus::Registry`].
//!
//! Every described shape becomes a [`GaugeVec`] registered with prometheus,
//! which validates names and rejects duplicates. A scrape runs the
//! collectors, replaces the contents of their gauges with what was just
//! produced and gathers. Error markers never reach the exposition; they are
//! handed back so the caller can log them.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use futures::future::join_all;
use log::*;
use prometheus::{Encoder, GaugeVec, TextEncoder, proto::MetricFamily};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::metrics::{Collector, Desc, Metric};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("collector describes no metrics")]
    NothingDescribed,

    #[error("metric {0} is already registered")]
    DuplicateDesc(String),

    #[error("cannot register metric {metric}: {source}")]
    Rejected {
        metric: String,
        #[source]
        source: prometheus::Error,
    },
}

/// Problems found while gathering. None of them abort a scrape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatherError {
    #[error("collected metric {metric}: {error}")]
    Collector { metric: String, error: String },

    #[error("collected metric {0} was not described by its collector")]
    Undescribed(String),

    #[error("collected metric {metric} {labels:?} was collected before with the same label values")]
    Duplicate { metric: String, labels: Vec<String> },

    #[error("collected metric {metric} was rejected: {error}")]
    Rejected { metric: String, error: String },
}

/// The result of one scrape.
#[derive(Debug, Default)]
pub struct Gathered {
    /// Families sorted by metric name, as gathered by prometheus.
    pub families: Vec<MetricFamily>,
    pub errors: Vec<GatherError>,
}

impl Gathered {
    /// Render the families in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Content type of [`Gathered::encode`] output.
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}

struct Registered {
    collector: Box<dyn Collector>,
    gauges: Vec<(Arc<Desc>, GaugeVec)>,
}

#[derive(Default)]
pub struct Registry {
    inner: prometheus::Registry,
    collectors: Vec<Registered>,
    descs: BTreeMap<String, Arc<Desc>>,
    scrape: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector, running its describe phase once.
    pub fn register(&mut self, collector: Box<dyn Collector>) -> Result<(), RegistryError> {
        let descs = collector.describe();
        if descs.is_empty() {
            return Err(RegistryError::NothingDescribed);
        }

        let mut gauges: Vec<(Arc<Desc>, GaugeVec)> = Vec::with_capacity(descs.len());
        for desc in descs {
            if self.descs.contains_key(&desc.name) || gauges.iter().any(|(d, _)| d.name == desc.name)
            {
                return Err(RegistryError::DuplicateDesc(desc.name.clone()));
            }
            let labels: Vec<&str> = desc.labels.iter().map(String::as_str).collect();
            let gauge = GaugeVec::new(desc.opts(), &labels).map_err(|source| {
                RegistryError::Rejected {
                    metric: desc.name.clone(),
                    source,
                }
            })?;
            gauges.push((desc, gauge));
        }

        for (i, (desc, gauge)) in gauges.iter().enumerate() {
            if let Err(source) = self.inner.register(Box::new(gauge.clone())) {
                for (_, registered) in &gauges[..i] {
                    let _ = self.inner.unregister(Box::new(registered.clone()));
                }
                return Err(RegistryError::Rejected {
                    metric: desc.name.clone(),
                    source,
                });
            }
        }
        for (desc, _) in &gauges {
            debug!(target: "Registry", "Registered {}", desc.name);
            self.descs.insert(desc.name.clone(), Arc::clone(desc));
        }
        self.collectors.push(Registered { collector, gauges });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Every registered metric shape, sorted by name.
    pub fn descs(&self) -> impl Iterator<Item = &Arc<Desc>> {
        self.descs.values()
    }

    /// Run the produce phase of every collector and gather what it set.
    ///
    /// Scrapes are serialised: gauges are cleared and refilled on each one,
    /// so a value that could not be produced this time is absent rather
    /// than stale.
    pub async fn gather(&self) -> Gathered {
        let _scrape = self.scrape.lock().await;

        let runs = self.collectors.iter().map(|entry| async move {
            let mut out = Vec::new();
            entry.collector.collect(&mut out).await;
            (entry, out)
        });
        let outputs = join_all(runs).await;

        let mut errors = Vec::new();
        for (entry, metrics) in outputs {
            for (_, gauge) in &entry.gauges {
                gauge.reset();
            }
            let mut seen: HashSet<(String, Vec<String>)> = HashSet::new();
            for metric in metrics {
                let sample = match metric {
                    Metric::Sample(sample) => sample,
                    Metric::Invalid { desc, error } => {
                        errors.push(GatherError::Collector {
                            metric: desc.name.clone(),
                            error,
                        });
                        continue;
                    }
                };
                let Some((_, gauge)) = entry.gauges.iter().find(|(d, _)| **d == *sample.desc) else {
                    errors.push(GatherError::Undescribed(sample.desc.name.clone()));
                    continue;
                };
                if !seen.insert((sample.desc.name.clone(), sample.label_values.clone())) {
                    errors.push(GatherError::Duplicate {
                        metric: sample.desc.name.clone(),
                        labels: sample.label_values,
                    });
                    continue;
                }
                let values: Vec<&str> = sample.label_values.iter().map(String::as_str).collect();
                match gauge.get_metric_with_label_values(&values) {
                    Ok(child) => child.set(sample.value),
                    Err(err) => errors.push(GatherError::Rejected {
                        metric: sample.desc.name.clone(),
                        error: err.to_string(),
                    }),
                }
            }
        }

        Gathered {
            families: self.inner.gather(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Fixed {
        descs: Vec<Arc<Desc>>,
        metrics: Vec<Metric>,
    }

    #[async_trait]
    impl Collector for Fixed {
        fn describe(&self) -> Vec<Arc<Desc>> {
            self.descs.clone()
        }

        async fn collect(&self, out: &mut Vec<Metric>) {
            out.extend(self.metrics.iter().cloned());
        }
    }

    fn fixed(desc: &Arc<Desc>, metrics: Vec<Metric>) -> Box<dyn Collector> {
        Box::new(Fixed {
            descs: vec![Arc::clone(desc)],
            metrics,
        })
    }

    fn values(family: &MetricFamily) -> Vec<f64> {
        family.get_metric().iter().map(|m| m.get_gauge().get_value()).collect()
    }

    #[test]
    fn register_rejects_empty_describe() {
        let mut registry = Registry::new();
        let err = registry
            .register(Box::new(Fixed {
                descs: vec![],
                metrics: vec![],
            }))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NothingDescribed));
        assert!(registry.is_empty());
    }

    #[test]
    fn register_rejects_duplicate_names_across_collectors() {
        let desc = Desc::gauge("eth_block_number", "Latest block", &[]);
        let mut registry = Registry::new();
        registry.register(fixed(&desc, vec![])).unwrap();
        let err = registry.register(fixed(&desc, vec![])).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateDesc(name) if name == "eth_block_number"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_rejects_bad_names() {
        let mut registry = Registry::new();
        let bad_metric = Desc::gauge("9lives", "Starts with a digit", &[]);
        assert!(matches!(
            registry.register(fixed(&bad_metric, vec![])).unwrap_err(),
            RegistryError::Rejected { metric, .. } if metric == "9lives"
        ));
        let bad_label = Desc::gauge("ok_metric", "Has a bad label", &["not-a-label"]);
        assert!(matches!(
            registry.register(fixed(&bad_label, vec![])).unwrap_err(),
            RegistryError::Rejected { .. }
        ));
        assert!(registry.is_empty());
        assert_eq!(registry.descs().count(), 0);
    }

    #[tokio::test]
    async fn gather_keeps_samples_next_to_errors() {
        let desc = Desc::gauge("process_start_time_seconds", "Start", &["process_name", "pid"]);
        let metrics = vec![
            Metric::gauge(&desc, 10.0, &["a", "1"]),
            Metric::invalid(&desc, "failed to get start time for PID 2"),
            Metric::gauge(&desc, 30.0, &["a", "3"]),
        ];
        let mut registry = Registry::new();
        registry.register(fixed(&desc, metrics)).unwrap();

        let gathered = registry.gather().await;
        assert_eq!(gathered.families.len(), 1);
        assert_eq!(values(&gathered.families[0]), vec![10.0, 30.0]);
        assert_eq!(
            gathered.errors,
            vec![GatherError::Collector {
                metric: "process_start_time_seconds".to_string(),
                error: "failed to get start time for PID 2".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn gather_drops_duplicates_and_undescribed() {
        let desc = Desc::gauge("net_peers", "Peers", &[]);
        let stranger = Desc::gauge("stranger", "Not described", &[]);
        let metrics = vec![
            Metric::gauge(&desc, 5.0, &[]),
            Metric::gauge(&desc, 6.0, &[]),
            Metric::gauge(&stranger, 1.0, &[]),
        ];
        let mut registry = Registry::new();
        registry.register(fixed(&desc, metrics)).unwrap();

        let gathered = registry.gather().await;
        assert_eq!(gathered.families.len(), 1);
        assert_eq!(values(&gathered.families[0]), vec![5.0]);
        assert_eq!(gathered.errors.len(), 2);
        assert!(matches!(gathered.errors[0], GatherError::Duplicate { .. }));
        assert_eq!(gathered.errors[1], GatherError::Undescribed("stranger".to_string()));
    }

    #[tokio::test]
    async fn gather_sorts_families_and_omits_empty_ones() {
        let b = Desc::gauge("b_metric", "Second", &[]);
        let a = Desc::gauge("a_metric", "First", &[]);
        let idle = Desc::gauge("idle_metric", "Never set", &[]);
        let mut registry = Registry::new();
        registry.register(fixed(&b, vec![Metric::gauge(&b, 2.0, &[])])).unwrap();
        registry.register(fixed(&a, vec![Metric::gauge(&a, 1.0, &[])])).unwrap();
        registry.register(fixed(&idle, vec![])).unwrap();

        let gathered = registry.gather().await;
        let names: Vec<&str> = gathered.families.iter().map(|f| f.get_name()).collect();
        assert_eq!(names, vec!["a_metric", "b_metric"]);
        assert!(gathered.errors.is_empty());
        assert_eq!(registry.descs().count(), 3);
    }

    #[tokio::test]
    async fn values_not_produced_again_disappear() {
        let desc = Desc::gauge("eth_block_number", "Latest block", &[]);
        let produced = Arc::new(std::sync::Mutex::new(vec![Metric::gauge(&desc, 7.0, &[])]));

        struct Shared(Arc<Desc>, Arc<std::sync::Mutex<Vec<Metric>>>);

        #[async_trait]
        impl Collector for Shared {
            fn describe(&self) -> Vec<Arc<Desc>> {
                vec![Arc::clone(&self.0)]
            }

            async fn collect(&self, out: &mut Vec<Metric>) {
                out.extend(self.1.lock().unwrap().iter().cloned());
            }
        }

        let mut registry = Registry::new();
        registry
            .register(Box::new(Shared(Arc::clone(&desc), Arc::clone(&produced))))
            .unwrap();
        assert_eq!(registry.gather().await.families.len(), 1);

        *produced.lock().unwrap() = vec![Metric::invalid(&desc, "connection refused")];
        let gathered = registry.gather().await;
        assert!(gathered.families.is_empty());
        assert_eq!(gathered.errors.len(), 1);
    }

    #[tokio::test]
    async fn encodes_text_exposition() {
        let desc = Desc::gauge("net_peers", "The number of peers", &[]);
        let mut registry = Registry::new();
        registry.register(fixed(&desc, vec![Metric::gauge(&desc, 25.0, &[])])).unwrap();

        let text = registry.gather().await.encode().unwrap();
        assert_eq!(
            text,
            "# HELP net_peers The number of peers\n# TYPE net_peers gauge\nnet_peers 25\n"
        );
        assert!(content_type().starts_with("text/plain; version=0.0.4"));
    }
}
