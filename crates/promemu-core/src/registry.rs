use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry as PromRegistry, TextEncoder};

use crate::error::TransportError;
use crate::hosts::EmulatedHost;
use crate::metrics::MetricType;

/// The last value the mixer has seen for one metric from one host, kept for
/// duplicate-label detection and the status snapshot.
#[derive(Debug, Clone)]
pub struct ObservedValue {
    pub value: f64,
    pub labels: HashMap<String, String>,
    pub timestamp: u64,
}

enum Descriptor {
    Gauge(GaugeVec),
    Counter(CounterVec),
    Histogram(HistogramVec),
}

/// Per-job collection of typed Prometheus descriptors and the latest
/// observed value per metric/host, built once a job's hosts are known.
///
/// One descriptor per unique metric name across the job's hosts, labeled
/// with the union of all label keys any host in the job carries, since a
/// `GaugeVec`/`CounterVec`/`HistogramVec` needs its full label schema fixed
/// up front.
pub struct JobRegistry {
    job: String,
    registry: PromRegistry,
    label_names: Vec<String>,
    descriptors: HashMap<String, Descriptor>,
    observed: HashMap<String, HashMap<String, ObservedValue>>,
}

impl JobRegistry {
    pub fn build(job: &str, hosts: &[Arc<EmulatedHost>]) -> Result<Self, TransportError> {
        let registry = PromRegistry::new();

        let mut label_set: HashSet<String> = HashSet::new();
        for host in hosts {
            label_set.extend(host.labels().keys().cloned());
        }
        let mut label_names: Vec<String> = label_set.into_iter().collect();
        label_names.sort();
        let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();

        // First config wins per metric name if two hosts disagree on type or
        // description.
        let mut seen = HashSet::new();
        let mut descriptors = HashMap::new();
        let mut observed = HashMap::new();

        for host in hosts {
            for metric in &host.config().metrics {
                if !seen.insert(metric.name.clone()) {
                    continue;
                }
                let help = metric
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("{} metric", metric.name));
                let to_err = |source: prometheus::Error| TransportError::Registry {
                    job: job.to_string(),
                    source,
                };
                let descriptor = match metric.metric_type {
                    MetricType::Gauge => {
                        let gauge = GaugeVec::new(Opts::new(&metric.name, &help), &label_refs)
                            .map_err(to_err)?;
                        registry.register(Box::new(gauge.clone())).map_err(to_err)?;
                        Descriptor::Gauge(gauge)
                    }
                    MetricType::Counter => {
                        let counter = CounterVec::new(Opts::new(&metric.name, &help), &label_refs)
                            .map_err(to_err)?;
                        registry.register(Box::new(counter.clone())).map_err(to_err)?;
                        Descriptor::Counter(counter)
                    }
                    MetricType::Histogram => {
                        let histogram =
                            HistogramVec::new(HistogramOpts::new(&metric.name, &help), &label_refs)
                                .map_err(to_err)?;
                        registry.register(Box::new(histogram.clone())).map_err(to_err)?;
                        Descriptor::Histogram(histogram)
                    }
                };
                descriptors.insert(metric.name.clone(), descriptor);
                observed.insert(metric.name.clone(), HashMap::new());
            }
        }

        Ok(Self {
            job: job.to_string(),
            registry,
            label_names,
            descriptors,
            observed,
        })
    }

    pub fn metrics_count(&self) -> usize {
        self.descriptors.len()
    }

    fn label_values<'a>(&self, labels: &'a HashMap<String, String>) -> Vec<&'a str> {
        static EMPTY: &str = "";
        self.label_names
            .iter()
            .map(|name| labels.get(name).map(String::as_str).unwrap_or(EMPTY))
            .collect()
    }

    /// Applies one `(metric_name, value)` observation from `host_name`.
    /// Returns `true` if this observation duplicates another host's
    /// identically-labeled entry for the same metric (logged by the
    /// caller, last writer wins regardless).
    pub fn apply(
        &mut self,
        host_name: &str,
        labels: &HashMap<String, String>,
        name: &str,
        value: f64,
        timestamp: u64,
    ) -> bool {
        let Some(descriptor) = self.descriptors.get(name) else {
            return false;
        };

        let values = self.label_values(labels);
        match descriptor {
            Descriptor::Gauge(gauge) => gauge.with_label_values(&values).set(value),
            Descriptor::Counter(counter) => {
                let current = counter.with_label_values(&values).get();
                let delta = value - current;
                if delta >= 0.0 {
                    counter.with_label_values(&values).inc_by(delta);
                } else {
                    // Real Counters cannot decrease; reset and republish the
                    // new total as-is, per the documented open question on
                    // negative scenario deltas.
                    counter.with_label_values(&values).reset();
                    counter.with_label_values(&values).inc_by(value.max(0.0));
                }
            }
            Descriptor::Histogram(histogram) => histogram.with_label_values(&values).observe(value),
        }

        let per_host = self.observed.entry(name.to_string()).or_default();
        let duplicate = per_host
            .iter()
            .any(|(other_host, other)| other_host != host_name && other.labels == *labels);

        per_host.insert(
            host_name.to_string(),
            ObservedValue {
                value,
                labels: labels.clone(),
                timestamp,
            },
        );

        duplicate
    }

    pub fn observed(&self) -> &HashMap<String, HashMap<String, ObservedValue>> {
        &self.observed
    }

    /// Serializes this job's registry to Prometheus text exposition format,
    /// returning the body and the content-type header to send it with.
    pub fn encode(&self) -> Result<(String, &'static str), TransportError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|source| TransportError::Registry {
                job: self.job.clone(),
                source,
            })?;
        let body = String::from_utf8_lossy(&buffer).into_owned();
        Ok((body, encoder.format_type()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::events::EventBus;
    use crate::hosts::{default_rng_factory, EmulatedHost, HostConfig, UpdateCallback};
    use crate::metrics::MetricConfig;
    use crate::scenarios::ScenarioSpec;
    use std::sync::Arc;

    async fn host_with_metric(name: &str, metric_name: &str, metric_type: MetricType) -> Arc<EmulatedHost> {
        let config = Arc::new(
            HostConfig::builder(name)
                .label("environment", "stage")
                .metric(
                    MetricConfig::builder(metric_name, metric_type)
                        .value_range((0.0, 100.0))
                        .scenario(ScenarioSpec::DoNothing)
                        .build(),
                )
                .build(),
        );
        let bus = EventBus::new();
        let callback: UpdateCallback = Arc::new(|_batch| Box::pin(async {}));
        Arc::new(
            EmulatedHost::new(config, Clock::new_mock(0), bus, callback, default_rng_factory()).await,
        )
    }

    #[tokio::test]
    async fn duplicate_identical_labels_are_detected_and_overwrite() {
        let host_a = host_with_metric("host-a", "cpu", MetricType::Gauge).await;
        let host_b = host_with_metric("host-b", "cpu", MetricType::Gauge).await;
        let mut registry = JobRegistry::build("job-a", &[host_a.clone(), host_b.clone()]).unwrap();

        let shared_labels: HashMap<String, String> =
            [("environment".to_string(), "stage".to_string())].into_iter().collect();

        let first_dup = registry.apply("host-a", &shared_labels, "cpu", 42.0, 1_000);
        assert!(!first_dup, "no prior entry yet");

        let second_dup = registry.apply("host-b", &shared_labels, "cpu", 43.0, 1_001);
        assert!(second_dup, "identical labels from another host must be flagged");

        assert_eq!(registry.observed()["cpu"]["host-b"].value, 43.0);
    }

    #[tokio::test]
    async fn counter_accumulates_monotonically_for_non_negative_deltas() {
        let host = host_with_metric("host-a", "requests_total", MetricType::Counter).await;
        let mut registry = JobRegistry::build("job-a", &[host.clone()]).unwrap();
        let labels = host.labels().clone();

        registry.apply("host-a", &labels, "requests_total", 10.0, 0);
        registry.apply("host-a", &labels, "requests_total", 25.0, 1);

        let (body, content_type) = registry.encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("requests_total"));
    }
}
