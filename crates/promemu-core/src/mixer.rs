use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::{EngineError, TransportError};
use crate::events::{EventBus, EventData};
use crate::hosts::{
    default_rng_factory, EmulatedHost, HostBatch, HostConfig, HostStatus, HostStatusSnapshot, RngFactory,
    UpdateCallback,
};
use crate::registry::JobRegistry;

const JOB_NAME_PREFIX: &str = "emulated_host_";

/// Configuration for [`Mixer`]. When `default_job_name` is left unset, each
/// mixer resolves its own fallback job name from the clock at construction
/// time, so two un-overridden mixers in the same process never collide on
/// the same generated job name.
pub struct MixerConfig {
    pub hosts: Vec<Arc<HostConfig>>,
    pub pushgateway_url: String,
    pub push_interval: f64,
    pub default_job_name: Option<String>,
    pub cleanup_on_start: bool,
    pub cleanup_on_finish: bool,
}

impl MixerConfig {
    pub fn builder(hosts: Vec<Arc<HostConfig>>) -> MixerConfigBuilder {
        MixerConfigBuilder::new(hosts)
    }
}

pub struct MixerConfigBuilder {
    config: MixerConfig,
}

impl MixerConfigBuilder {
    pub fn new(hosts: Vec<Arc<HostConfig>>) -> Self {
        Self {
            config: MixerConfig {
                hosts,
                pushgateway_url: "http://localhost:9091".to_string(),
                push_interval: 15.0,
                default_job_name: None,
                cleanup_on_start: true,
                cleanup_on_finish: true,
            },
        }
    }

    pub fn pushgateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.pushgateway_url = url.into();
        self
    }

    pub fn push_interval(mut self, seconds: f64) -> Self {
        self.config.push_interval = seconds;
        self
    }

    pub fn default_job_name(mut self, name: impl Into<String>) -> Self {
        self.config.default_job_name = Some(name.into());
        self
    }

    pub fn cleanup_on_start(mut self, enabled: bool) -> Self {
        self.config.cleanup_on_start = enabled;
        self
    }

    pub fn cleanup_on_finish(mut self, enabled: bool) -> Self {
        self.config.cleanup_on_finish = enabled;
        self
    }

    pub fn build(self) -> MixerConfig {
        self.config
    }
}

struct JobState {
    hosts: Vec<Arc<EmulatedHost>>,
    registry: Option<JobRegistry>,
}

struct MixerInner {
    pushgateway_url: String,
    push_interval: f64,
    cleanup_on_start: bool,
    cleanup_on_finish: bool,
    bus: EventBus,
    clock: Clock,
    http: Client,
    /// host name -> job name, resolved once at construction (host names are
    /// unique across the whole mixer per the data model).
    host_job: HashMap<String, String>,
    jobs: Mutex<HashMap<String, JobState>>,
    running: AtomicBool,
    mixer_start_time: AtomicU64,
    /// `max(host.start_time + host.ttl)` across every configured host.
    ttl: f64,
    push_task: Mutex<Option<JoinHandle<()>>>,
}

/// Groups hosts by job, maintains a label-indexed registry per job, and
/// pushes to a Pushgateway on a cadence. Cheaply `Clone`, like [`EventBus`]:
/// every clone shares the same underlying state.
#[derive(Clone)]
pub struct Mixer {
    inner: Arc<MixerInner>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatus {
    pub hosts_count: usize,
    pub metrics_count: usize,
    pub host_names: Vec<String>,
    pub hosts: Vec<HostStatusSnapshot>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MixerStatus {
    pub is_running: bool,
    pub pushgateway_url: String,
    pub push_interval: f64,
    pub total_jobs: usize,
    pub total_hosts: usize,
    pub active_hosts: usize,
    pub total_metrics: usize,
    pub jobs: HashMap<String, JobStatus>,
}

impl Mixer {
    pub async fn new(config: MixerConfig, bus: EventBus, clock: Clock) -> Result<Mixer, EngineError> {
        Self::with_rng_factory(config, bus, clock, default_rng_factory()).await
    }

    /// Builds a mixer with hosts driven by `rng_factory`, so tests can make
    /// the synthesized labels and inter-tick sleeps deterministic.
    pub async fn with_rng_factory(
        config: MixerConfig,
        bus: EventBus,
        clock: Clock,
        rng_factory: RngFactory,
    ) -> Result<Mixer, EngineError> {
        if config.hosts.is_empty() {
            return Err(EngineError::EmptyHostList);
        }

        let default_job_name = config
            .default_job_name
            .clone()
            .unwrap_or_else(|| format!("{JOB_NAME_PREFIX}{}", clock.now()));

        let mut host_job = HashMap::new();
        let mut seen_names = HashSet::new();
        for host in &config.hosts {
            let job = host.job_name.clone().unwrap_or_else(|| default_job_name.clone());
            if !seen_names.insert(host.name.clone()) {
                return Err(EngineError::DuplicateHostInJob {
                    job,
                    host: host.name.clone(),
                });
            }
            host_job.insert(host.name.clone(), job);

            let mut seen_metric_names = HashSet::new();
            for metric in &host.metrics {
                if !seen_metric_names.insert(metric.name.clone()) {
                    return Err(EngineError::InvalidHostConfig {
                        name: host.name.clone(),
                        reason: format!("duplicate metric name '{}'", metric.name),
                    });
                }
            }
        }

        let ttl = config
            .hosts
            .iter()
            .map(|h| h.start_time + h.ttl.unwrap_or(f64::INFINITY))
            .fold(f64::NEG_INFINITY, f64::max);

        let inner = Arc::new(MixerInner {
            pushgateway_url: config.pushgateway_url.clone(),
            push_interval: config.push_interval,
            cleanup_on_start: config.cleanup_on_start,
            cleanup_on_finish: config.cleanup_on_finish,
            bus: bus.clone(),
            clock: clock.clone(),
            http: Client::new(),
            host_job,
            jobs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            mixer_start_time: AtomicU64::new(0),
            ttl,
            push_task: Mutex::new(None),
        });
        let mixer = Mixer { inner };

        let callback: UpdateCallback = {
            let mixer = mixer.clone();
            Arc::new(move |batch: HostBatch| {
                let mixer = mixer.clone();
                Box::pin(async move {
                    mixer.update_metrics_by_host(batch).await;
                })
            })
        };

        let mut jobs: HashMap<String, JobState> = HashMap::new();
        for host_config in &config.hosts {
            let job = mixer.inner.host_job[&host_config.name].clone();
            let host = Arc::new(
                EmulatedHost::new(
                    host_config.clone(),
                    clock.clone(),
                    bus.clone(),
                    callback.clone(),
                    rng_factory.clone(),
                )
                .await,
            );
            jobs.entry(job)
                .or_insert_with(|| JobState {
                    hosts: Vec::new(),
                    registry: None,
                })
                .hosts
                .push(host);
        }

        for (job, state) in &jobs {
            info!(job, hosts = state.hosts.len(), "job configured");
        }

        *mixer.inner.jobs.lock().await = jobs;
        Ok(mixer)
    }

    async fn all_hosts(&self) -> Vec<Arc<EmulatedHost>> {
        self.inner
            .jobs
            .lock()
            .await
            .values()
            .flat_map(|state| state.hosts.iter().cloned())
            .collect()
    }

    async fn ensure_job_registry(&self, job: &str) -> Result<(), TransportError> {
        let mut jobs = self.inner.jobs.lock().await;
        let Some(state) = jobs.get_mut(job) else {
            return Ok(());
        };
        if state.registry.is_none() {
            state.registry = Some(JobRegistry::build(job, &state.hosts)?);
        }
        Ok(())
    }

    /// The mixer's `update_callback`: resolves the host's job, applies its
    /// batch to that job's registry, and warns on duplicate label sets
    /// (last writer wins regardless, per the data model's invariant).
    async fn update_metrics_by_host(&self, batch: HostBatch) {
        let Some(job) = self.inner.host_job.get(&batch.host_name).cloned() else {
            warn!(host = %batch.host_name, "host not found in mixer configuration");
            return;
        };

        if let Err(err) = self.ensure_job_registry(&job).await {
            error!(job, %err, "failed to build job registry");
            return;
        }

        let now = self.inner.clock.now();
        let mut jobs = self.inner.jobs.lock().await;
        let Some(state) = jobs.get_mut(&job) else {
            return;
        };
        let Some(registry) = state.registry.as_mut() else {
            return;
        };

        for (name, value) in &batch.metrics {
            let duplicate = registry.apply(&batch.host_name, &batch.labels, name, *value, now);
            if duplicate {
                warn!(
                    job,
                    metric = name,
                    host = %batch.host_name,
                    "duplicate metric with identical labels in job; overwriting"
                );
            }
        }
    }

    async fn push_job(&self, job: &str) -> Result<(), TransportError> {
        let (body, content_type, hosts_count, metrics_count) = {
            let mut jobs = self.inner.jobs.lock().await;
            let Some(state) = jobs.get_mut(job) else {
                return Ok(());
            };
            if state.registry.is_none() {
                state.registry = Some(JobRegistry::build(job, &state.hosts)?);
            }
            let registry = state.registry.as_ref().expect("just built above");
            let (body, content_type) = registry.encode()?;
            (body, content_type, state.hosts.len(), registry.metrics_count())
        };

        let url = format!(
            "{}/metrics/job/{}",
            self.inner.pushgateway_url.trim_end_matches('/'),
            utf8_percent_encode(job, NON_ALPHANUMERIC)
        );

        let response = self
            .inner
            .http
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|source| TransportError::Push {
                job: job.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus {
                endpoint: url,
                status: response.status().as_u16(),
            });
        }

        self.inner
            .bus
            .emit(
                "metrics_pushed",
                EventData::MetricsPushed {
                    job: job.to_string(),
                    hosts: hosts_count,
                    metrics_count,
                },
                "mixer",
            )
            .await;
        info!(job, hosts_count, metrics_count, "pushed metrics");
        Ok(())
    }

    /// Pushes every job's registry once. Errors never stop the loop; each
    /// job is attempted independently and failures are logged and skipped.
    async fn push_all_jobs(&self) {
        let job_names: Vec<String> = self.inner.jobs.lock().await.keys().cloned().collect();
        for job in job_names {
            if let Err(err) = self.push_job(&job).await {
                error!(job, %err, "failed to push metrics for job");
            }
        }
    }

    async fn delete_job(&self, job: &str) {
        let url = format!(
            "{}/metrics/job/{}",
            self.inner.pushgateway_url.trim_end_matches('/'),
            utf8_percent_encode(job, NON_ALPHANUMERIC)
        );
        match self.inner.http.delete(&url).send().await {
            Ok(resp) if resp.status() == StatusCode::OK || resp.status() == StatusCode::ACCEPTED => {
                info!(job, "deleted pushgateway job");
            }
            Ok(resp) => warn!(job, status = %resp.status(), "unexpected status deleting pushgateway job"),
            Err(source) => {
                let err = TransportError::Delete {
                    job: job.to_string(),
                    source,
                };
                warn!(%err, "failed to delete pushgateway job");
            }
        }
    }

    /// Discovers every job currently known to the gateway and deletes all
    /// of them — including jobs this mixer never created. Destructive;
    /// preserved as-is per the documented open question.
    pub async fn cleanup_all_jobs(&self) {
        let url = format!("{}/api/v1/metrics", self.inner.pushgateway_url.trim_end_matches('/'));
        let response = match self.inner.http.get(&url).send().await {
            Ok(r) => r,
            Err(source) => {
                warn!(err = %TransportError::List(source), "failed to list pushgateway metrics");
                return;
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "pushgateway metrics listing returned non-success status");
            return;
        }

        let parsed: MetricsListResponse = match response.json().await {
            Ok(p) => p,
            Err(source) => {
                warn!(err = %TransportError::List(source), "failed to parse pushgateway metrics listing");
                return;
            }
        };
        if parsed.status != "success" {
            warn!(status = %parsed.status, "pushgateway returned non-success status for metrics listing");
            return;
        }

        let mut jobs = HashSet::new();
        for entry in parsed.data {
            if let Some(job) = entry.labels.get("job") {
                jobs.insert(job.clone());
            }
        }

        info!(count = jobs.len(), "cleaning up discovered pushgateway jobs");
        for job in jobs {
            self.delete_job(&job).await;
        }
    }

    /// Deletes only the jobs this mixer owns.
    pub async fn cleanup_mixer_jobs(&self) {
        let job_names: Vec<String> = self.inner.jobs.lock().await.keys().cloned().collect();
        for job in job_names {
            self.delete_job(&job).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.load(SeqCst)
    }

    /// Starts every host, builds each job's registry, and spawns the push
    /// loop. A no-op if already running.
    pub async fn start(&self) {
        if self.inner.running.swap(true, SeqCst) {
            warn!("mixer is already running");
            return;
        }
        self.inner.mixer_start_time.store(self.inner.clock.now(), SeqCst);
        info!("starting mixer");

        if self.inner.cleanup_on_start {
            self.cleanup_all_jobs().await;
        }

        let hosts = self.all_hosts().await;
        let mut handles = Vec::with_capacity(hosts.len());
        for host in hosts {
            handles.push(tokio::spawn(async move { host.start().await }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let job_names: Vec<String> = self.inner.jobs.lock().await.keys().cloned().collect();
        for job in job_names {
            if let Err(err) = self.ensure_job_registry(&job).await {
                error!(job, %err, "failed to build job registry at start");
            }
        }

        let loop_mixer = self.clone();
        let handle = tokio::spawn(async move { loop_mixer.run_push_loop().await });
        *self.inner.push_task.lock().await = Some(handle);

        info!(jobs = self.inner.jobs.lock().await.len(), "mixer started");
    }

    async fn run_push_loop(&self) {
        while self.inner.running.load(SeqCst) {
            self.push_all_jobs().await;
            tokio::time::sleep(Duration::from_secs_f64(self.inner.push_interval.max(0.0))).await;
        }
    }

    /// Idempotent: stops every host, cancels the push loop, and cleans up
    /// this mixer's own jobs if configured to.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, SeqCst) {
            return;
        }
        info!("stopping mixer");

        let hosts = self.all_hosts().await;
        let mut handles = Vec::with_capacity(hosts.len());
        for host in hosts {
            handles.push(tokio::spawn(async move { host.stop().await }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(handle) = self.inner.push_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        if self.inner.cleanup_on_finish {
            self.cleanup_mixer_jobs().await;
        }
        info!("mixer stopped");
    }

    /// Starts the mixer and blocks until every host has stopped (TTL
    /// expiry or external cancellation), then stops the mixer.
    pub async fn run_until_complete(&self) {
        self.start().await;

        loop {
            let hosts = self.all_hosts().await;
            let mut any_active = false;
            for host in &hosts {
                if host.is_running().await || host.is_pending().await {
                    any_active = true;
                    break;
                }
            }
            if !any_active {
                break;
            }

            let elapsed =
                (self.inner.clock.now().saturating_sub(self.inner.mixer_start_time.load(SeqCst))) as f64;
            if elapsed >= self.inner.ttl {
                info!("mixer ttl expired, stopping");
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.stop().await;
    }

    pub async fn status(&self) -> MixerStatus {
        let jobs = self.inner.jobs.lock().await;
        let mut job_status = HashMap::new();
        let mut total_hosts = 0;
        let mut active_hosts = 0;
        let mut total_metrics = 0;

        for (job, state) in jobs.iter() {
            let metrics_count = state.registry.as_ref().map(JobRegistry::metrics_count).unwrap_or(0);
            total_hosts += state.hosts.len();
            total_metrics += metrics_count;

            let mut host_names = Vec::with_capacity(state.hosts.len());
            let mut hosts = Vec::with_capacity(state.hosts.len());
            for host in &state.hosts {
                host_names.push(host.config().name.clone());
                let snapshot = host.status().await;
                if snapshot.run_state == HostStatus::Running {
                    active_hosts += 1;
                }
                hosts.push(snapshot);
            }

            job_status.insert(
                job.clone(),
                JobStatus {
                    hosts_count: state.hosts.len(),
                    metrics_count,
                    host_names,
                    hosts,
                },
            );
        }

        MixerStatus {
            is_running: self.inner.running.load(SeqCst),
            pushgateway_url: self.inner.pushgateway_url.clone(),
            push_interval: self.inner.push_interval,
            total_jobs: jobs.len(),
            total_hosts,
            active_hosts,
            total_metrics,
            jobs: job_status,
        }
    }
}

#[derive(Deserialize)]
struct MetricsListResponse {
    status: String,
    #[serde(default)]
    data: Vec<MetricsListEntry>,
}

#[derive(Deserialize)]
struct MetricsListEntry {
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricConfig, MetricType};
    use crate::scenarios::ScenarioSpec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cpu_host(name: &str) -> Arc<HostConfig> {
        Arc::new(
            HostConfig::builder(name)
                .interval_range((0.01, 0.01))
                .hostname(format!("{name}.test"))
                .metric(
                    MetricConfig::builder("cpu", MetricType::Gauge)
                        .value_range((0.0, 100.0))
                        .update_interval(0.0)
                        .scenario(ScenarioSpec::RandomInRange {
                            value_range: Some((42.0, 42.0)),
                        })
                        .build(),
                )
                .build(),
        )
    }

    #[tokio::test]
    async fn duplicate_host_names_are_rejected() {
        let config = MixerConfig::builder(vec![cpu_host("same"), cpu_host("same")]).build();
        let err = Mixer::new(config, EventBus::new(), Clock::new_mock(0)).await;
        assert!(matches!(err, Err(EngineError::DuplicateHostInJob { .. })));
    }

    #[tokio::test]
    async fn empty_host_list_is_rejected() {
        let config = MixerConfig::builder(Vec::new()).build();
        let err = Mixer::new(config, EventBus::new(), Clock::new_mock(0)).await;
        assert!(matches!(err, Err(EngineError::EmptyHostList)));
    }

    /// Two hosts in one job: one push cycle produces one POST containing
    /// both hosts' `cpu` samples, and the status snapshot reflects both.
    #[tokio::test]
    async fn push_cycle_posts_once_with_both_hosts_merged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": [],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = MixerConfig::builder(vec![cpu_host("host-a"), cpu_host("host-b")])
            .pushgateway_url(server.uri())
            .push_interval(3600.0)
            .cleanup_on_start(true)
            .cleanup_on_finish(false)
            .build();

        let mixer = Mixer::new(config, EventBus::new(), Clock::new_mock(0)).await.unwrap();
        mixer.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = mixer.status().await;
        assert_eq!(status.total_hosts, 2);
        assert_eq!(status.active_hosts, 2);
        assert_eq!(status.total_metrics, 1);

        mixer.stop().await;

        let requests = server.received_requests().await.expect("mock server records requests");
        let posts: Vec<_> = requests.iter().filter(|r| r.method.as_str() == "POST").collect();
        assert!(!posts.is_empty(), "expected at least one push to the gateway");
        let body = String::from_utf8_lossy(&posts[0].body).into_owned();
        assert_eq!(body.matches("cpu{").count(), 2, "expected both hosts' cpu samples in one push");
    }
}
