use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::events::{Event, EventBus, EventData, HandlerFn, SubscriptionId};
use crate::metrics::{EmulatedMetric, LinkedMetricView, MetricConfig, MetricType};
use crate::scenarios::{RandomSource, RngSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum HostStatus {
    Pending,
    Running,
    Stopped,
}

/// Point-in-time view of one host's identity, lifecycle, and timing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HostStatusSnapshot {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub run_state: HostStatus,
    pub start_delay: f64,
    pub uptime: u64,
    pub ttl_remaining: Option<f64>,
    pub metrics_count: usize,
}

/// Static description of one emulated host, built once by a `HostPopulation`.
pub struct HostConfig {
    pub name: String,
    pub hostname: Option<String>,
    pub ttl: Option<f64>,
    pub interval_range: (f64, f64),
    pub start_time: f64,
    pub job_name: Option<String>,
    pub labels: HashMap<String, String>,
    pub metrics: Vec<Arc<MetricConfig>>,
    pub listen_events: HashMap<String, HandlerFn>,
}

impl HostConfig {
    pub fn builder(name: impl Into<String>) -> HostConfigBuilder {
        HostConfigBuilder::new(name)
    }
}

pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: HostConfig {
                name: name.into(),
                hostname: None,
                ttl: None,
                interval_range: (10.0, 20.0),
                start_time: 0.0,
                job_name: None,
                labels: HashMap::new(),
                metrics: Vec::new(),
                listen_events: HashMap::new(),
            },
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = Some(hostname.into());
        self
    }

    pub fn ttl(mut self, seconds: f64) -> Self {
        self.config.ttl = Some(seconds);
        self
    }

    pub fn interval_range(mut self, range: (f64, f64)) -> Self {
        self.config.interval_range = range;
        self
    }

    pub fn start_time(mut self, seconds: f64) -> Self {
        self.config.start_time = seconds;
        self
    }

    pub fn job_name(mut self, job_name: impl Into<String>) -> Self {
        self.config.job_name = Some(job_name.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.labels.insert(key.into(), value.into());
        self
    }

    pub fn metric(mut self, metric: MetricConfig) -> Self {
        self.config.metrics.push(Arc::new(metric));
        self
    }

    pub fn listen_event(mut self, name: impl Into<String>, handler: HandlerFn) -> Self {
        self.config.listen_events.insert(name.into(), handler);
        self
    }

    pub fn build(self) -> HostConfig {
        self.config
    }
}

const SERVICES: &[&str] = &["stress", "worker", "proxy"];
const CLUSTERS: &[&str] = &["lgs01", "lgs02", "lgs03", "lgs04", "lgs05"];

fn pick<'a, T>(rng: &mut dyn RandomSource, items: &'a [T]) -> &'a T {
    let idx = (rng.uniform(0.0, items.len() as f64) as usize).min(items.len() - 1);
    &items[idx]
}

/// Synthesizes a hostname like `worker042.lgs03.app.stage` when a host
/// population doesn't supply an explicit one.
pub fn synthesize_hostname(rng: &mut dyn RandomSource) -> String {
    let service = pick(rng, SERVICES);
    let number = (rng.uniform(1.0, 300.0) as u32).clamp(1, 299);
    let cluster = pick(rng, CLUSTERS);
    format!("{service}{number:02}.{cluster}.app.stage")
}

/// Synthesizes a private-range address like `192.168.14.201`.
pub fn synthesize_address(rng: &mut dyn RandomSource) -> String {
    let third = rng.uniform(1.0, 30.0) as u32;
    let fourth = rng.uniform(10.0, 254.0) as u32;
    format!("192.168.{third}.{fourth}")
}

/// One tick's worth of published metrics, delivered to whatever consumes a
/// host's output (the mixer, in production).
pub struct HostBatch {
    pub host_name: String,
    pub labels: HashMap<String, String>,
    pub metrics: Vec<(String, f64)>,
}

pub type UpdateCallback =
    Arc<dyn Fn(HostBatch) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Produces the randomness source a host's run loop uses for its
/// inter-tick sleep and its metrics' scenarios. Defaults to a real RNG;
/// tests substitute a deterministic one.
pub type RngFactory = Arc<dyn Fn() -> Box<dyn RandomSource> + Send + Sync>;

pub fn default_rng_factory() -> RngFactory {
    Arc::new(|| Box::new(RngSource(rand::rngs::StdRng::from_entropy())))
}

struct HostState {
    metrics: Vec<EmulatedMetric>,
    status: HostStatus,
    host_start_time: u64,
}

#[derive(Clone)]
struct HostLoopContext {
    config: Arc<HostConfig>,
    labels: HashMap<String, String>,
    clock: Clock,
    bus: EventBus,
    update_callback: UpdateCallback,
    state: Arc<Mutex<HostState>>,
    /// Cancelled by `stop()` so the run loop wakes immediately out of its
    /// inter-tick sleep instead of waiting for it to elapse naturally.
    cancel: CancellationToken,
}

/// Runs one `HostConfig`'s metrics on their own schedule, publishing
/// batches through `update_callback` and announcing lifecycle transitions
/// over the event bus.
pub struct EmulatedHost {
    ctx: HostLoopContext,
    rng_factory: RngFactory,
    task: Mutex<Option<JoinHandle<()>>>,
    listener_ids: Mutex<Vec<(String, SubscriptionId)>>,
}

impl EmulatedHost {
    pub async fn new(
        config: Arc<HostConfig>,
        clock: Clock,
        bus: EventBus,
        update_callback: UpdateCallback,
        rng_factory: RngFactory,
    ) -> Self {
        Self::with_labels(
            config,
            clock,
            bus,
            update_callback,
            rng_factory,
            &mut *default_rng_factory()(),
        )
        .await
    }

    /// Builds a host with its label synthesis driven by `rng`, so tests can
    /// assert on exact synthesized hostnames/addresses.
    pub async fn with_labels(
        config: Arc<HostConfig>,
        clock: Clock,
        bus: EventBus,
        update_callback: UpdateCallback,
        rng_factory: RngFactory,
        rng: &mut dyn RandomSource,
    ) -> Self {
        let mut labels = config.labels.clone();
        labels.insert("name".to_string(), config.name.clone());
        labels
            .entry("host".to_string())
            .or_insert_with(|| config.hostname.clone().unwrap_or_else(|| synthesize_hostname(rng)));
        labels
            .entry("address".to_string())
            .or_insert_with(|| synthesize_address(rng));

        let metrics = config
            .metrics
            .iter()
            .map(|m| EmulatedMetric::new(m.clone(), clock.clone()))
            .collect();

        let state = Arc::new(Mutex::new(HostState {
            metrics,
            status: HostStatus::Pending,
            host_start_time: clock.now(),
        }));

        let ctx = HostLoopContext {
            config: config.clone(),
            labels,
            clock,
            bus: bus.clone(),
            update_callback,
            state,
            cancel: CancellationToken::new(),
        };

        let mut listener_ids = Vec::new();
        for (name, handler) in config.listen_events.iter() {
            let handler = handler.clone();
            let handler_bus = bus.clone();
            let id = bus
                .subscribe(name.clone(), move |event| handler(event, handler_bus.clone()))
                .await;
            listener_ids.push((name.clone(), id));
        }

        // Metrics naming events in their own `listen_events` get updated
        // out-of-schedule, as soon as that event fires, bypassing the
        // start/ttl/interval gates (see `EmulatedMetric::update`).
        for metric_config in &config.metrics {
            for event_name in &metric_config.listen_events {
                let metric_name = metric_config.name.clone();
                let event_ctx = ctx.clone();
                let event_rng_factory = rng_factory.clone();
                let id = bus
                    .subscribe(event_name.clone(), move |event| {
                        let ctx = event_ctx.clone();
                        let metric_name = metric_name.clone();
                        let rng = (event_rng_factory)();
                        async move { handle_metric_event(ctx, metric_name, event, rng).await }
                    })
                    .await;
                listener_ids.push((event_name.clone(), id));
            }
        }

        Self {
            ctx,
            rng_factory,
            task: Mutex::new(None),
            listener_ids: Mutex::new(listener_ids),
        }
    }

    pub fn config(&self) -> &Arc<HostConfig> {
        &self.ctx.config
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.ctx.labels
    }

    async fn run_state(&self) -> HostStatus {
        self.ctx.state.lock().await.status
    }

    /// Snapshot of this host's lifecycle and timing, per §4.5: name, labels,
    /// run state, configured start delay, uptime since it actually started,
    /// remaining TTL (if any), and how many metrics it carries.
    pub async fn status(&self) -> HostStatusSnapshot {
        let state = self.ctx.state.lock().await;
        let now = self.ctx.clock.now();
        let uptime = match state.status {
            HostStatus::Running | HostStatus::Stopped => now.saturating_sub(state.host_start_time),
            HostStatus::Pending => 0,
        };
        let ttl_remaining = self.ctx.config.ttl.map(|ttl| (ttl - uptime as f64).max(0.0));

        HostStatusSnapshot {
            name: self.ctx.config.name.clone(),
            labels: self.ctx.labels.clone(),
            run_state: state.status,
            start_delay: self.ctx.config.start_time,
            uptime,
            ttl_remaining,
            metrics_count: state.metrics.len(),
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.run_state().await, HostStatus::Running)
    }

    pub async fn is_pending(&self) -> bool {
        matches!(self.run_state().await, HostStatus::Pending)
    }

    /// Moves the host to `Running`, emits `host_started`, and spawns its
    /// run loop. A no-op if already running.
    pub async fn start(&self) {
        {
            let mut state = self.ctx.state.lock().await;
            if state.status == HostStatus::Running {
                return;
            }
            state.status = HostStatus::Running;
        }

        if self.ctx.config.start_time > 0.0 {
            info!(
                host = %self.ctx.config.name,
                delay = self.ctx.config.start_time,
                "waiting before starting host"
            );
            tokio::time::sleep(Duration::from_secs_f64(self.ctx.config.start_time)).await;
        }
        self.ctx.state.lock().await.host_start_time = self.ctx.clock.now();

        let rng = (self.rng_factory)();
        let loop_ctx = self.ctx.clone();
        let handle = tokio::spawn(run_loop(loop_ctx, rng));
        *self.task.lock().await = Some(handle);

        self.ctx
            .bus
            .emit("host_started", EventData::Labels(self.ctx.labels.clone()), self.ctx.config.name.clone())
            .await;

        info!(host = %self.ctx.config.name, "host started");
    }

    /// Signals the run loop to stop at its next suspension point, waits for
    /// it to exit, clears per-metric scratch state, unsubscribes this
    /// host's event listeners, and emits `host_stopped`.
    pub async fn stop(&self) {
        self.ctx.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }

        {
            let state = self.ctx.state.lock().await;
            for metric in &state.metrics {
                metric.clear_storage().await;
            }
        }
        self.ctx.state.lock().await.status = HostStatus::Stopped;

        let ids = self.listener_ids.lock().await.clone();
        for (name, id) in ids {
            self.ctx.bus.unsubscribe(&name, id).await;
        }

        self.ctx
            .bus
            .emit("host_stopped", EventData::Labels(self.ctx.labels.clone()), self.ctx.config.name.clone())
            .await;

        info!(host = %self.ctx.config.name, "host stopped");
    }
}

/// For `Counter` metrics, a scenario's return value is treated as a delta
/// accumulated into a running total (stored under `counter_total`); all
/// other metric types publish the scenario's value directly. A scenario
/// returning a negative delta still accumulates it — Counters here are not
/// guaranteed monotonic, matching the population behavior this engine
/// emulates.
async fn publish_value(metric: &EmulatedMetric, raw: Option<f64>) -> Option<f64> {
    let delta = raw?;
    if metric.config.metric_type != MetricType::Counter {
        return Some(delta);
    }
    let storage = metric.storage();
    let current = storage
        .get("counter_total")
        .await
        .and_then(|v| v.as_float())
        .unwrap_or(0.0);
    let next = current + delta;
    storage.set("counter_total", next).await;
    Some(next)
}

/// Drives a single metric's `update` out of schedule because one of its
/// `listen_events` names just fired, then publishes the result the same
/// way a normal tick would.
async fn handle_metric_event(
    ctx: HostLoopContext,
    metric_name: String,
    event: Event,
    mut rng: Box<dyn RandomSource>,
) {
    if ctx.cancel.is_cancelled() {
        return;
    }

    let mut batch = Vec::new();
    {
        let mut state = ctx.state.lock().await;
        let links: Arc<HashMap<String, LinkedMetricView>> = Arc::new(
            state
                .metrics
                .iter()
                .map(|m| {
                    (
                        m.config.name.clone(),
                        LinkedMetricView {
                            config: m.config.clone(),
                            value: m.value(),
                            storage: m.storage().clone(),
                        },
                    )
                })
                .collect(),
        );

        if let Some(metric) = state.metrics.iter_mut().find(|m| m.config.name == metric_name) {
            let raw = metric.update(Some(event), &ctx.bus, links, &mut *rng).await;
            if let Some(value) = publish_value(metric, raw).await {
                batch.push((metric_name.clone(), value));
            }
        }
    }

    if !batch.is_empty() {
        let update = HostBatch {
            host_name: ctx.config.name.clone(),
            labels: ctx.labels.clone(),
            metrics: batch,
        };
        (ctx.update_callback)(update).await;
    }
}

async fn run_loop(ctx: HostLoopContext, mut rng: Box<dyn RandomSource>) {
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let now = ctx.clock.now();
        let host_start_time = ctx.state.lock().await.host_start_time;
        if let Some(ttl) = ctx.config.ttl {
            if now as f64 > host_start_time as f64 + ttl {
                break;
            }
        }

        let mut batch = Vec::new();
        {
            let mut state = ctx.state.lock().await;
            let links: Arc<HashMap<String, LinkedMetricView>> = Arc::new(
                state
                    .metrics
                    .iter()
                    .map(|m| {
                        (
                            m.config.name.clone(),
                            LinkedMetricView {
                                config: m.config.clone(),
                                value: m.value(),
                                storage: m.storage().clone(),
                            },
                        )
                    })
                    .collect(),
            );

            for metric in state.metrics.iter_mut() {
                let raw = metric.update(None, &ctx.bus, links.clone(), &mut *rng).await;
                if let Some(value) = publish_value(metric, raw).await {
                    batch.push((metric.config.name.clone(), value));
                }
            }
        }

        if !batch.is_empty() {
            let update = HostBatch {
                host_name: ctx.config.name.clone(),
                labels: ctx.labels.clone(),
                metrics: batch,
            };
            (ctx.update_callback)(update).await;
        }

        let (lo, hi) = ctx.config.interval_range;
        let sleep_for = rng.uniform(lo, hi).max(0.0);
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs_f64(sleep_for)) => {}
        }
    }

    ctx.state.lock().await.status = HostStatus::Stopped;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricType;
    use crate::scenarios::ScenarioSpec;
    use std::sync::atomic::{AtomicUsize, Ordering as Ord};

    struct FixedDraw(f64);
    impl RandomSource for FixedDraw {
        fn uniform(&mut self, _lo: f64, _hi: f64) -> f64 {
            self.0
        }
    }

    fn fixed_factory(value: f64) -> RngFactory {
        Arc::new(move || Box::new(FixedDraw(value)))
    }

    #[tokio::test]
    async fn synthesized_hostname_follows_expected_shape() {
        let mut rng = FixedDraw(0.0);
        let hostname = synthesize_hostname(&mut rng);
        assert_eq!(hostname, "stress01.lgs01.app.stage");

        let address = synthesize_address(&mut rng);
        assert_eq!(address, "192.168.1.10");
    }

    #[tokio::test]
    async fn counter_metric_accumulates_across_ticks() {
        let config = Arc::new(
            MetricConfig::builder("requests_total", MetricType::Counter)
                .value_range((0.0, 1_000_000.0))
                .update_interval(0.0)
                .scenario(ScenarioSpec::RandomInRange {
                    value_range: Some((5.0, 5.0)),
                })
                .build(),
        );
        let mut metric = EmulatedMetric::new(config, Clock::new_mock(0));
        let bus = EventBus::new();

        let first_raw = metric
            .update(None, &bus, Arc::new(HashMap::new()), &mut FixedDraw(0.0))
            .await;
        let first_total = publish_value(&metric, first_raw).await;
        assert_eq!(first_total, Some(5.0));

        let second_raw = metric
            .update(None, &bus, Arc::new(HashMap::new()), &mut FixedDraw(0.0))
            .await;
        let second_total = publish_value(&metric, second_raw).await;
        assert_eq!(second_total, Some(10.0));
    }

    #[tokio::test]
    async fn start_emits_host_started_and_stop_emits_host_stopped() {
        let config = Arc::new(
            HostConfig::builder("lonely-host")
                .interval_range((0.01, 0.01))
                .metric(
                    MetricConfig::builder("cpu", MetricType::Gauge)
                        .update_interval(0.0)
                        .scenario(ScenarioSpec::RandomInRange { value_range: None })
                        .build(),
                )
                .build(),
        );
        let bus = EventBus::new();
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        let s = started.clone();
        bus.subscribe("host_started", move |_e| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ord::SeqCst);
            }
        })
        .await;
        let st = stopped.clone();
        bus.subscribe("host_stopped", move |_e| {
            let st = st.clone();
            async move {
                st.fetch_add(1, Ord::SeqCst);
            }
        })
        .await;

        let batches = Arc::new(Mutex::new(Vec::new()));
        let b = batches.clone();
        let callback: UpdateCallback = Arc::new(move |batch: HostBatch| {
            let b = b.clone();
            Box::pin(async move {
                b.lock().await.push(batch);
            })
        });

        let host = EmulatedHost::new(
            config,
            Clock::new_mock(0),
            bus.clone(),
            callback,
            fixed_factory(0.01),
        )
        .await;

        host.start().await;
        assert!(host.is_running().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.stop().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ord::SeqCst), 1);
        assert_eq!(stopped.load(Ord::SeqCst), 1);
        assert!(!batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn ttl_expiry_stops_the_run_loop() {
        let config = Arc::new(
            HostConfig::builder("short-lived")
                .ttl(0.0)
                .interval_range((0.01, 0.01))
                .metric(
                    MetricConfig::builder("cpu", MetricType::Gauge)
                        .scenario(ScenarioSpec::DoNothing)
                        .build(),
                )
                .build(),
        );
        let clock = Clock::new_mock(0);
        let bus = EventBus::new();
        let callback: UpdateCallback = Arc::new(|_batch| Box::pin(async {}));

        let host = EmulatedHost::new(config, clock.clone(), bus, callback, fixed_factory(0.01)).await;
        host.start().await;
        clock.advance(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(host.status().await.run_state, HostStatus::Stopped);
    }
}
