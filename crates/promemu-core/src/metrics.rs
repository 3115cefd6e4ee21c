use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::clock::Clock;
use crate::error::ValidationError;
use crate::events::{Event, EventBus};
use crate::scenarios::{self, RandomSource, ScenarioSpec};
use crate::storage::StateStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Gauge,
    Counter,
    Histogram,
}

/// Immutable description of one metric on a host. Built once by a
/// `HostPopulation` and never mutated afterwards.
#[derive(Clone)]
pub struct MetricConfig {
    pub name: String,
    pub metric_type: MetricType,
    pub units: Option<String>,
    pub description: Option<String>,
    pub value_range: (f64, f64),
    pub init_value: Option<f64>,
    pub update_interval: f64,
    pub start_time: f64,
    pub ttl: Option<f64>,
    pub listen_events: Vec<String>,
    pub linked_metrics: Vec<String>,
    pub scenario: Option<ScenarioSpec>,
}

impl MetricConfig {
    pub fn builder(name: impl Into<String>, metric_type: MetricType) -> MetricConfigBuilder {
        MetricConfigBuilder::new(name, metric_type)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.value_range.0 > self.value_range.1 {
            return Err(ValidationError::InvalidPercentRange(
                self.value_range.0,
                self.value_range.1,
            ));
        }
        if self.update_interval <= 0.0 {
            return Err(ValidationError::NonPositive {
                scenario: "metric_config",
                field: "update_interval",
                value: self.update_interval,
            });
        }
        Ok(())
    }
}

/// Ergonomic builder for assembling a `MetricConfig` with mostly-default
/// fields, the way host population code constructs dozens of these inline.
pub struct MetricConfigBuilder {
    config: MetricConfig,
}

impl MetricConfigBuilder {
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            config: MetricConfig {
                name: name.into(),
                metric_type,
                units: None,
                description: None,
                value_range: (0.0, 100.0),
                init_value: None,
                update_interval: 10.0,
                start_time: 0.0,
                ttl: None,
                listen_events: Vec::new(),
                linked_metrics: Vec::new(),
                scenario: None,
            },
        }
    }

    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.config.units = Some(units.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.config.description = Some(description.into());
        self
    }

    pub fn value_range(mut self, range: (f64, f64)) -> Self {
        self.config.value_range = range;
        self
    }

    pub fn init_value(mut self, value: f64) -> Self {
        self.config.init_value = Some(value);
        self
    }

    pub fn update_interval(mut self, seconds: f64) -> Self {
        self.config.update_interval = seconds;
        self
    }

    pub fn start_time(mut self, seconds: f64) -> Self {
        self.config.start_time = seconds;
        self
    }

    pub fn ttl(mut self, seconds: f64) -> Self {
        self.config.ttl = Some(seconds);
        self
    }

    pub fn listen_events(mut self, events: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.listen_events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn linked_metrics(mut self, metrics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.linked_metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    pub fn scenario(mut self, scenario: ScenarioSpec) -> Self {
        self.config.scenario = Some(scenario);
        self
    }

    pub fn build(self) -> MetricConfig {
        self.config
    }
}

/// A read-only snapshot of a linked metric, exposed to a scenario through
/// `MetricContext::links`.
#[derive(Clone)]
pub struct LinkedMetricView {
    pub config: Arc<MetricConfig>,
    pub value: Option<f64>,
    pub storage: StateStorage,
}

/// Ephemeral record built fresh for every scenario invocation.
#[derive(Clone)]
pub struct MetricContext {
    pub config: Arc<MetricConfig>,
    pub value: Option<f64>,
    pub event: Option<Event>,
    pub timestamp: u64,
    pub storage: StateStorage,
    pub links: Arc<HashMap<String, LinkedMetricView>>,
}

impl MetricContext {
    /// Builds the context a linked metric sees when it is relayed into:
    /// same timestamp, no event, using the link's own config/value/storage.
    pub fn as_link_context(&self, link: &LinkedMetricView) -> MetricContext {
        MetricContext {
            config: link.config.clone(),
            value: link.value,
            event: None,
            timestamp: self.timestamp,
            storage: link.storage.clone(),
            links: Arc::new(HashMap::new()),
        }
    }
}

/// Wraps one `MetricConfig`; ticks at `update_interval`, invokes its
/// scenario, clamps and rounds the result.
pub struct EmulatedMetric {
    pub config: Arc<MetricConfig>,
    value: Option<f64>,
    last_update: Option<u64>,
    start_timestamp: u64,
    storage: StateStorage,
    clock: Clock,
}

impl EmulatedMetric {
    pub fn new(config: Arc<MetricConfig>, clock: Clock) -> Self {
        let start_timestamp = clock.now().saturating_add(config.start_time.max(0.0) as u64);
        let value = config.init_value;
        Self {
            config,
            value,
            last_update: None,
            start_timestamp,
            storage: StateStorage::new(),
            clock,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn storage(&self) -> &StateStorage {
        &self.storage
    }

    /// Clears this metric's scratch state. Called when the owning host
    /// stops.
    pub async fn clear_storage(&self) {
        self.storage.clean().await;
    }

    /// Advances the metric one step, per §4.4:
    /// 1. not yet started → `None`
    /// 2. past its ttl → `None`
    /// 3. within the interval and not event-driven → unchanged value
    /// 4. otherwise: run the scenario, clamp, round, store.
    ///
    /// Event-driven invocations (`event.is_some()`) bypass the start/ttl/
    /// interval gates entirely, matching out-of-schedule delivery.
    pub async fn update(
        &mut self,
        event: Option<Event>,
        bus: &EventBus,
        links: Arc<HashMap<String, LinkedMetricView>>,
        rng: &mut dyn RandomSource,
    ) -> Option<f64> {
        let now = self.clock.now();

        if event.is_none() {
            if now < self.start_timestamp {
                return None;
            }
            if let Some(ttl) = self.config.ttl {
                if now as f64 > self.start_timestamp as f64 + ttl {
                    return None;
                }
            }
            if let Some(last) = self.last_update {
                if (now.saturating_sub(last) as f64) < self.config.update_interval {
                    return self.value;
                }
            }
            self.last_update = Some(now);
        }

        let Some(scenario) = self.config.scenario.clone() else {
            return self.value;
        };

        let ctx = MetricContext {
            config: self.config.clone(),
            value: self.value,
            event,
            timestamp: now,
            storage: self.storage.clone(),
            links,
        };

        let result = match scenarios::evaluate(&scenario, &ctx, bus, rng).await {
            Ok(v) => v,
            Err(err) => {
                warn!(metric = %self.config.name, %err, "scenario evaluation failed, keeping prior value");
                return self.value;
            }
        };

        let Some(raw) = result else {
            return self.value;
        };

        let (min, max) = self.config.value_range;
        let clamped = raw.clamp(min, max);
        let rounded = (clamped * 100.0).round() / 100.0;
        self.value = Some(rounded);
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::{RngSource, ScenarioSpec};

    fn test_rng() -> RngSource<rand::rngs::SmallRng> {
        use rand::SeedableRng;
        RngSource(rand::rngs::SmallRng::seed_from_u64(42))
    }

    #[tokio::test]
    async fn start_time_delays_first_tick() {
        let clock = Clock::new_mock(0);
        let config = Arc::new(
            MetricConfig::builder("delayed", MetricType::Gauge)
                .start_time(100.0)
                .scenario(ScenarioSpec::DoNothing)
                .init_value(1.0)
                .build(),
        );
        let mut metric = EmulatedMetric::new(config, clock.clone());
        let bus = EventBus::new();
        let mut rng = test_rng();

        let v = metric
            .update(None, &bus, Arc::new(HashMap::new()), &mut rng)
            .await;
        assert_eq!(v, None);

        clock.advance(100);
        let v = metric
            .update(None, &bus, Arc::new(HashMap::new()), &mut rng)
            .await;
        assert_eq!(v, Some(1.0));
    }

    #[tokio::test]
    async fn ttl_expiry_stops_ticking() {
        let clock = Clock::new_mock(0);
        let config = Arc::new(
            MetricConfig::builder("short_lived", MetricType::Gauge)
                .ttl(0.0)
                .scenario(ScenarioSpec::DoNothing)
                .init_value(5.0)
                .build(),
        );
        let mut metric = EmulatedMetric::new(config, clock.clone());
        let bus = EventBus::new();
        let mut rng = test_rng();

        clock.advance(1);
        let v = metric
            .update(None, &bus, Arc::new(HashMap::new()), &mut rng)
            .await;
        assert_eq!(v, None);
    }

    #[tokio::test]
    async fn update_interval_boundary_reuses_value_before_elapsed() {
        let clock = Clock::new_mock(0);
        let config = Arc::new(
            MetricConfig::builder("bounded", MetricType::Gauge)
                .update_interval(10.0)
                .value_range((0.0, 1000.0))
                .scenario(ScenarioSpec::RandomInRange { value_range: None })
                .init_value(50.0)
                .build(),
        );
        let mut metric = EmulatedMetric::new(config, clock.clone());
        let bus = EventBus::new();
        let mut rng = test_rng();

        let first = metric
            .update(None, &bus, Arc::new(HashMap::new()), &mut rng)
            .await;
        clock.advance(5);
        let second = metric
            .update(None, &bus, Arc::new(HashMap::new()), &mut rng)
            .await;
        assert_eq!(first, second);

        clock.advance(5);
        let third = metric
            .update(None, &bus, Arc::new(HashMap::new()), &mut rng)
            .await;
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn clamps_and_rounds_to_two_decimals() {
        let clock = Clock::new_mock(0);
        let config = Arc::new(
            MetricConfig::builder("clamp_me", MetricType::Gauge)
                .value_range((0.0, 10.0))
                .scenario(ScenarioSpec::RandomInRange {
                    value_range: Some((100.0, 100.0)),
                })
                .build(),
        );
        let mut metric = EmulatedMetric::new(config, clock.clone());
        let bus = EventBus::new();
        let mut rng = test_rng();

        let v = metric
            .update(None, &bus, Arc::new(HashMap::new()), &mut rng)
            .await;
        assert_eq!(v, Some(10.0));
    }
}
