use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use rand::{Rng, RngCore};
use tracing::error;

use crate::error::ValidationError;
use crate::events::{EventBus, EventData};
use crate::metrics::MetricContext;
use crate::storage::StorageValue;

/// A function relaying or deriving a value from another metric's context,
/// e.g. `calc_percent_usage` or a custom closure.
pub type CalcFn = Arc<dyn Fn(&MetricContext) -> Result<Option<f64>, ValidationError> + Send + Sync>;

/// The randomness a scenario draws on, injected per invocation so tests can
/// force exact draws instead of seeding a generator and hoping its output
/// lands where the test expects.
pub trait RandomSource: Send {
    fn uniform(&mut self, lo: f64, hi: f64) -> f64;
}

/// Wraps any `rand` generator as a `RandomSource` for production use.
pub struct RngSource<R: RngCore>(pub R);

impl<R: RngCore + Send> RandomSource for RngSource<R> {
    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if lo >= hi {
            return lo;
        }
        self.0.gen_range(lo..=hi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
    Hold,
}

/// One entry in a `switch_scenario_by_events` events_config map: the
/// scenario to run when the event fires (`None` means "reset to default"),
/// and how long to keep running it once triggered.
#[derive(Clone)]
pub struct EventScenarioEntry {
    pub scenario: Option<ScenarioSpec>,
    pub duration: Option<f64>,
}

/// A scenario together with its parameters, resolved once at host
/// population build time: instead of a name resolved at call time against
/// a string-keyed function registry, the population builder constructs the
/// fully-typed variant directly. An unresolvable name in
/// `switch_scenario_by_events`' stored state simply has no matching entry
/// and falls through to holding the current value.
#[derive(Clone)]
pub enum ScenarioSpec {
    DoNothing,
    RandomInRange {
        value_range: Option<(f64, f64)>,
    },
    SineWave {
        period: f64,
        amplitude: f64,
        offset: f64,
        phase_offset: f64,
    },
    FeatureToggle {
        start_time: f64,
        duration: f64,
        interval: f64,
        on_value: f64,
        off_value: f64,
        source: Option<String>,
    },
    VarietySelection {
        values: Vec<f64>,
        varieties: Vec<f64>,
        change_probability: f64,
    },
    UpdateByTrend {
        trend: Trend,
        step_range: (f64, f64),
    },
    RelayToOtherMetric {
        source_metric_name: String,
        calc_function: CalcFn,
    },
    CalcByEvent {
        events_config: HashMap<String, CalcFn>,
    },
    TimeDuration,
    SwitchScenarioByEvents {
        events_config: HashMap<String, EventScenarioEntry>,
        default_scenario: Option<Box<ScenarioSpec>>,
    },
}

/// Evaluates `spec` against `ctx`, returning the scenario's next value.
/// `bus` is used by scenarios that emit events as a side effect
/// (`feature_toggle`); `rng` is the injected randomness source, kept out of
/// `ctx` so tests can drive it deterministically.
pub async fn evaluate(
    spec: &ScenarioSpec,
    ctx: &MetricContext,
    bus: &EventBus,
    rng: &mut dyn RandomSource,
) -> Result<Option<f64>, ValidationError> {
    match spec {
        ScenarioSpec::DoNothing => Ok(ctx.value),

        ScenarioSpec::RandomInRange { value_range } => {
            let (min, max) = value_range.unwrap_or(ctx.config.value_range);
            Ok(Some(rng.uniform(min, max)))
        }

        ScenarioSpec::SineWave {
            period,
            amplitude,
            offset,
            phase_offset,
        } => sine_wave(ctx, *period, *amplitude, *offset, *phase_offset).await,

        ScenarioSpec::FeatureToggle {
            start_time,
            duration,
            interval,
            on_value,
            off_value,
            source,
        } => {
            feature_toggle(
                ctx,
                bus,
                *start_time,
                *duration,
                *interval,
                *on_value,
                *off_value,
                source.as_deref(),
            )
            .await
        }

        ScenarioSpec::VarietySelection {
            values,
            varieties,
            change_probability,
        } => variety_selection(ctx, rng, values, varieties, *change_probability).await,

        ScenarioSpec::UpdateByTrend { trend, step_range } => {
            update_by_trend(ctx, rng, *trend, *step_range).await
        }

        ScenarioSpec::RelayToOtherMetric {
            source_metric_name,
            calc_function,
        } => Ok(relay_to_other_metric(ctx, source_metric_name, calc_function)),

        ScenarioSpec::CalcByEvent { events_config } => calc_by_event(ctx, events_config),

        ScenarioSpec::TimeDuration => time_duration(ctx).await,

        ScenarioSpec::SwitchScenarioByEvents {
            events_config,
            default_scenario,
        } => {
            switch_scenario_by_events(ctx, bus, rng, events_config, default_scenario.as_deref())
                .await
        }
    }
}

async fn sine_wave(
    ctx: &MetricContext,
    period: f64,
    amplitude: f64,
    offset: f64,
    phase_offset: f64,
) -> Result<Option<f64>, ValidationError> {
    if period <= 0.0 {
        return Err(ValidationError::NonPositivePeriod {
            scenario: "sine_wave",
            value: period,
        });
    }

    if ctx.storage.get("sine_start_time").await.is_none() {
        ctx.storage
            .set("sine_start_time", StorageValue::Timestamp(ctx.timestamp))
            .await;
    }
    let start = ctx
        .storage
        .get("sine_start_time")
        .await
        .and_then(|v| v.as_u64())
        .unwrap_or(ctx.timestamp);

    let elapsed = ctx.timestamp.saturating_sub(start) as f64;
    let phase = (elapsed / period) * 2.0 * PI + phase_offset;
    Ok(Some(offset + amplitude * phase.sin()))
}

async fn feature_toggle(
    ctx: &MetricContext,
    bus: &EventBus,
    start_time: f64,
    duration: f64,
    interval: f64,
    on_value: f64,
    off_value: f64,
    source: Option<&str>,
) -> Result<Option<f64>, ValidationError> {
    if start_time < 0.0 {
        return Err(ValidationError::NegativeStartTime {
            scenario: "feature_toggle",
            value: start_time,
        });
    }
    if duration <= 0.0 {
        return Err(ValidationError::NonPositive {
            scenario: "feature_toggle",
            field: "duration",
            value: duration,
        });
    }
    if interval <= 0.0 {
        return Err(ValidationError::NonPositive {
            scenario: "feature_toggle",
            field: "interval",
            value: interval,
        });
    }

    if ctx.storage.get("start_timestamp").await.is_none() {
        ctx.storage
            .set("start_timestamp", StorageValue::Timestamp(ctx.timestamp))
            .await;
    }
    let start_timestamp = ctx
        .storage
        .get("start_timestamp")
        .await
        .and_then(|v| v.as_u64())
        .unwrap_or(ctx.timestamp);

    let elapsed = ctx.timestamp as f64 - start_timestamp as f64;
    if elapsed < start_time {
        return Ok(Some(off_value));
    }

    let cycle_elapsed = elapsed - start_time;
    let cycle_length = duration + interval;
    let cycle_position = cycle_elapsed % cycle_length;
    let is_on = cycle_position < duration;

    let previous_state = ctx
        .storage
        .get_or("feature_active", StorageValue::Bool(false))
        .await
        .as_bool()
        .unwrap_or(false);

    if is_on != previous_state {
        ctx.storage.set("feature_active", is_on).await;
        let event_name = if is_on { "feature_on" } else { "feature_off" };
        let data = EventData::Timestamp {
            timestamp: ctx.timestamp,
        };
        bus.emit(event_name, data, source.unwrap_or_default()).await;
    }

    Ok(Some(if is_on { on_value } else { off_value }))
}

async fn variety_selection(
    ctx: &MetricContext,
    rng: &mut dyn RandomSource,
    values: &[f64],
    varieties: &[f64],
    change_probability: f64,
) -> Result<Option<f64>, ValidationError> {
    if values.len() != varieties.len() {
        return Err(ValidationError::MismatchedLengths {
            values: values.len(),
            varieties: varieties.len(),
        });
    }
    if varieties.iter().any(|&w| w < 0.0) {
        return Err(ValidationError::NegativeWeight);
    }
    if !(0.0..=1.0).contains(&change_probability) {
        return Err(ValidationError::ProbabilityOutOfRange(change_probability));
    }
    let total: f64 = varieties.iter().sum();
    if total == 0.0 {
        return Err(ValidationError::AllWeightsZero);
    }
    let normalized: Vec<f64> = varieties.iter().map(|w| w / total).collect();

    let mut index = ctx
        .storage
        .get_or("variety_index", StorageValue::Int(0))
        .await
        .as_u64()
        .unwrap_or(0) as usize;

    if rng.uniform(0.0, 1.0) < change_probability {
        let draw = rng.uniform(0.0, 1.0);
        let mut cumulative = 0.0;
        for (i, weight) in normalized.iter().enumerate() {
            cumulative += weight;
            if draw <= cumulative {
                index = i;
                break;
            }
        }
        ctx.storage
            .set("variety_index", StorageValue::Int(index as i64))
            .await;
    }

    Ok(values.get(index).copied())
}

async fn update_by_trend(
    ctx: &MetricContext,
    rng: &mut dyn RandomSource,
    trend: Trend,
    step_range: (f64, f64),
) -> Result<Option<f64>, ValidationError> {
    let (min_step, max_step) = step_range;
    if min_step < 0.0 || max_step < 0.0 || min_step > max_step {
        return Err(ValidationError::InvalidStepRange(min_step, max_step));
    }

    let accumulated = ctx
        .storage
        .get("accumulated_value")
        .await
        .and_then(|v| v.as_float())
        .unwrap_or(ctx.value.unwrap_or(0.0));

    match trend {
        Trend::Up => {
            let step = rng.uniform(min_step, max_step);
            let next = accumulated + step;
            ctx.storage
                .set("accumulated_value", StorageValue::Float(next))
                .await;
            Ok(Some(next))
        }
        Trend::Down => {
            let step = rng.uniform(-max_step, -min_step);
            let next = accumulated + step;
            ctx.storage
                .set("accumulated_value", StorageValue::Float(next))
                .await;
            Ok(Some(next))
        }
        Trend::Hold => {
            let step = rng.uniform(-min_step, max_step);
            Ok(Some(accumulated + step))
        }
    }
}

fn relay_to_other_metric(
    ctx: &MetricContext,
    source_metric_name: &str,
    calc_function: &CalcFn,
) -> Option<f64> {
    match ctx.links.get(source_metric_name) {
        Some(link) => {
            let link_ctx = ctx.as_link_context(link);
            match calc_function(&link_ctx) {
                Ok(value) => value,
                Err(err) => {
                    error!(metric = %source_metric_name, %err, "relay calc_function failed");
                    ctx.value
                }
            }
        }
        None => {
            error!(metric = %source_metric_name, "source metric is not linked");
            ctx.value
        }
    }
}

fn calc_by_event(
    ctx: &MetricContext,
    events_config: &HashMap<String, CalcFn>,
) -> Result<Option<f64>, ValidationError> {
    if let Some(event) = &ctx.event {
        if let Some(calc_function) = events_config.get(&event.name) {
            return calc_function(ctx);
        }
    }
    Ok(ctx.value)
}

async fn time_duration(ctx: &MetricContext) -> Result<Option<f64>, ValidationError> {
    if ctx.storage.get("uptime_start").await.is_none() {
        ctx.storage
            .set("uptime_start", StorageValue::Timestamp(ctx.timestamp))
            .await;
        return Ok(Some(0.0));
    }
    let start = ctx
        .storage
        .get("uptime_start")
        .await
        .and_then(|v| v.as_u64())
        .unwrap_or(ctx.timestamp);
    Ok(Some(ctx.timestamp.saturating_sub(start) as f64))
}

/// `events_config` maps event names to an optional scenario+duration.
/// 1. a matching event with a scenario runs it and remembers it by name.
/// 2. a matching event with no scenario clears the remembered state.
/// 3. otherwise, the remembered scenario keeps running until its duration
///    (if any) elapses.
/// 4. otherwise, `default_scenario` runs.
/// 5. otherwise, a uniform sample over the metric's value range.
async fn switch_scenario_by_events(
    ctx: &MetricContext,
    bus: &EventBus,
    rng: &mut dyn RandomSource,
    events_config: &HashMap<String, EventScenarioEntry>,
    default_scenario: Option<&ScenarioSpec>,
) -> Result<Option<f64>, ValidationError> {
    if let Some(event) = &ctx.event {
        if let Some(entry) = events_config.get(&event.name) {
            match &entry.scenario {
                Some(scenario) => {
                    ctx.storage
                        .set("last_event_name", StorageValue::Text(event.name.clone()))
                        .await;
                    ctx.storage
                        .set("last_event_timestamp", StorageValue::Timestamp(ctx.timestamp))
                        .await;

                    return match Box::pin(evaluate(scenario, ctx, bus, rng)).await {
                        Ok(value) => Ok(value),
                        Err(err) => {
                            error!(event = %event.name, %err, "event-triggered scenario failed");
                            Ok(Some(rng.uniform(
                                ctx.config.value_range.0,
                                ctx.config.value_range.1,
                            )))
                        }
                    };
                }
                None => {
                    ctx.storage.remove("last_event_name").await;
                    ctx.storage.remove("last_event_timestamp").await;
                }
            }
        }
    }

    let last_event_name = ctx
        .storage
        .get("last_event_name")
        .await
        .and_then(|v| v.as_text().map(str::to_string));
    let last_event_timestamp = ctx
        .storage
        .get("last_event_timestamp")
        .await
        .and_then(|v| v.as_u64());

    if let (Some(name), Some(triggered_at)) = (last_event_name, last_event_timestamp) {
        if let Some(entry) = events_config.get(&name) {
            if let Some(scenario) = &entry.scenario {
                let still_active = match entry.duration {
                    None => true,
                    Some(duration) => (ctx.timestamp as f64 - triggered_at as f64) <= duration,
                };
                if still_active {
                    match Box::pin(evaluate(scenario, ctx, bus, rng)).await {
                        Ok(value) => return Ok(value),
                        Err(err) => {
                            error!(event = %name, %err, "stored event scenario failed, falling through");
                        }
                    }
                }
            }
        }
    }

    if let Some(scenario) = default_scenario {
        match Box::pin(evaluate(scenario, ctx, bus, rng)).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                error!(%err, "default scenario failed, falling through to uniform sample");
            }
        }
    }

    Ok(Some(rng.uniform(
        ctx.config.value_range.0,
        ctx.config.value_range.1,
    )))
}

/// Unit multiplier tables for byte- and bit-family size strings.
const BYTE_UNITS: &[(&str, f64)] = &[
    ("b", 1.0),
    ("byte", 1.0),
    ("bytes", 1.0),
    ("kb", 1024.0),
    ("kbyte", 1024.0),
    ("kbytes", 1024.0),
    ("kilobyte", 1024.0),
    ("kilobytes", 1024.0),
    ("mb", 1024.0 * 1024.0),
    ("mbyte", 1024.0 * 1024.0),
    ("mbytes", 1024.0 * 1024.0),
    ("megabyte", 1024.0 * 1024.0),
    ("megabytes", 1024.0 * 1024.0),
    ("gb", 1024.0 * 1024.0 * 1024.0),
    ("gbyte", 1024.0 * 1024.0 * 1024.0),
    ("gbytes", 1024.0 * 1024.0 * 1024.0),
    ("gigabyte", 1024.0 * 1024.0 * 1024.0),
    ("gigabytes", 1024.0 * 1024.0 * 1024.0),
    ("tb", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("tbyte", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("tbytes", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("terabyte", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("terabytes", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("pb", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("pbyte", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("pbytes", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("petabyte", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("petabytes", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

const BIT_UNITS: &[(&str, f64)] = &[
    ("bit", 1.0),
    ("bits", 1.0),
    ("kbit", 1024.0),
    ("kbits", 1024.0),
    ("kilobit", 1024.0),
    ("kilobits", 1024.0),
    ("mbit", 1024.0 * 1024.0),
    ("mbits", 1024.0 * 1024.0),
    ("megabit", 1024.0 * 1024.0),
    ("megabits", 1024.0 * 1024.0),
    ("gbit", 1024.0 * 1024.0 * 1024.0),
    ("gbits", 1024.0 * 1024.0 * 1024.0),
    ("gigabit", 1024.0 * 1024.0 * 1024.0),
    ("gigabits", 1024.0 * 1024.0 * 1024.0),
    ("tbit", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("tbits", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("terabit", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("terabits", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("pbit", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("pbits", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("petabit", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("petabits", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

/// Parses `<num><unit>` (e.g. "1.5Gb", "500 Kbit") into a byte/bit count.
pub fn size_to_bytes(size: &str) -> Result<f64, ValidationError> {
    let trimmed = size.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::SizeParse(
            "size must be a non-empty string".into(),
        ));
    }
    let lower = trimmed.to_lowercase();
    let split_at = lower
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| ValidationError::SizeParse(format!("invalid size format: '{size}'")))?;
    let (number_part, unit_part) = lower.split_at(split_at);
    let number_part = number_part.trim();
    let unit_part = unit_part.trim();

    if number_part.is_empty()
        || !number_part.chars().all(|c| c.is_ascii_digit() || c == '.')
        || unit_part.is_empty()
        || !unit_part.chars().all(|c| c.is_ascii_alphabetic())
    {
        return Err(ValidationError::SizeParse(format!(
            "invalid size format: '{size}'"
        )));
    }

    let number: f64 = number_part
        .parse()
        .map_err(|_| ValidationError::SizeParse(format!("invalid number in size: '{number_part}'")))?;

    let multiplier = BYTE_UNITS
        .iter()
        .chain(BIT_UNITS.iter())
        .find(|(unit, _)| *unit == unit_part)
        .map(|(_, m)| *m)
        .ok_or_else(|| ValidationError::SizeParse(format!("unsupported unit: '{unit_part}'")))?;

    Ok(number * multiplier)
}

/// Clamps `ctx.value` into `ctx.config.value_range` and returns the
/// percentage of the range it occupies.
pub fn calc_percent_usage(ctx: &MetricContext) -> Result<Option<f64>, ValidationError> {
    let Some(value) = ctx.value else {
        return Ok(None);
    };
    let (min, max) = ctx.config.value_range;
    if min >= max {
        return Err(ValidationError::InvalidPercentRange(min, max));
    }
    let clamped = value.clamp(min, max);
    Ok(Some((clamped - min) / (max - min) * 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{LinkedMetricView, MetricConfig, MetricType};
    use crate::storage::StateStorage;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    /// Always returns the same value, ignoring the requested range. Lets
    /// tests force the exact draw a scenario sees instead of depending on
    /// a seeded generator's internal sampling algorithm.
    struct FixedDraw(f64);

    impl RandomSource for FixedDraw {
        fn uniform(&mut self, _lo: f64, _hi: f64) -> f64 {
            self.0
        }
    }

    fn ctx_with(config: MetricConfig, value: Option<f64>, timestamp: u64) -> MetricContext {
        MetricContext {
            config: Arc::new(config),
            value,
            event: None,
            timestamp,
            storage: StateStorage::new(),
            links: Arc::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn sine_wave_matches_known_points() {
        let config = MetricConfig::builder("sine", MetricType::Gauge).build();
        let ctx = ctx_with(config, None, 1_000);
        let bus = EventBus::new();
        let mut rng = RngSource(SmallRng::seed_from_u64(1));

        let spec = ScenarioSpec::SineWave {
            period: 100.0,
            amplitude: 10.0,
            offset: 50.0,
            phase_offset: 0.0,
        };

        let at_start = evaluate(&spec, &ctx, &bus, &mut rng).await.unwrap();
        assert_eq!(at_start, Some(50.0));

        let ctx_25 = MetricContext {
            timestamp: 1_025,
            ..ctx.clone()
        };
        let at_25 = evaluate(&spec, &ctx_25, &bus, &mut rng).await.unwrap();
        assert!((at_25.unwrap() - 60.0).abs() < 1e-9);

        let ctx_50 = MetricContext {
            timestamp: 1_050,
            ..ctx.clone()
        };
        let at_50 = evaluate(&spec, &ctx_50, &bus, &mut rng).await.unwrap();
        assert!((at_50.unwrap() - 50.0).abs() < 1e-9);

        let ctx_75 = MetricContext {
            timestamp: 1_075,
            ..ctx.clone()
        };
        let at_75 = evaluate(&spec, &ctx_75, &bus, &mut rng).await.unwrap();
        assert!((at_75.unwrap() - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sine_wave_rejects_non_positive_period() {
        let config = MetricConfig::builder("sine", MetricType::Gauge).build();
        let ctx = ctx_with(config, None, 0);
        let bus = EventBus::new();
        let mut rng = RngSource(SmallRng::seed_from_u64(1));

        let spec = ScenarioSpec::SineWave {
            period: 0.0,
            amplitude: 1.0,
            offset: 0.0,
            phase_offset: 0.0,
        };
        let result = evaluate(&spec, &ctx, &bus, &mut rng).await;
        assert!(matches!(
            result,
            Err(ValidationError::NonPositivePeriod { .. })
        ));
    }

    #[tokio::test]
    async fn feature_toggle_transitions_match_known_schedule() {
        let config = MetricConfig::builder("toggle", MetricType::Gauge).build();
        let ctx = ctx_with(config, None, 1_000);
        let bus = EventBus::new();
        let mut rng = RngSource(SmallRng::seed_from_u64(1));

        let spec = ScenarioSpec::FeatureToggle {
            start_time: 10.0,
            duration: 20.0,
            interval: 10.0,
            on_value: 1.0,
            off_value: 0.0,
            source: None,
        };

        let at = |ts: u64| MetricContext {
            timestamp: ts,
            ..ctx.clone()
        };

        assert_eq!(
            evaluate(&spec, &at(1_005), &bus, &mut rng).await.unwrap(),
            Some(0.0)
        );
        assert_eq!(
            evaluate(&spec, &at(1_015), &bus, &mut rng).await.unwrap(),
            Some(1.0)
        );
        assert_eq!(
            evaluate(&spec, &at(1_025), &bus, &mut rng).await.unwrap(),
            Some(1.0)
        );
        assert_eq!(
            evaluate(&spec, &at(1_035), &bus, &mut rng).await.unwrap(),
            Some(0.0)
        );
        assert_eq!(
            evaluate(&spec, &at(1_045), &bus, &mut rng).await.unwrap(),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn update_by_trend_up_accumulates_forced_step() {
        let config = MetricConfig::builder("trend", MetricType::Gauge).build();
        let ctx = ctx_with(config, Some(50.0), 0);

        let next = update_by_trend(&ctx, &mut FixedDraw(5.0), Trend::Up, (1.0, 10.0))
            .await
            .unwrap();
        assert_eq!(next, Some(55.0));
        assert_eq!(
            ctx.storage
                .get("accumulated_value")
                .await
                .unwrap()
                .as_float(),
            Some(55.0)
        );
    }

    #[tokio::test]
    async fn variety_selection_picks_weighted_bucket() {
        let config = MetricConfig::builder("variety", MetricType::Gauge).build();
        let ctx = ctx_with(config, None, 0);

        let values = vec![10.0, 50.0, 90.0];
        let varieties = vec![0.2, 0.5, 0.3];

        // change_probability=1 forces a draw; FixedDraw always returns
        // 0.3, landing in the second bucket (cumulative thresholds
        // 0.2/0.7/1.0).
        let result = variety_selection(&ctx, &mut FixedDraw(0.3), &values, &varieties, 1.0)
            .await
            .unwrap();
        assert_eq!(result, Some(50.0));
    }

    #[tokio::test]
    async fn relay_to_other_metric_uses_calc_percent_usage() {
        let source_config = Arc::new(
            MetricConfig::builder("mem_bytes", MetricType::Gauge)
                .value_range((size_to_bytes("1Gb").unwrap(), size_to_bytes("16Gb").unwrap()))
                .build(),
        );
        let link = LinkedMetricView {
            config: source_config,
            value: Some(size_to_bytes("8Gb").unwrap()),
            storage: StateStorage::new(),
        };
        let mut links = HashMap::new();
        links.insert("mem_bytes".to_string(), link);

        let target_config = MetricConfig::builder("mem_pct", MetricType::Gauge).build();
        let ctx = MetricContext {
            config: Arc::new(target_config),
            value: None,
            event: None,
            timestamp: 0,
            storage: StateStorage::new(),
            links: Arc::new(links),
        };

        let calc_function: CalcFn = Arc::new(calc_percent_usage);
        let result = relay_to_other_metric(&ctx, "mem_bytes", &calc_function);
        assert!((result.unwrap() - 46.666_666_666_666_67).abs() < 1e-6);
    }

    #[test]
    fn size_to_bytes_parses_case_insensitive_units() {
        assert_eq!(size_to_bytes("1Gb").unwrap(), 1024.0_f64.powi(3));
        assert_eq!(size_to_bytes("1gb").unwrap(), 1024.0_f64.powi(3));
        assert_eq!(size_to_bytes("1 GB").unwrap(), 1024.0_f64.powi(3));
        assert_eq!(size_to_bytes("1.5mb").unwrap(), 1.5 * 1024.0_f64.powi(2));
        assert_eq!(size_to_bytes("100Kbit").unwrap(), 100.0 * 1024.0);
    }

    #[test]
    fn size_to_bytes_rejects_malformed_input() {
        assert!(size_to_bytes("").is_err());
        assert!(size_to_bytes("abc").is_err());
        assert!(size_to_bytes("100").is_err());
        assert!(size_to_bytes("100xb").is_err());
    }

    #[test]
    fn calc_percent_usage_clamps_out_of_range_values() {
        let config = MetricConfig::builder("pct", MetricType::Gauge)
            .value_range((1.0, 16.0))
            .build();
        let below = ctx_with(config.clone(), Some(0.0), 0);
        assert_eq!(calc_percent_usage(&below).unwrap(), Some(0.0));

        let above = ctx_with(config, Some(20.0), 0);
        assert_eq!(calc_percent_usage(&above).unwrap(), Some(100.0));
    }

    #[test]
    fn calc_percent_usage_matches_worked_example() {
        let config = MetricConfig::builder("pct", MetricType::Gauge)
            .value_range((1024.0_f64.powi(3), 16.0 * 1024.0_f64.powi(3)))
            .build();
        let ctx = ctx_with(config, Some(8.0 * 1024.0_f64.powi(3)), 0);
        let pct = calc_percent_usage(&ctx).unwrap().unwrap();
        assert!((pct - 46.666_666_666_666_67).abs() < 1e-6);
    }
}
