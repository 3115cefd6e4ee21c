use std::sync::Arc;

use promemu_core::hosts::HostConfig;
use promemu_core::metrics::{MetricConfig, MetricType};
use promemu_core::mixer::MixerConfig;
use promemu_core::scenarios::ScenarioSpec;

use crate::{HostPopulation, PopulationOverrides};

pub const NAME: &str = "single_host_load";

const HOST_TTL_SEC: f64 = 600.0;
const HOST_INTERVAL_RANGE: (f64, f64) = (14.0, 16.0);
const METRICS_INTERVAL_SEC: f64 = 10.0;

/// One host reporting three sine-wave system metrics. A small smoke-test
/// population: no events, no linked metrics, one job.
pub struct SingleHostLoad;

impl HostPopulation for SingleHostLoad {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "a single host publishing cpu/memory/io sine-wave gauges"
    }

    fn build(&self, overrides: &PopulationOverrides) -> MixerConfig {
        let host_ttl = overrides.host_ttl.unwrap_or(HOST_TTL_SEC);
        let interval_range = overrides.host_interval_range.unwrap_or(HOST_INTERVAL_RANGE);
        let metrics_interval = overrides.metrics_interval.unwrap_or(METRICS_INTERVAL_SEC);

        let sine = |name: &str, value_range: (f64, f64), units: &str, description: &str| {
            MetricConfig::builder(name, MetricType::Gauge)
                .init_value(50.0)
                .value_range(value_range)
                .units(units)
                .update_interval(metrics_interval)
                .scenario(ScenarioSpec::SineWave {
                    period: 300.0,
                    amplitude: 50.0,
                    offset: 50.0,
                    phase_offset: 0.0,
                })
                .description(description)
                .build()
        };

        let host = HostConfig::builder("test-host-01")
            .hostname("test01.app.dev.lgs01")
            .ttl(host_ttl)
            .interval_range(interval_range)
            .label("environment", "stage")
            .metric(sine("cpu_usage_percent", (1.0, 100.0), "%", "CPU usage percentage"))
            .metric(sine(
                "memory_usage_percent",
                (1.0, 100.0),
                "%",
                "Memory usage percentage",
            ))
            .metric(sine(
                "io_utilization_percent",
                (5.0, 100.0),
                "%",
                "IO utilization percentage",
            ))
            .build();

        MixerConfig::builder(vec![Arc::new(host)]).build()
    }
}
