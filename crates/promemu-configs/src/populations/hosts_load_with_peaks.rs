use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use promemu_core::error::ValidationError;
use promemu_core::events::{Event, EventBus, EventData, HandlerFn};
use promemu_core::hosts::HostConfig;
use promemu_core::metrics::{MetricConfig, MetricContext, MetricType};
use promemu_core::mixer::MixerConfig;
use promemu_core::scenarios::{self, CalcFn, EventScenarioEntry, ScenarioSpec, Trend};

use crate::{HostPopulation, PopulationOverrides};

pub const NAME: &str = "hosts_load_with_peaks";

const HOSTS_COUNT: usize = 10;
const HOSTS_TTL_SEC: f64 = 1800.0;
const HOSTS_INTERVAL_RANGE: (f64, f64) = (14.0, 16.0);
const METRICS_INTERVAL_SEC: f64 = 10.0;

/// A literal size string known to parse; panics only on a typo in this file.
fn bytes(size: &str) -> f64 {
    scenarios::size_to_bytes(size).expect("literal size string must parse")
}

fn relay_handler(target: &'static str, source: &'static str) -> HandlerFn {
    Arc::new(move |event: Event, bus: EventBus| {
        Box::pin(async move {
            bus.emit(target, EventData::Forwarded(Box::new(event.data)), source).await;
        })
    })
}

fn workers_count_calc() -> HashMap<String, CalcFn> {
    let mut events_config: HashMap<String, CalcFn> = HashMap::new();
    events_config.insert(
        "host_started".to_string(),
        Arc::new(|ctx: &MetricContext| -> Result<Option<f64>, ValidationError> {
            Ok(Some(ctx.value.unwrap_or(0.0) + 1.0))
        }),
    );
    events_config.insert(
        "host_stopped".to_string(),
        Arc::new(|ctx: &MetricContext| -> Result<Option<f64>, ValidationError> {
            Ok(Some(ctx.value.map(|v| v - 1.0).unwrap_or(0.0)))
        }),
    );
    events_config
}

fn io_ops_calc() -> CalcFn {
    Arc::new(|ctx: &MetricContext| -> Result<Option<f64>, ValidationError> {
        Ok(ctx.value.map(|v| v * 100.0))
    })
}

/// A balancer host driving load peaks and ten worker hosts whose metrics
/// react to `peak_load_start`/`peak_load_end`. The richest of the two
/// populations: trend-driven gauges, relayed percentages, event-counted
/// worker gauges, and an uptime timer.
pub struct HostsLoadWithPeaks;

impl HostPopulation for HostsLoadWithPeaks {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "a balancer host driving load peaks across N worker hosts"
    }

    fn build(&self, overrides: &PopulationOverrides) -> MixerConfig {
        let hosts_count = overrides.hosts_count.unwrap_or(HOSTS_COUNT);
        let hosts_ttl = overrides.host_ttl.unwrap_or(HOSTS_TTL_SEC);
        let interval_range = overrides.host_interval_range.unwrap_or(HOSTS_INTERVAL_RANGE);
        let metrics_interval = overrides.metrics_interval.unwrap_or(METRICS_INTERVAL_SEC);
        let split_jobs = overrides.split_jobs.unwrap_or(false);

        let job_name = "hosts_load_peaks".to_string();
        let job_for = |suffix: &str| {
            if split_jobs {
                format!("{job_name}_{suffix}")
            } else {
                job_name.clone()
            }
        };

        let balancer = HostConfig::builder("balancer-1")
            .hostname("stress.balancer.node01.test.stage")
            .job_name(job_for("balancer"))
            .ttl(hosts_ttl)
            .interval_range(interval_range)
            .label("environment", "stage")
            .listen_event("feature_on", relay_handler("peak_load_start", "balancer-1"))
            .listen_event("feature_off", relay_handler("peak_load_end", "balancer-1"))
            .metric(
                MetricConfig::builder("heavy_task_active", MetricType::Gauge)
                    .value_range((0.0, 1.0))
                    .update_interval(metrics_interval)
                    .scenario(ScenarioSpec::FeatureToggle {
                        start_time: 60.0,
                        duration: 90.0,
                        interval: 30.0,
                        on_value: 1.0,
                        off_value: 0.0,
                        source: Some("balancer-1".to_string()),
                    })
                    .description("Heavy computational task status (0=off, 1=on)")
                    .build(),
            )
            .build();

        let mut hosts = vec![Arc::new(balancer)];
        let mut rng = rand::thread_rng();

        for i in 1..=hosts_count {
            let worker_name = format!("worker-{i:02}");

            let cpu = MetricConfig::builder("cpu_usage_percent", MetricType::Gauge)
                .value_range((0.0, 100.0))
                .units("%")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .scenario(ScenarioSpec::SwitchScenarioByEvents {
                    default_scenario: Some(Box::new(ScenarioSpec::RandomInRange {
                        value_range: Some((5.0, 25.0)),
                    })),
                    events_config: HashMap::from([
                        (
                            "peak_load_start".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::RandomInRange {
                                    value_range: Some((75.0, 100.0)),
                                }),
                                duration: None,
                            },
                        ),
                        (
                            "peak_load_end".to_string(),
                            EventScenarioEntry {
                                scenario: None,
                                duration: None,
                            },
                        ),
                    ]),
                })
                .description("CPU usage percentage")
                .build();

            let memory_bytes = MetricConfig::builder("memory_usage_bytes", MetricType::Gauge)
                .value_range((bytes("1Gb"), bytes("16Gb")))
                .init_value(bytes("3Gb"))
                .units("bytes")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .scenario(ScenarioSpec::SwitchScenarioByEvents {
                    default_scenario: Some(Box::new(ScenarioSpec::UpdateByTrend {
                        trend: Trend::Hold,
                        step_range: (bytes("50Mb"), bytes("300Mb")),
                    })),
                    events_config: HashMap::from([
                        (
                            "peak_load_start".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::UpdateByTrend {
                                    trend: Trend::Up,
                                    step_range: (bytes("100Mb"), bytes("1Gb")),
                                }),
                                duration: None,
                            },
                        ),
                        (
                            "peak_load_end".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::UpdateByTrend {
                                    trend: Trend::Down,
                                    step_range: (bytes("500Mb"), bytes("1Gb")),
                                }),
                                duration: Some(35.0),
                            },
                        ),
                    ]),
                })
                .description("Memory usage in bytes")
                .build();

            let memory_percent = MetricConfig::builder("memory_usage_percent", MetricType::Gauge)
                .value_range((0.0, 100.0))
                .units("%")
                .update_interval(metrics_interval)
                .linked_metrics(["memory_usage_bytes"])
                .scenario(ScenarioSpec::RelayToOtherMetric {
                    source_metric_name: "memory_usage_bytes".to_string(),
                    calc_function: Arc::new(scenarios::calc_percent_usage),
                })
                .description("Memory usage percentage")
                .build();

            let disk_bytes = MetricConfig::builder("disk_usage_bytes", MetricType::Gauge)
                .value_range((bytes("100Gb"), bytes("200Gb")))
                .init_value(bytes("100.5Gb"))
                .units("bytes")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .scenario(ScenarioSpec::SwitchScenarioByEvents {
                    default_scenario: Some(Box::new(ScenarioSpec::UpdateByTrend {
                        trend: Trend::Hold,
                        step_range: (bytes("50Mb"), bytes("100Mb")),
                    })),
                    events_config: HashMap::from([
                        (
                            "peak_load_start".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::UpdateByTrend {
                                    trend: Trend::Up,
                                    step_range: (bytes("1Gb"), bytes("3Gb")),
                                }),
                                duration: None,
                            },
                        ),
                        (
                            "peak_load_end".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::UpdateByTrend {
                                    trend: Trend::Down,
                                    step_range: (bytes("1Gb"), bytes("3Gb")),
                                }),
                                duration: Some(60.0),
                            },
                        ),
                    ]),
                })
                .description("Disk usage in bytes")
                .build();

            let disk_percent = MetricConfig::builder("disk_usage_percent", MetricType::Gauge)
                .value_range((0.0, 100.0))
                .units("%")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .linked_metrics(["disk_usage_bytes"])
                .scenario(ScenarioSpec::RelayToOtherMetric {
                    source_metric_name: "disk_usage_bytes".to_string(),
                    calc_function: Arc::new(scenarios::calc_percent_usage),
                })
                .description("Disk usage percentage")
                .build();

            let io_util = MetricConfig::builder("io_utilization_percent", MetricType::Gauge)
                .value_range((0.0, 100.0))
                .units("%")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .scenario(ScenarioSpec::SwitchScenarioByEvents {
                    default_scenario: Some(Box::new(ScenarioSpec::RandomInRange {
                        value_range: Some((5.0, 30.0)),
                    })),
                    events_config: HashMap::from([
                        (
                            "peak_load_start".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::RandomInRange {
                                    value_range: Some((50.0, 100.0)),
                                }),
                                duration: None,
                            },
                        ),
                        (
                            "peak_load_end".to_string(),
                            EventScenarioEntry {
                                scenario: None,
                                duration: None,
                            },
                        ),
                    ]),
                })
                .description("IO utilization percentage")
                .build();

            let io_ops = MetricConfig::builder("io_operations_per_second", MetricType::Gauge)
                .value_range((1_000.0, 10_000.0))
                .units("ops")
                .update_interval(metrics_interval)
                .linked_metrics(["io_utilization_percent"])
                .scenario(ScenarioSpec::RelayToOtherMetric {
                    source_metric_name: "io_utilization_percent".to_string(),
                    calc_function: io_ops_calc(),
                })
                .description("IO operations per second")
                .build();

            let network_speed = MetricConfig::builder("network_speed_mbps", MetricType::Gauge)
                .value_range((bytes("1Mbit"), bytes("100Mbit")))
                .init_value(bytes("500Kbit"))
                .units("Mbps")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .scenario(ScenarioSpec::SwitchScenarioByEvents {
                    default_scenario: Some(Box::new(ScenarioSpec::RandomInRange {
                        value_range: Some((bytes("1Mbit"), bytes("10Mbit"))),
                    })),
                    events_config: HashMap::from([
                        (
                            "peak_load_start".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::RandomInRange {
                                    value_range: Some((bytes("5Mbit"), bytes("100Mbit"))),
                                }),
                                duration: None,
                            },
                        ),
                        (
                            "peak_load_end".to_string(),
                            EventScenarioEntry {
                                scenario: None,
                                duration: None,
                            },
                        ),
                    ]),
                })
                .description("Network speed in Mbps")
                .build();

            let packet_loss = MetricConfig::builder("network_packet_loss_percent", MetricType::Gauge)
                .value_range((0.0, 100.0))
                .units("%")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .scenario(ScenarioSpec::SwitchScenarioByEvents {
                    default_scenario: Some(Box::new(ScenarioSpec::RandomInRange {
                        value_range: Some((0.0, 3.0)),
                    })),
                    events_config: HashMap::from([
                        (
                            "peak_load_start".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::RandomInRange {
                                    value_range: Some((0.5, 25.0)),
                                }),
                                duration: None,
                            },
                        ),
                        (
                            "peak_load_end".to_string(),
                            EventScenarioEntry {
                                scenario: None,
                                duration: None,
                            },
                        ),
                    ]),
                })
                .description("Network packet loss percentage")
                .build();

            let latency = MetricConfig::builder("network_latency_ms", MetricType::Gauge)
                .value_range((0.0, 10_000.0))
                .units("ms")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .scenario(ScenarioSpec::SwitchScenarioByEvents {
                    default_scenario: Some(Box::new(ScenarioSpec::RandomInRange {
                        value_range: Some((10.0, 150.0)),
                    })),
                    events_config: HashMap::from([
                        (
                            "peak_load_start".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::RandomInRange {
                                    value_range: Some((150.0, 1_200.0)),
                                }),
                                duration: None,
                            },
                        ),
                        (
                            "peak_load_end".to_string(),
                            EventScenarioEntry {
                                scenario: None,
                                duration: None,
                            },
                        ),
                    ]),
                })
                .description("Network latency in milliseconds")
                .build();

            let gpu_memory_bytes = MetricConfig::builder("gpu_memory_usage_bytes", MetricType::Gauge)
                .value_range((bytes("500Mb"), bytes("8Gb")))
                .init_value(bytes("1Gb"))
                .units("bytes")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .scenario(ScenarioSpec::SwitchScenarioByEvents {
                    default_scenario: Some(Box::new(ScenarioSpec::UpdateByTrend {
                        trend: Trend::Hold,
                        step_range: (bytes("50Mb"), bytes("200Mb")),
                    })),
                    events_config: HashMap::from([
                        (
                            "peak_load_start".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::UpdateByTrend {
                                    trend: Trend::Up,
                                    step_range: (bytes("50Mb"), bytes("500Mb")),
                                }),
                                duration: None,
                            },
                        ),
                        (
                            "peak_load_end".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::UpdateByTrend {
                                    trend: Trend::Down,
                                    step_range: (bytes("50Mb"), bytes("500Mb")),
                                }),
                                duration: Some(65.0),
                            },
                        ),
                    ]),
                })
                .description("GPU memory usage in bytes")
                .build();

            let gpu_memory_percent = MetricConfig::builder("gpu_memory_usage_percent", MetricType::Gauge)
                .value_range((0.0, 100.0))
                .units("%")
                .update_interval(metrics_interval)
                .linked_metrics(["gpu_memory_usage_bytes"])
                .scenario(ScenarioSpec::RelayToOtherMetric {
                    source_metric_name: "gpu_memory_usage_bytes".to_string(),
                    calc_function: Arc::new(scenarios::calc_percent_usage),
                })
                .description("GPU memory usage percentage")
                .build();

            let gpu_usage = MetricConfig::builder("gpu_usage_percent", MetricType::Gauge)
                .value_range((0.0, 100.0))
                .units("%")
                .update_interval(metrics_interval)
                .listen_events(["peak_load_start", "peak_load_end"])
                .scenario(ScenarioSpec::SwitchScenarioByEvents {
                    default_scenario: Some(Box::new(ScenarioSpec::RandomInRange {
                        value_range: Some((1.0, 25.0)),
                    })),
                    events_config: HashMap::from([
                        (
                            "peak_load_start".to_string(),
                            EventScenarioEntry {
                                scenario: Some(ScenarioSpec::RandomInRange {
                                    value_range: Some((20.0, 100.0)),
                                }),
                                duration: None,
                            },
                        ),
                        (
                            "peak_load_end".to_string(),
                            EventScenarioEntry {
                                scenario: None,
                                duration: None,
                            },
                        ),
                    ]),
                })
                .description("GPU usage percentage")
                .build();

            let workers_count = MetricConfig::builder("workers_count", MetricType::Gauge)
                .value_range((0.0, f64::INFINITY))
                .units("unit")
                .update_interval(metrics_interval)
                .listen_events(["host_started", "host_stopped"])
                .scenario(ScenarioSpec::CalcByEvent {
                    events_config: workers_count_calc(),
                })
                .description("Number of active workers")
                .build();

            let uptime = MetricConfig::builder("workers_uptime_seconds", MetricType::Gauge)
                .value_range((0.0, f64::INFINITY))
                .units("seconds")
                .update_interval(metrics_interval)
                .scenario(ScenarioSpec::TimeDuration)
                .description("Uptime of worker in seconds")
                .build();

            let start_time = (rng.gen_range(0.0..45.0) * 100.0).round() / 100.0;

            let worker = HostConfig::builder(&worker_name)
                .hostname(format!("stress.{worker_name}.test.stage"))
                .job_name(job_for(&format!("{i:02}")))
                .start_time(start_time)
                .ttl(hosts_ttl)
                .interval_range(interval_range)
                .label("environment", "stage")
                .metric(cpu)
                .metric(memory_bytes)
                .metric(memory_percent)
                .metric(disk_bytes)
                .metric(disk_percent)
                .metric(io_util)
                .metric(io_ops)
                .metric(network_speed)
                .metric(packet_loss)
                .metric(latency)
                .metric(gpu_memory_bytes)
                .metric(gpu_memory_percent)
                .metric(gpu_usage)
                .metric(workers_count)
                .metric(uptime)
                .build();

            hosts.push(Arc::new(worker));
        }

        MixerConfig::builder(hosts).build()
    }
}
