use clap::{Parser, ValueEnum};
use promemu_configs::PopulationOverrides;

/// Emulates a population of hosts and pushes their metrics to a Prometheus
/// Pushgateway.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Prometheus Metrics Emulator (PromEmu)")]
pub struct Args {
    /// Host population to emulate
    #[clap(
        value_enum,
        short = 'P',
        long,
        value_name = "POPULATION",
        env = "PME_POPULATION"
    )]
    pub population: PopulationArg,

    /// Pushgateway URL
    #[clap(
        long,
        value_name = "URL",
        env = "PME_PUSHGATEWAY_URL",
        default_value = "http://localhost:9091"
    )]
    pub pushgateway_url: String,

    /// How often (in seconds) to push metrics to the gateway
    #[clap(
        long,
        value_name = "SECONDS",
        env = "PME_PUSH_INTERVAL",
        default_value_t = 15.0
    )]
    pub push_interval: f64,

    /// Skip deleting this population's stale jobs from the gateway on startup
    #[clap(long, env = "PME_NO_CLEANUP_ON_START", default_value_t = false)]
    pub no_cleanup_on_start: bool,

    /// Skip deleting this population's jobs from the gateway on shutdown
    #[clap(long, env = "PME_NO_CLEANUP_ON_FINISH", default_value_t = false)]
    pub no_cleanup_on_finish: bool,

    /// Log a per-host running/stopped summary in the status report
    #[clap(long, env = "PME_SHOW_HOSTS_STATUS", default_value_t = true)]
    pub show_hosts_status: bool,

    /// Log the full per-job metrics snapshot in the status report
    #[clap(long, env = "PME_SHOW_METRICS_STATUS", default_value_t = false)]
    pub show_metrics_status: bool,

    /// How often (in seconds) to log a status report
    #[clap(
        long,
        value_name = "SECONDS",
        env = "PME_STATUS_INTERVAL",
        default_value_t = 30.0
    )]
    pub status_interval: f64,

    /// Number of hosts to emulate, if the population supports overriding it
    #[clap(long, value_name = "N", env = "PME_HOSTS_COUNT")]
    pub hosts_count: Option<usize>,

    /// Split each host into its own Pushgateway job instead of one shared job
    #[clap(long, env = "PME_SPLIT_JOBS", default_value_t = false)]
    pub split_jobs: bool,

    /// Keep quiet and only log errors
    #[clap(short, long, conflicts_with = "verbose", default_value_t = false)]
    pub quiet: bool,

    #[clap(
        short = 'v',
        long,
        conflicts_with = "quiet",
        action = clap::ArgAction::Count,
        help = "Output more detail about scenario evaluation and bus dispatch; specify multiple times for more detail"
    )]
    pub verbose: u8,
}

impl Args {
    pub fn overrides(&self) -> PopulationOverrides {
        PopulationOverrides {
            hosts_count: self.hosts_count,
            host_ttl: None,
            host_interval_range: None,
            metrics_interval: None,
            split_jobs: Some(self.split_jobs),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum PopulationArg {
    #[value(name = "single-host-load")]
    SingleHostLoad,
    #[value(name = "hosts-load-with-peaks")]
    HostsLoadWithPeaks,
}

impl PopulationArg {
    pub fn name(self) -> &'static str {
        match self {
            PopulationArg::SingleHostLoad => promemu_configs::populations::single_host_load::NAME,
            PopulationArg::HostsLoadWithPeaks => promemu_configs::populations::hosts_load_with_peaks::NAME,
        }
    }
}
