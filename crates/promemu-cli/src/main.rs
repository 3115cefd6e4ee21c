mod args;

use std::path::Path;
use std::time::Duration;

use clap::Parser;
use promemu_core::clock::Clock;
use promemu_core::events::EventBus;
use promemu_core::mixer::{Mixer, MixerStatus};
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter, EnvFilter, Layer};

use args::Args;

const APP_NAME: &str = "Prometheus Metrics Emulator (PromEmu)";
const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "promemu";

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = enable_logging(&args);
    debug!("{args:?}");

    let population = match promemu_configs::load_population(args.population.name()) {
        Ok(population) => population,
        Err(err) => {
            error!(%err, "failed to load population");
            std::process::exit(1);
        }
    };

    let mut mixer_config = population.build(&args.overrides());
    mixer_config.pushgateway_url = args.pushgateway_url.clone();
    mixer_config.push_interval = args.push_interval;
    mixer_config.cleanup_on_start = !args.no_cleanup_on_start;
    mixer_config.cleanup_on_finish = !args.no_cleanup_on_finish;

    let hosts_count = mixer_config.hosts.len();
    let bus = EventBus::new();
    let clock = Clock::System;

    let mixer = match Mixer::new(mixer_config, bus, clock).await {
        Ok(mixer) => mixer,
        Err(err) => {
            error!(%err, "failed to build mixer");
            std::process::exit(1);
        }
    };

    info!("{}", "-".repeat(40));
    info!("Starting {APP_NAME}");
    info!("Population: <{}>, hosts: <{hosts_count}>", population.name());
    info!("Pushgateway URL: <{}>", args.pushgateway_url);
    info!("Press Ctrl+C to stop");
    info!("{}", "-".repeat(40));

    let status_mixer = mixer.clone();
    let status_interval = args.status_interval;
    let show_hosts_status = args.show_hosts_status;
    let show_metrics_status = args.show_metrics_status;
    let status_task = tokio::spawn(async move {
        status_reporter(status_mixer, status_interval, show_hosts_status, show_metrics_status).await;
    });

    let run_mixer = mixer.clone();
    let run_task = tokio::spawn(async move { run_mixer.run_until_complete().await });

    tokio::select! {
        _ = run_task => {
            info!("emulation finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, stopping");
            mixer.stop().await;
        }
    }

    status_task.abort();
    info!("emulation finished");
}

async fn status_reporter(mixer: Mixer, interval: f64, show_hosts: bool, show_metrics: bool) {
    let interval = Duration::from_secs_f64(interval.max(1.0));
    loop {
        tokio::time::sleep(interval).await;
        if !mixer.is_running().await {
            break;
        }

        let status = mixer.status().await;
        info!("--- Status Report ---");
        info!(
            "{}",
            if status.is_running { "Running" } else { "Stopped" }
        );
        info!("Hosts: <{}/{}> active", status.active_hosts, status.total_hosts);
        if show_hosts {
            log_hosts_status(&status);
        }
        if show_metrics {
            match serde_json::to_string_pretty(&status) {
                Ok(json) => info!("Status: {json}"),
                Err(err) => error!(%err, "failed to serialize mixer status"),
            }
        }
        info!("{}", "-".repeat(30));
    }
}

fn log_hosts_status(status: &MixerStatus) {
    for (job, job_status) in &status.jobs {
        info!(
            "job <{job}>: {} hosts, {} metrics, hosts: {:?}",
            job_status.hosts_count, job_status.metrics_count, job_status.host_names
        );
        for host in &job_status.hosts {
            info!(
                "  host <{}>: {:?}, start_delay={}s, uptime={}s, ttl_remaining={:?}, metrics={}",
                host.name, host.run_state, host.start_delay, host.uptime, host.ttl_remaining, host.metrics_count
            );
        }
    }
}

/// Builds a compact console layer plus a daily-rolling file layer, replacing
/// the original's colored-console/rotating-gzip-file logger pair. Returns
/// the file appender's flush guard, which must stay alive for the process's
/// lifetime.
fn enable_logging(args: &Args) -> tracing_appender::non_blocking::WorkerGuard {
    let verbosity = match (args.quiet, args.verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.to_string()));
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(console_filter);

    if let Err(err) = std::fs::create_dir_all(Path::new(LOG_DIR)) {
        eprintln!("warning: failed to create log directory '{LOG_DIR}': {err}");
    }
    let file_appender = tracing_appender::rolling::daily(LOG_DIR, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_filter = filter::Targets::new().with_default(verbosity);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_filter(file_filter);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}
