use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use revive_service::config::Config;
use revive_service::logging::{ensure_log_error, init_logging};
use revive_service::metrics;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Hammers a set of cells with concurrent accesses while their values are reclaimed and
/// recovered in the background.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Reports all logs, transactions and metrics to local sinks instead of the console.
    #[arg(long)]
    instrumented: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let service_config = Config::get(cli.config.as_deref())?;

    let guard = if cli.instrumented {
        let logging_config = logging::Config {
            backtraces: true,
            sentry: true,
            tracing: true,
            metrics: true,
        };
        // SAFETY: we are still single-threaded, the runtime is only created below.
        unsafe { logging::init(logging_config)? }
    } else {
        // SAFETY: see above.
        unsafe { init_logging(&service_config) };
        if let Some(statsd) = &service_config.metrics.statsd {
            metrics::configure_statsd(
                &service_config.metrics.prefix,
                statsd.as_str(),
                service_config.metrics.custom_tags.clone(),
            )?;
        }
        logging::Guard {
            sentry: Some(sentry::init(sentry::ClientOptions {
                dsn: service_config.sentry_dsn.clone(),
                release: sentry::release_name!(),
                ..Default::default()
            })),
            ..Default::default()
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    let result = runtime.block_on(async move {
        if let Some(http_sink) = guard.http_sink {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = guard.udp_sink {
            tokio::spawn(udp_sink);
        }

        let result = perform_stresstest(service_config, workloads, cli.duration).await;
        drop(guard.sentry);
        result
    });

    if let Err(error) = &result {
        ensure_log_error(error);
    }
    result
}
