#![doc = include_str!("../README.md")]

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::config::{CliArgs, FetchConfig};
use cli::metered::MeteredExecutor;
use cli::telemetry::{init_telemetry, record_batch_duration, shutdown_telemetry};
use std::time::Instant;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use volley::{DispatchOptions, HttpExecutor, dispatch};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = FetchConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);
    println!("{config}");

    let caller = CancellationToken::new();
    tokio::spawn(shutdown_signal(caller.clone()));

    let executor = MeteredExecutor::new(
        HttpExecutor::default().with_error_for_status(config.error_for_status),
    );
    let mut options = DispatchOptions::new(executor)
        .with_caller_token(caller)
        .with_fail_fast(config.fail_fast);
    if let Some(timeout) = config.timeout {
        options = options.with_timeout_per_task(timeout);
    }

    let started = Instant::now();
    let outcome = dispatch(config.urls.clone(), config.max_concurrency, options).await;
    let elapsed = started.elapsed();
    record_batch_duration(elapsed.as_secs_f64() * 1_000.0);

    println!(
        "volley(max={}): {:.3}ms",
        config.max_concurrency,
        elapsed.as_secs_f64() * 1_000.0
    );

    let outcome = match outcome {
        Ok(responses) => {
            let statuses: Vec<u16> = responses.iter().map(|r| r.status.as_u16()).collect();
            println!("Statuses (order preserved): {statuses:?}");
            Ok(())
        }
        Err(err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Batch failed: {err}");
            Err(err).context("batch failed")
        }
    };

    shutdown_telemetry(providers);
    outcome
}

fn log_startup_info(_config: &FetchConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Fetching with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Fetching {} URLs with {} workers",
            _config.urls.len(),
            _config.max_concurrency
        );
    }
}

/// Cancels the batch on Ctrl+C or SIGTERM.
async fn shutdown_signal(caller: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Cancelling outstanding requests...");
    caller.cancel();
}
