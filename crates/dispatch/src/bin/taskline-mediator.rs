//! taskline-mediator: tracks runner capacity and tells applications where
//! to run their tasks.
//!
//! # Usage
//!
//! ```bash
//! # Settings from taskline.toml, TLS identity from [tls]
//! taskline-mediator --config /etc/taskline/taskline.toml
//!
//! # Override the listen address
//! taskline-mediator --config taskline.toml --listen 0.0.0.0:7500
//!
//! # Via environment variables
//! TASKLINE_CONFIG=taskline.toml TASKLINE_MEDIATOR_LISTEN=0.0.0.0:7500 taskline-mediator
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use taskline_dispatch::{Mediator, RunnerPool, TasklineConfig};
use taskline_link::TlsListener;

/// Runner-selection broker for taskline.
#[derive(Parser, Debug)]
#[command(name = "taskline-mediator", version, about)]
struct Cli {
    /// Path to taskline.toml.
    #[arg(long, env = "TASKLINE_CONFIG")]
    config: PathBuf,

    /// Listen address, overriding `mediator.listen`.
    #[arg(long)]
    listen: Option<String>,

    /// Seconds between runner pool summaries (0 = disabled), overriding
    /// `mediator.report_interval_secs`.
    #[arg(long)]
    report_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting taskline-mediator");

    let mut config = TasklineConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.mediator.listen = listen;
    }
    if let Some(interval) = cli.report_interval {
        config.mediator.report_interval_secs = interval;
    }

    let identity = config.server_identity().context("loading TLS identity")?;
    let listener = TlsListener::bind(&config.mediator.listen, &identity, config.link.clone())
        .await
        .with_context(|| format!("binding {}", config.mediator.listen))?;

    let mediator = Mediator::new(Arc::new(RunnerPool::new()));
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    if config.mediator.report_interval_secs > 0 {
        let mediator = mediator.clone();
        let every = Duration::from_secs(config.mediator.report_interval_secs);
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let runners = mediator.snapshot();
                tracing::info!(runners = runners.len(), "runner pool");
                for runner in &runners {
                    tracing::debug!(
                        runner = %runner.id,
                        endpoint = %runner.endpoint,
                        state = %runner.state,
                        active = runner.active_tasks,
                        max_tasks = runner.max_tasks,
                        queued = runner.queue_length,
                        "runner"
                    );
                }
            }
        });
    }

    mediator.serve(listener, shutdown).await?;

    tracing::info!("taskline-mediator exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable, waiting for ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
        }
    }
}
