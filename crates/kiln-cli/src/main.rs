//! kiln — the continuous-integration scheduler daemon.
//!
//! Wires the pieces together: configuration, logging, the sqlite task
//! store, the project registry, the zeromq endpoints and the scheduler.
//! Exits 0 after an orderly stop (SIGINT/SIGTERM) and 1 on any
//! configuration or startup failure.

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use kiln_core::endpoint::{RunnerEndpoint, ZmqEventPublisher};
use kiln_core::project::ProjectRegistry;
use kiln_core::queue::TaskQueue;
use kiln_core::scheduler::{self, DispatcherEvent, Scheduler};
use kiln_core::store::SqliteTaskStore;
use kiln_kernel::config::{self, CoreConfig};
use kiln_kernel::cron::SystemClock;

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let config = config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.logging.level.as_filter()))
        .init();

    let runtime = tokio::runtime::Runtime::new().context("starting the async runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: CoreConfig) -> anyhow::Result<()> {
    let store = Arc::new(
        SqliteTaskStore::open(&config.database)
            .await
            .with_context(|| format!("opening task store {}", config.database.display()))?,
    );

    let registry = Arc::new(ProjectRegistry::from_config(&config));
    if registry.is_empty() {
        tracing::warn!("no usable projects configured");
    }

    let queue = TaskQueue::restore(store)
        .await
        .context("restoring the task queue")?;

    let publisher = ZmqEventPublisher::bind(&config.core.events)
        .await
        .with_context(|| format!("binding event publisher to {}", config.core.events))?;
    let endpoint = RunnerEndpoint::bind(&config.core.endpoint)
        .await
        .with_context(|| format!("binding runner endpoint to {}", config.core.endpoint))?;

    let (sender, events) = scheduler::channel();
    tokio::spawn(endpoint.serve(sender.clone()));
    tokio::spawn(signal_listener(sender.clone()));

    let scheduler = Scheduler::new(registry, queue, Box::new(publisher), Arc::new(SystemClock));
    scheduler.run(sender, events).await;

    Ok(())
}

/// Turn SIGINT/SIGTERM into an orderly stop request.
async fn signal_listener(dispatcher: mpsc::Sender<DispatcherEvent>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "could not install SIGINT handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "could not install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => tracing::info!("received SIGINT"),
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
    }

    let _ = dispatcher.send(DispatcherEvent::Stop).await;
}
