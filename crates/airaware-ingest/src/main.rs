//! AirAware ingest daemon
//!
//! Wires the bus subscriber, pipeline workers, notifier, sweeper and the
//! control surface around one repository instance. Everything is
//! constructed here and passed by reference; there are no ambient
//! singletons.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use airaware_api::ApiState;
use airaware_core::stats::RuntimeStats;
use airaware_core::Config;
use airaware_ingest::{bus::BusSubscriber, pipeline::Pipeline, sweeper};
use airaware_notify::{AlertEvent, Notifier};
use airaware_observability::init_observability;
use airaware_store::{Repository, SqliteStore};

const EXIT_CONFIG: u8 = 2;
const EXIT_DATASTORE: u8 = 3;
const EXIT_BUS: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    init_observability(&config.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bus = %config.bus.url,
        topic = %config.bus.topic,
        "starting airaware ingest daemon"
    );

    // Datastore first: without it nothing can be acked anyway.
    let store = match SqliteStore::connect(&config.store.url).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "datastore unreachable at startup");
            return ExitCode::from(EXIT_DATASTORE);
        }
    };
    if let Err(e) = store.migrate().await {
        error!(error = %e, "datastore schema migration failed");
        return ExitCode::from(EXIT_DATASTORE);
    }
    let repo: Arc<dyn Repository> = Arc::new(store);

    let stats = Arc::new(RuntimeStats::new());

    // Notifier with its own worker pool and bounded queue.
    let notifier = match Notifier::from_config(&config, repo.clone(), stats.clone()) {
        Ok(notifier) => notifier,
        Err(e) => {
            error!(error = %e, "notifier configuration invalid");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let (notify_handle, notify_workers) =
        notifier.spawn(config.notify.queue_capacity, config.notify.workers);

    if config.notify.replay_unresolved {
        match repo.list_unresolved_alerts().await {
            Ok(alerts) => {
                info!(count = alerts.len(), "replaying unresolved alerts to notifier");
                for alert in &alerts {
                    if notify_handle.enqueue(AlertEvent::from(alert)).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => warn!(error = %e, "unresolved alert replay failed"),
        }
    }

    // Bus subscriber; its link state feeds the control surface.
    let (subscriber, bus_state) = match BusSubscriber::new(&config.bus) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "bus configuration invalid");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Control surface.
    let api_state = ApiState {
        repo: repo.clone(),
        stats: stats.clone(),
        bus_state,
    };
    let listener = match tokio::net::TcpListener::bind(&config.http.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.http.addr, error = %e, "control surface bind failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!(addr = %config.http.addr, "control surface listening");
    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, airaware_api::router(api_state)).await {
            error!(error = %e, "control surface exited");
        }
    });

    let cancel = CancellationToken::new();

    // Pipeline workers between the bus channel and the repository.
    let (message_tx, message_rx) = mpsc::channel(config.pipeline.channel_capacity);
    let pipeline = Pipeline::new(
        repo.clone(),
        notify_handle.clone(),
        config.thresholds.clone(),
        stats.clone(),
        config.pipeline.dedup_cooldown_secs,
    );
    let pipeline_workers = pipeline.spawn_workers(message_rx, config.pipeline.workers);

    let sweeper_task = tokio::spawn(sweeper::run(
        repo.clone(),
        stats.clone(),
        Duration::from_secs(config.pipeline.offline_after_secs),
        cancel.clone(),
    ));

    let (ready_tx, ready_rx) = oneshot::channel();
    let mut bus_task = tokio::spawn(subscriber.run(message_tx, ready_tx, cancel.clone()));

    // Hold startup until the first subscription ack; a bus task that
    // returns before that exhausted its initial backoff window.
    tokio::select! {
        _ = ready_rx => {}
        result = &mut bus_task => {
            error!(?result, "bus unreachable within the initial backoff window");
            return ExitCode::from(EXIT_BUS);
        }
        _ = shutdown_signal() => {
            info!("shutdown before bus came up");
            cancel.cancel();
            return ExitCode::SUCCESS;
        }
    }

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        result = &mut bus_task => warn!(?result, "bus subscriber exited unexpectedly"),
    }

    // Orderly drain: stop the bus (no new messages, unprocessed ones stay
    // unacked), let pipeline workers finish in-flight work, then give the
    // notifier its grace period.
    cancel.cancel();
    for worker in pipeline_workers {
        let _ = worker.await;
    }
    drop(pipeline);
    drop(notify_handle);

    let grace = Duration::from_secs(config.notify.drain_grace_secs);
    if tokio::time::timeout(grace, futures::future::join_all(notify_workers))
        .await
        .is_err()
    {
        warn!(
            grace_secs = grace.as_secs(),
            "notifier drain grace elapsed; remaining deliveries abandoned"
        );
    }

    let _ = sweeper_task.await;
    api_task.abort();
    info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
