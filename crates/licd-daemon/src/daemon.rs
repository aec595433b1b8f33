//! Daemon assembly: wires configuration, trust state, background tasks,
//! signal handling and the API listener together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use licd_core::jwks::KeySetFetcher;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::coordinator::{run_fetcher, Coordinator, Event};
use crate::server::{self, AppState};
use crate::state::{SharedTrust, TrustHandle};
use crate::USER_AGENT;

/// Capacity of the coordinator event queue.
const EVENT_QUEUE_CAPACITY: usize = 16;

/// How long task teardown may take after the listener drained.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the daemon until a termination signal arrives.
///
/// # Errors
///
/// Fails on socket bind problems and other startup errors; once the
/// listener is up, per-cycle errors are logged and survived.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    if config.insecure {
        warn!("insecure mode, TLS client connections are susceptible to man-in-the-middle attacks");
    }
    match &config.cert_pool {
        Some(pool) => info!(count = pool.len(), "loaded license root certificates"),
        None => info!("no license root certificates configured"),
    }
    if config.jwks_uris.is_empty() {
        warn!("no key set URIs configured, this is odd - development build?");
    } else {
        info!(uris = config.jwks_uris.len(), "key set URIs available");
    }
    if !config.trusted {
        warn!("customization detected, services might reject license information");
    }

    let trust: SharedTrust = Arc::new(TrustHandle::new());
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    // Bind first: a taken socket must fail startup before any task runs.
    let listener = server::bind_listen_socket(&config.listen_path).await?;

    let (settled_tx, settled_rx) = oneshot::channel();
    let fetcher_task: Option<JoinHandle<()>> = if config.jwks_uris.is_empty() {
        warn!("no key set URI is set, running in offline mode");
        let _ = settled_tx.send(());
        None
    } else {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .context("failed to build HTTP client")?;
        let fetcher = KeySetFetcher::new(config.jwks_uris.clone(), USER_AGENT, client)
            .context("failed to construct key set fetcher")?;
        Some(tokio::spawn(run_fetcher(
            trust.clone(),
            fetcher,
            events_tx.clone(),
            settled_tx,
        )))
    };

    let coordinator = Coordinator::new(
        trust.clone(),
        events_rx,
        config.licenses_path.clone(),
        config.sub.clone(),
        config.cert_pool,
        Some(Box::new(|| {
            info!("activating licensed services");
        })),
    );
    let coordinator_task = tokio::spawn(coordinator.run(settled_rx));

    // Signal wiring: SIGHUP rescans, SIGINT/SIGTERM shut down.
    let signal_trust = trust.clone();
    let signal_events = events_tx.clone();
    let signal_task = tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(sighup) => sighup,
            Err(err) => {
                error!(error = %err, "failed to register SIGHUP handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(err) => {
                error!(error = %err, "failed to register SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to register SIGTERM handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("received SIGHUP, triggering reload");
                    if signal_events.send(Event::Reload { ack: None }).await.is_err() {
                        return;
                    }
                }
                _ = sigint.recv() => {
                    warn!(signal = "SIGINT", "received signal");
                    signal_trust.request_shutdown();
                    return;
                }
                _ = sigterm.recv() => {
                    warn!(signal = "SIGTERM", "received signal");
                    signal_trust.request_shutdown();
                    return;
                }
            }
        }
    });

    // Readiness log, once the first commit landed.
    let ready_trust = trust.clone();
    let ready_insecure = config.insecure;
    let ready_trusted = config.trusted;
    tokio::spawn(async move {
        let mut ready = ready_trust.ready();
        if ready.wait_for(|ready| *ready).await.is_ok() {
            let offline = ready_trust.read().await.offline_effective();
            info!(
                insecure = ready_insecure,
                trusted = ready_trusted,
                offline,
                "ready"
            );
        }
    });

    let app = Arc::new(AppState {
        trust: trust.clone(),
        events: events_tx,
        trusted: config.trusted,
    });
    let serve_result = server::serve(listener, app, trust.subscribe_shutdown()).await;

    // The listener has drained; tear the background tasks down.
    info!("clean server shutdown start");
    trust.request_shutdown();
    let teardown = async {
        let _ = coordinator_task.await;
        if let Some(task) = fetcher_task {
            task.abort();
            let _ = task.await;
        }
        signal_task.abort();
        let _ = signal_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, teardown)
        .await
        .is_err()
    {
        warn!("task teardown exceeded the drain timeout");
    }

    if std::fs::remove_file(&config.listen_path).is_ok() {
        info!(socket = %config.listen_path.display(), "removed socket");
    }

    info!("daemon shutdown complete");
    serve_result
}
