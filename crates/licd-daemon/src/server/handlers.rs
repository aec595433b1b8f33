//! Request handlers of the API surface.

use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use licd_core::aggregate::aggregate_products;
use licd_core::claims::Claims;
use licd_core::gen::generate_claims;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::models::ProductsResponse;
use super::{PeerCredentials, SharedApp, WATCH_PROTOCOL_VERSION};
use crate::coordinator::{Event, RELOAD_ADMISSION_TIMEOUT};

/// How long the products endpoint waits for the first commit.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle interval after which the watch stream repeats its `hello`.
const WATCH_HEARTBEAT: Duration = Duration::from_secs(60);

/// Query parameters in arrival order, repeated keys included.
type RawParams = Query<Vec<(String, String)>>;

/// Serializes a response as indented JSON, the way clients of the old
/// surface expect it.
fn pretty_json<T: Serialize>(value: &T) -> Response {
    match serde_json::to_string_pretty(value) {
        Ok(mut body) => {
            body.push('\n');
            (
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }
        Err(err) => {
            error!(error = %err, "failed to encode JSON");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Liveness probe; 200 until shutdown tears the listener down.
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Triggers a rescan of the license folder and waits for it to complete.
///
/// Root only: the peer uid from the socket credentials must be 0.
pub async fn reload(
    State(app): State<SharedApp>,
    ConnectInfo(peer): ConnectInfo<PeerCredentials>,
) -> Response {
    let Some(uid) = peer.uid else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "no unix credentials in request\n",
        )
            .into_response();
    };
    if uid != 0 {
        debug!(remote_uid = uid, "rejected reload request");
        return (
            StatusCode::FORBIDDEN,
            "reload request must be sent as root\n",
        )
            .into_response();
    }
    info!(remote_uid = uid, remote_pid = ?peer.pid, "received reload request");

    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
    let admitted = app
        .events
        .send_timeout(
            Event::Reload { ack: Some(ack_tx) },
            RELOAD_ADMISSION_TIMEOUT,
        )
        .await;
    if admitted.is_err() {
        error!("timeout triggering reload");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "timeout triggering reload\n",
        )
            .into_response();
    }

    match ack_rx.await {
        Ok(()) => {
            debug!("reload request complete");
            StatusCode::OK.into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "reload failed\n").into_response(),
    }
}

/// Developer helper generating unsigned claims from query parameters.
pub async fn claims_gen(Query(params): RawParams) -> Response {
    match generate_claims(&params) {
        Ok(claims) => pretty_json(&claims),
        Err(err) => {
            error!(error = %err, "failed to generate claims");
            (StatusCode::BAD_REQUEST, format!("{err}\n")).into_response()
        }
    }
}

/// Returns the raw committed claim sets as a JSON array.
pub async fn claims(State(app): State<SharedApp>) -> Response {
    let snapshot = app.trust.read().await.claims().clone();
    let documents: Vec<&Claims> = snapshot.iter().map(|license| &license.claims).collect();
    pretty_json(&documents)
}

/// Returns the aggregated per-product view of the committed set.
///
/// Answers are delayed until the first commit so clients do not need
/// their own retry loop; after 30 seconds the wait gives up with a 503.
pub async fn products(
    State(app): State<SharedApp>,
    ConnectInfo(peer): ConnectInfo<PeerCredentials>,
    Query(params): RawParams,
) -> Response {
    let requested: HashSet<String> = params
        .iter()
        .filter(|(key, _)| key == "product")
        .map(|(_, value)| value.clone())
        .collect();
    let filter = if requested.is_empty() {
        None
    } else {
        Some(requested)
    };
    debug!(
        products = ?filter,
        remote_uid = ?peer.uid,
        remote_pid = ?peer.pid,
        "received claims products request"
    );

    let mut ready = app.trust.ready();
    let became_ready = tokio::time::timeout(READY_TIMEOUT, async {
        ready.wait_for(|ready| *ready).await.map(|_| ())
    })
    .await;
    if !matches!(became_ready, Ok(Ok(()))) {
        warn!("timeout while waiting for readiness in claims products request");
        return (StatusCode::SERVICE_UNAVAILABLE, "ready timeout reached\n").into_response();
    }

    let (snapshot, offline) = {
        let state = app.trust.read().await;
        (state.claims().clone(), state.offline_effective())
    };
    let products = aggregate_products(&snapshot, filter.as_ref());
    pretty_json(&ProductsResponse {
        trusted: app.trusted,
        offline,
        products,
    })
}

struct WatchState {
    updates: watch::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
    hello_sent: bool,
}

/// Streams claim set changes as server-sent events.
///
/// The stream opens with a `hello` carrying the protocol version, emits
/// `claims-updated` for every commit and repeats the `hello` after 60
/// idle seconds. It ends on disconnect or daemon shutdown.
pub async fn watch(
    State(app): State<SharedApp>,
    ConnectInfo(peer): ConnectInfo<PeerCredentials>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    info!(remote_uid = ?peer.uid, remote_pid = ?peer.pid, "claims watch started");

    let state = WatchState {
        updates: app.trust.subscribe_updates(),
        shutdown: app.trust.subscribe_shutdown(),
        hello_sent: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        if !state.hello_sent {
            state.hello_sent = true;
            return Some((Ok::<SseEvent, Infallible>(hello_event()), state));
        }

        let WatchState {
            mut updates,
            mut shutdown,
            hello_sent,
        } = state;

        let event = tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => None,
            changed = updates.changed() => match changed {
                Ok(()) => Some(Ok::<SseEvent, Infallible>(
                    SseEvent::default().event("claims-updated").data("true"),
                )),
                Err(_) => None,
            },
            () = tokio::time::sleep(WATCH_HEARTBEAT) => Some(Ok(hello_event())),
        };

        event.map(|event| {
            (
                event,
                WatchState {
                    updates,
                    shutdown,
                    hello_sent,
                },
            )
        })
    });

    Sse::new(stream)
}

fn hello_event() -> SseEvent {
    SseEvent::default().event("hello").data(WATCH_PROTOCOL_VERSION)
}
