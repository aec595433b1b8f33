//! HTTP-over-Unix-socket API surface.
//!
//! The daemon serves plain HTTP/1.1 on a filesystem socket. Peer
//! credentials are captured on accept and attached to every request, so
//! privileged operations can check the caller's uid. Binding takes care
//! of stale sockets left behind by a crashed predecessor: a live socket
//! refuses startup, a dead one is removed under an advisory file lock.

pub mod handlers;
pub mod models;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::connect_info;
use axum::routing::{any, get, post};
use axum::serve::IncomingStream;
use axum::Router;
use fs2::FileExt as _;
use nix::sys::stat::{umask, Mode};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::coordinator::Event;
use crate::state::SharedTrust;

/// Protocol version announced in `hello` events of the watch stream.
pub const WATCH_PROTOCOL_VERSION: &str = "20200714";

/// How long to probe an existing socket before treating it as stale.
const SOCKET_PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Shared state of the request handlers.
pub struct AppState {
    /// The trust state owner.
    pub trust: SharedTrust,
    /// Channel to the coordinator for reload requests.
    pub events: mpsc::Sender<Event>,
    /// Whether the build runs with its stock trust inputs.
    pub trusted: bool,
}

/// Shared handle to the handler state.
pub type SharedApp = Arc<AppState>;

/// Peer credentials of the requesting process, captured on accept.
#[derive(Debug, Clone)]
pub struct PeerCredentials {
    /// User id of the peer, when the platform provided it.
    pub uid: Option<u32>,
    /// Group id of the peer, when the platform provided it.
    pub gid: Option<u32>,
    /// Process id of the peer, when the platform provided it.
    pub pid: Option<i32>,
}

impl PeerCredentials {
    fn from_stream(stream: &UnixStream) -> Self {
        match stream.peer_cred() {
            Ok(cred) => Self {
                uid: Some(cred.uid()),
                gid: Some(cred.gid()),
                pid: cred.pid(),
            },
            Err(_) => Self {
                uid: None,
                gid: None,
                pid: None,
            },
        }
    }
}

impl connect_info::Connected<IncomingStream<'_, UnixListener>> for PeerCredentials {
    fn connect_info(stream: IncomingStream<'_, UnixListener>) -> Self {
        Self::from_stream(stream.io())
    }
}

/// Builds the API router.
#[must_use]
pub fn router(app: SharedApp) -> Router {
    Router::new()
        .route("/health-check", any(handlers::health_check))
        .route("/reload", post(handlers::reload))
        .route("/api/v1/claims-gen", get(handlers::claims_gen))
        .route("/api/v1/claims", get(handlers::claims))
        .route("/api/v1/claims/kopano/products", get(handlers::products))
        .route("/api/v1/claims/watch", get(handlers::watch))
        .with_state(app)
}

/// Binds the API socket, clearing a stale predecessor if necessary.
///
/// An existing socket path is probed with a bounded connect. A living
/// daemon on the other end makes the bind fail; a refused connection
/// means the socket is stale and gets removed under an exclusive advisory
/// lock on a sibling `.lock` path. The bind itself happens under a
/// transient umask so the socket ends up read/write for everyone.
///
/// # Errors
///
/// Fails when another daemon owns the socket or the bind itself fails.
pub async fn bind_listen_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
    }

    if path.exists() {
        let probe =
            tokio::time::timeout(SOCKET_PROBE_TIMEOUT, UnixStream::connect(path)).await;
        match probe {
            Ok(Ok(_)) => {
                anyhow::bail!("socket {} is in use by a running daemon", path.display());
            }
            Ok(Err(_)) | Err(_) => takeover_stale_socket(path)?,
        }
    }

    let previous = umask(Mode::from_bits_truncate(0o111));
    let bound = UnixListener::bind(path);
    umask(previous);

    let listener =
        bound.with_context(|| format!("failed to bind socket {}", path.display()))?;
    info!(socket = %path.display(), "listening");
    Ok(listener)
}

/// Removes a stale socket and its lock file under an exclusive lock, so
/// two starting daemons cannot race each other through the unlink.
fn takeover_stale_socket(path: &Path) -> anyhow::Result<()> {
    let lock_path = PathBuf::from(format!("{}.lock", path.display()));
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
    lock_file
        .lock_exclusive()
        .with_context(|| format!("failed to lock {}", lock_path.display()))?;

    warn!(socket = %path.display(), "removing stale socket");
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(&lock_path);
    let _ = lock_file.unlock();
    Ok(())
}

/// Serves the API until the shutdown signal fires, then drains.
///
/// # Errors
///
/// Propagates fatal listener errors.
pub async fn serve(
    listener: UnixListener,
    app: SharedApp,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let service = router(app).into_make_service_with_connect_info::<PeerCredentials>();
    axum::serve(listener, service)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("http listener failed")
}
