//! Test harness: a fully wired daemon on a scratch directory.
//!
//! The harness runs the real coordinator, fetcher and Unix-socket
//! listener against temporary paths, so tests drive the daemon exactly
//! the way co-located processes do. The coordinator event channel is
//! exposed so tests can force a rescan without waiting for the timer.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::Signer as _;
use licd_core::certpool::CertificatePool;
use licd_core::jwks::{Jwk, KeySet, KeySetFetcher};
use licd_daemon::client::{self, UdsResponse};
use licd_daemon::coordinator::{run_fetcher, Coordinator, Event};
use licd_daemon::server::{self, AppState};
use licd_daemon::state::{SharedTrust, TrustHandle};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A signing authority for test licenses.
pub struct TestAuthority {
    key: ed25519_dalek::SigningKey,
    pub kid: String,
}

impl TestAuthority {
    pub fn new(kid: &str) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(&[51u8; 32]),
            kid: kid.to_string(),
        }
    }

    /// The JWK set document the authority would publish.
    pub fn jwks_body(&self) -> String {
        serde_json::to_string(&KeySet {
            keys: vec![Jwk {
                kty: "OKP".into(),
                kid: self.kid.clone(),
                crv: "Ed25519".into(),
                x: URL_SAFE_NO_PAD.encode(self.key.verifying_key().to_bytes()),
                ..Jwk::default()
            }],
        })
        .unwrap()
    }

    /// Signs a claim set into a compact token.
    pub fn sign(&self, claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&serde_json::json!({"alg": "EdDSA", "kid": self.kid})).unwrap(),
        );
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        let signing_input = format!("{header}.{payload}");
        let signature = self.key.sign(signing_input.as_bytes());
        format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }
}

/// Claims valid around the current wall clock.
pub fn valid_claims(jti: &str, uid: &str, products: serde_json::Value) -> serde_json::Value {
    let now = chrono::Utc::now().timestamp();
    serde_json::json!({
        "sub": "cust-A",
        "jti": jti,
        "iat": now - 60,
        "nbf": now - 60,
        "exp": 2_000_000_000u64,
        "uid": uid,
        "k": {"v": 0, "products": products},
    })
}

#[derive(Default)]
pub struct DaemonOptions {
    pub jwks_uris: Vec<url::Url>,
    pub cert_pool: Option<CertificatePool>,
    pub sub: String,
    pub trusted: bool,
}

/// A running daemon instance on temporary paths.
pub struct TestDaemon {
    pub trust: SharedTrust,
    pub events: mpsc::Sender<Event>,
    pub socket: PathBuf,
    pub licenses_dir: PathBuf,
    tasks: Vec<JoinHandle<()>>,
    _scratch: TempDir,
}

impl TestDaemon {
    pub async fn start(options: DaemonOptions) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let licenses_dir = scratch.path().join("licenses");
        std::fs::create_dir(&licenses_dir).unwrap();
        let socket = scratch.path().join("api.sock");

        let trust: SharedTrust = Arc::new(TrustHandle::new());
        let (events_tx, events_rx) = mpsc::channel(16);
        let mut tasks = Vec::new();

        let (settled_tx, settled_rx) = oneshot::channel();
        if options.jwks_uris.is_empty() {
            let _ = settled_tx.send(());
        } else {
            let fetcher = KeySetFetcher::new(
                options.jwks_uris.clone(),
                "licd-test",
                reqwest::Client::new(),
            )
            .unwrap();
            tasks.push(tokio::spawn(run_fetcher(
                trust.clone(),
                fetcher,
                events_tx.clone(),
                settled_tx,
            )));
        }

        let coordinator = Coordinator::new(
            trust.clone(),
            events_rx,
            licenses_dir.clone(),
            options.sub.clone(),
            options.cert_pool,
            None,
        );
        tasks.push(tokio::spawn(coordinator.run(settled_rx)));

        let listener = server::bind_listen_socket(&socket).await.unwrap();
        let app = Arc::new(AppState {
            trust: trust.clone(),
            events: events_tx.clone(),
            trusted: options.trusted,
        });
        let shutdown = trust.subscribe_shutdown();
        tasks.push(tokio::spawn(async move {
            let _ = server::serve(listener, app, shutdown).await;
        }));

        Self {
            trust,
            events: events_tx,
            socket,
            licenses_dir,
            tasks,
            _scratch: scratch,
        }
    }

    /// Waits until the first commit closed the readiness gate.
    pub async fn wait_ready(&self) {
        let mut ready = self.trust.ready();
        tokio::time::timeout(Duration::from_secs(10), ready.wait_for(|ready| *ready))
            .await
            .expect("daemon did not become ready")
            .unwrap();
    }

    /// Forces a rescan and waits for its completion.
    pub async fn force_rescan(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.events
            .send(Event::Reload { ack: Some(ack_tx) })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), ack_rx)
            .await
            .expect("rescan was not acked")
            .unwrap();
    }

    /// Drops a signed license file into the licenses directory.
    pub fn write_license(&self, name: &str, token: &str) {
        std::fs::write(self.licenses_dir.join(name), token).unwrap();
    }

    /// One request/response exchange over the daemon socket.
    pub async fn request(&self, method: &str, path: &str) -> UdsResponse {
        client::request(&self.socket, method, path).await.unwrap()
    }

    /// GET returning the parsed JSON body.
    pub async fn get_json(&self, path: &str) -> serde_json::Value {
        let response = self.request("GET", path).await;
        assert_eq!(response.status, 200, "body: {}", response.body);
        serde_json::from_str(&response.body).unwrap()
    }

    /// Opens a raw stream for endpoints that keep the connection open.
    pub async fn open_stream(&self) -> UnixStream {
        UnixStream::connect(&self.socket).await.unwrap()
    }

    pub fn shutdown(&self) {
        self.trust.request_shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads from the stream until the needle shows up, bounded by a timeout.
pub async fn read_until(stream: &mut UnixStream, needle: &str, limit: Duration) -> String {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let mut chunk = [0u8; 1024];
        let read = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timed out waiting for {needle:?}; got {:?}",
                    String::from_utf8_lossy(&collected)
                )
            })
            .expect("stream read failed");
        if read == 0 {
            panic!(
                "stream closed before {needle:?}; got {:?}",
                String::from_utf8_lossy(&collected)
            );
        }
        collected.extend_from_slice(&chunk[..read]);
        let text = String::from_utf8_lossy(&collected);
        if text.contains(needle) {
            return text.into_owned();
        }
    }
}

/// Asserts that the needle does not show up within the window.
pub async fn assert_quiet(stream: &mut UnixStream, needle: &str, window: Duration) {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let mut chunk = [0u8; 1024];
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(read)) => {
                collected.extend_from_slice(&chunk[..read]);
                let text = String::from_utf8_lossy(&collected);
                assert!(
                    !text.contains(needle),
                    "unexpected {needle:?} within the quiet window"
                );
            }
            Ok(Err(err)) => panic!("stream read failed: {err}"),
        }
    }
}

/// Sends a GET request on an already open stream without closing it.
pub async fn send_get(stream: &mut UnixStream, path: &str) {
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nAccept: text/event-stream\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
}
