//! Reactive coordinator.
//!
//! Two long-lived tasks drive the trust pipeline. The fetcher task
//! refreshes the key set on a slow tick and folds the outcome into the
//! trust state. The coordinator task owns the scan histories and is the
//! single writer of the committed set: it rebuilds on a fast tick, on
//! explicit reload requests and on key-set changes. Rebuilds are serial;
//! events arriving while one runs are drained and answered by exactly one
//! follow-up rebuild.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use licd_core::aggregate::{sort_and_deduplicate, with_synthetic_subject, ActivationHooks};
use licd_core::certpool::CertificatePool;
use licd_core::claims::Expected;
use licd_core::jwks::{KeySet, KeySetFetcher};
use licd_core::scanner::{LicenseScanner, ParsedLicense};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::state::SharedTrust;

/// Interval between key-set refreshes.
pub const KEYSET_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Interval between license directory re-scans.
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(60);

/// How long a reload request may wait for admission into the event queue.
pub const RELOAD_ADMISSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Events consumed by the coordinator.
#[derive(Debug)]
pub enum Event {
    /// Rescan request; the ack is closed once the rebuild completed.
    Reload {
        /// Answered after the rebuild, whether or not a commit happened.
        ack: Option<oneshot::Sender<()>>,
    },

    /// The fetcher installed a new key set.
    KeysUpdated,
}

/// Callback invoked once, after the first successful commit.
pub type FirstClaimsCallback = Box<dyn FnOnce() + Send>;

/// Hook adapter that logs membership changes and records whether the
/// active set changed at all.
#[derive(Default)]
struct LoggingHooks {
    changed: bool,
}

impl ActivationHooks for LoggingHooks {
    fn on_activate(&mut self, license: &Arc<ParsedLicense>) {
        let products: Vec<&str> = license
            .claims
            .k
            .products
            .keys()
            .map(String::as_str)
            .collect();
        info!(
            name = %license.path.display(),
            products = ?products,
            id = %license.license_id,
            "licensed products activated"
        );
    }

    fn on_new(&mut self, license: &Arc<ParsedLicense>) {
        debug!(id = %license.license_id, "license appeared, triggering");
        self.changed = true;
    }

    fn on_remove(&mut self, license: &Arc<ParsedLicense>) {
        debug!(id = %license.license_id, "license removed, triggering");
        self.changed = true;
    }

    fn on_skip(&mut self, license: &Arc<ParsedLicense>) {
        info!(name = %license.path.display(), "license skipped, file id already active");
    }
}

/// The single writer of the committed license set.
pub struct Coordinator {
    trust: SharedTrust,
    events: mpsc::Receiver<Event>,
    licenses_path: PathBuf,
    sub: String,
    cert_pool: Option<CertificatePool>,
    on_first_claims: Option<FirstClaimsCallback>,

    load_history: HashSet<String>,
    activate_history: HashMap<String, Arc<ParsedLicense>>,
    last_keys: Option<Arc<KeySet>>,
    last_sub: String,
    first: bool,
}

impl Coordinator {
    /// Creates the coordinator.
    #[must_use]
    pub fn new(
        trust: SharedTrust,
        events: mpsc::Receiver<Event>,
        licenses_path: PathBuf,
        sub: String,
        cert_pool: Option<CertificatePool>,
        on_first_claims: Option<FirstClaimsCallback>,
    ) -> Self {
        Self {
            trust,
            events,
            licenses_path,
            sub,
            cert_pool,
            on_first_claims,
            load_history: HashSet::new(),
            activate_history: HashMap::new(),
            last_keys: None,
            last_sub: String::new(),
            first: true,
        }
    }

    /// Runs the coordinator until shutdown.
    ///
    /// The first rebuild waits for `settled`, which the fetcher task fires
    /// once the initial key-set fetch finished one way or the other.
    pub async fn run(mut self, settled: oneshot::Receiver<()>) {
        let mut shutdown = self.trust.subscribe_shutdown();

        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return,
            _ = settled => {}
        }
        self.rebuild().await;

        let mut tick =
            tokio::time::interval_at(Instant::now() + RESCAN_INTERVAL, RESCAN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    // Coalesce everything that queued up into one rebuild;
                    // all pending acks are answered by it.
                    let mut acks = Vec::new();
                    collect_ack(event, &mut acks);
                    while let Ok(pending) = self.events.try_recv() {
                        collect_ack(pending, &mut acks);
                    }
                    self.rebuild().await;
                    for ack in acks {
                        let _ = ack.send(());
                    }
                }
                _ = tick.tick() => self.rebuild().await,
            }
        }
        debug!("coordinator stopped");
    }

    /// Scans, aggregates and, when anything changed, commits atomically.
    async fn rebuild(&mut self) {
        let (keys, offline) = {
            let state = self.trust.read().await;
            (state.keys().cloned(), state.offline_effective())
        };

        // A replaced key set invalidates the warning suppression: files
        // that failed against the old keys deserve one fresh warning.
        let same_instance = match (&keys, &self.last_keys) {
            (Some(current), Some(previous)) => Arc::ptr_eq(current, previous),
            (None, None) => true,
            _ => false,
        };
        if !same_instance {
            self.load_history.clear();
            self.last_keys = keys.clone();
        }

        let expected = Expected::now();
        let mut scanner = LicenseScanner {
            keys: keys.as_deref(),
            cert_pool: self.cert_pool.as_ref(),
            offline,
            load_history: &mut self.load_history,
        };
        let scanned = match scanner.scan_folder(&self.licenses_path, expected) {
            Ok(scanned) => scanned,
            Err(err) if err.is_not_found() => {
                // No licenses installed at all still publishes an empty
                // snapshot, so readers are not stuck behind the ready gate.
                warn!(path = %self.licenses_path.display(), "license folder does not exist");
                Vec::new()
            }
            Err(err) => {
                error!(error = %err, "failed to read license folder, skipping cycle");
                return;
            }
        };

        let mut hooks = LoggingHooks::default();
        let mut claims = sort_and_deduplicate(scanned, &mut self.activate_history, &mut hooks);
        let changed = hooks.changed;

        if !self.sub.is_empty() {
            if changed {
                debug!(sub = %self.sub, "using globally configured subject");
            }
            claims = with_synthetic_subject(&self.sub, claims);
        }

        let sub = claims
            .first()
            .and_then(|license| license.claims.sub.clone())
            .unwrap_or_default();
        if !self.first && sub == self.last_sub && !changed {
            return;
        }
        self.last_sub = sub;

        let generation = self.trust.commit(Arc::new(claims)).await;
        debug!(generation, "committed license snapshot");

        if self.first {
            self.first = false;
            self.trust.mark_ready();
            if let Some(callback) = self.on_first_claims.take() {
                callback();
            }
        }
    }
}

fn collect_ack(event: Event, acks: &mut Vec<oneshot::Sender<()>>) {
    if let Event::Reload { ack: Some(ack) } = event {
        acks.push(ack);
    }
}

/// Runs the key-set fetcher task until shutdown.
///
/// Each cycle folds the fetch outcome into the trust state, notifies the
/// coordinator about installed key sets, and fires `settled` after the
/// first cycle so the initial scan does not race the initial fetch.
pub async fn run_fetcher(
    trust: SharedTrust,
    mut fetcher: KeySetFetcher,
    events: mpsc::Sender<Event>,
    settled: oneshot::Sender<()>,
) {
    let mut shutdown = trust.subscribe_shutdown();
    let mut settled = Some(settled);

    loop {
        let outcome = fetcher.update().await;
        let success = outcome.is_success();
        let integration = trust
            .integrate_fetch(outcome.new_keys, outcome.failed_attempts, success)
            .await;

        if let Some(err) = &outcome.error {
            warn!(error = %err, "unable to fetch key set");
        }
        if integration.went_offline {
            warn!("now offline");
        } else if integration.came_online {
            info!("no longer offline");
        }
        if integration.keys_changed {
            if events.send(Event::KeysUpdated).await.is_err() {
                return;
            }
        }
        if let Some(settled) = settled.take() {
            let _ = settled.send(());
        }

        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return,
            () = tokio::time::sleep(KEYSET_REFRESH_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TrustHandle;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use ed25519_dalek::Signer as _;
    use licd_core::jwks::Jwk;
    use serde_json::json;

    fn test_key() -> ed25519_dalek::SigningKey {
        ed25519_dalek::SigningKey::from_bytes(&[41u8; 32])
    }

    fn sign_token(key: &ed25519_dalek::SigningKey, claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&json!({"alg": "EdDSA", "kid": "k1"})).unwrap());
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        let signing_input = format!("{header}.{payload}");
        let signature = key.sign(signing_input.as_bytes());
        format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }

    fn key_set(key: &ed25519_dalek::SigningKey) -> KeySet {
        KeySet {
            keys: vec![Jwk {
                kty: "OKP".into(),
                kid: "k1".into(),
                crv: "Ed25519".into(),
                x: URL_SAFE_NO_PAD.encode(key.verifying_key().to_bytes()),
                ..Jwk::default()
            }],
        }
    }

    fn claims_json(jti: &str, uid: &str) -> serde_json::Value {
        let now = chrono::Utc::now().timestamp();
        json!({
            "sub": "cust-A",
            "jti": jti,
            "iat": now - 60,
            "exp": now + 3600,
            "uid": uid,
        })
    }

    fn coordinator(trust: SharedTrust, dir: &std::path::Path, sub: &str) -> Coordinator {
        let (_tx, rx) = mpsc::channel(4);
        Coordinator::new(
            trust,
            rx,
            dir.to_path_buf(),
            sub.to_string(),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn first_rebuild_commits_and_closes_ready() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        std::fs::write(
            dir.path().join("a.license"),
            sign_token(&key, &claims_json("j-1", "u-1")),
        )
        .unwrap();

        let trust: SharedTrust = Arc::new(TrustHandle::new());
        trust.integrate_fetch(Some(key_set(&key)), 0, true).await;

        let mut coordinator = coordinator(trust.clone(), dir.path(), "");
        coordinator.rebuild().await;

        assert!(*trust.ready().borrow(), "first commit must close ready");
        let state = trust.read().await;
        assert_eq!(state.generation(), 1);
        assert_eq!(state.claims().len(), 1);
        assert_eq!(state.claims()[0].license_id, "j-1");
    }

    #[tokio::test]
    async fn unchanged_input_does_not_commit_again() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        std::fs::write(
            dir.path().join("a.license"),
            sign_token(&key, &claims_json("j-1", "u-1")),
        )
        .unwrap();

        let trust: SharedTrust = Arc::new(TrustHandle::new());
        trust.integrate_fetch(Some(key_set(&key)), 0, true).await;

        let mut coordinator = coordinator(trust.clone(), dir.path(), "");
        coordinator.rebuild().await;
        let mut updates = trust.subscribe_updates();

        coordinator.rebuild().await;
        coordinator.rebuild().await;

        assert_eq!(trust.read().await.generation(), 1);
        assert!(
            !updates.has_changed().unwrap(),
            "idempotent rebuilds must not signal watchers"
        );
    }

    #[tokio::test]
    async fn new_file_triggers_a_new_commit() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        std::fs::write(
            dir.path().join("a.license"),
            sign_token(&key, &claims_json("j-1", "u-1")),
        )
        .unwrap();

        let trust: SharedTrust = Arc::new(TrustHandle::new());
        trust.integrate_fetch(Some(key_set(&key)), 0, true).await;

        let mut coordinator = coordinator(trust.clone(), dir.path(), "");
        coordinator.rebuild().await;

        std::fs::write(
            dir.path().join("b.license"),
            sign_token(&key, &claims_json("j-2", "u-2")),
        )
        .unwrap();
        coordinator.rebuild().await;

        let state = trust.read().await;
        assert_eq!(state.generation(), 2);
        assert_eq!(state.claims().len(), 2);
    }

    #[tokio::test]
    async fn removed_file_triggers_a_new_commit() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let path = dir.path().join("a.license");
        std::fs::write(&path, sign_token(&key, &claims_json("j-1", "u-1"))).unwrap();

        let trust: SharedTrust = Arc::new(TrustHandle::new());
        trust.integrate_fetch(Some(key_set(&key)), 0, true).await;

        let mut coordinator = coordinator(trust.clone(), dir.path(), "");
        coordinator.rebuild().await;

        std::fs::remove_file(&path).unwrap();
        coordinator.rebuild().await;

        let state = trust.read().await;
        assert_eq!(state.generation(), 2);
        assert!(state.claims().is_empty());
    }

    #[tokio::test]
    async fn synthetic_subject_leads_the_committed_set() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        std::fs::write(
            dir.path().join("a.license"),
            sign_token(&key, &claims_json("j-1", "u-1")),
        )
        .unwrap();

        let trust: SharedTrust = Arc::new(TrustHandle::new());
        trust.integrate_fetch(Some(key_set(&key)), 0, true).await;

        let mut coordinator = coordinator(trust.clone(), dir.path(), "global-sub");
        coordinator.rebuild().await;

        let state = trust.read().await;
        assert_eq!(state.claims().len(), 2);
        assert_eq!(state.claims()[0].claims.sub.as_deref(), Some("global-sub"));
        assert_eq!(state.claims()[1].license_id, "j-1");
    }

    #[tokio::test]
    async fn missing_directory_yields_an_empty_commit() {
        let trust: SharedTrust = Arc::new(TrustHandle::new());
        let mut coordinator = coordinator(
            trust.clone(),
            std::path::Path::new("/nonexistent/licenses"),
            "",
        );
        coordinator.rebuild().await;

        let state = trust.read().await;
        assert_eq!(state.generation(), 1);
        assert!(state.claims().is_empty());
        assert!(*trust.ready().borrow());
    }

    #[tokio::test]
    async fn unreadable_directory_skips_the_cycle() {
        // A plain file where the directory should be: read_dir fails with
        // something other than NotFound and the cycle must not commit.
        let scratch = tempfile::tempdir().unwrap();
        let bogus = scratch.path().join("licenses");
        std::fs::write(&bogus, "not a directory").unwrap();

        let trust: SharedTrust = Arc::new(TrustHandle::new());
        let mut coordinator = coordinator(trust.clone(), &bogus, "");
        coordinator.rebuild().await;

        assert_eq!(trust.read().await.generation(), 0, "no commit on IO failure");
        assert!(!*trust.ready().borrow());
    }

    #[tokio::test]
    async fn first_claims_callback_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let trust: SharedTrust = Arc::new(TrustHandle::new());
        let (fired_tx, mut fired_rx) = mpsc::channel(1);
        let (_tx, rx) = mpsc::channel(4);
        let mut coordinator = Coordinator::new(
            trust.clone(),
            rx,
            dir.path().to_path_buf(),
            String::new(),
            None,
            Some(Box::new(move || {
                let _ = fired_tx.try_send(());
            })),
        );

        coordinator.rebuild().await;
        assert!(fired_rx.try_recv().is_ok(), "callback fires on first commit");

        coordinator.rebuild().await;
        assert!(fired_rx.try_recv().is_err(), "callback fires only once");
    }

    #[tokio::test]
    async fn reload_event_is_acked_after_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let trust: SharedTrust = Arc::new(TrustHandle::new());
        let (events_tx, events_rx) = mpsc::channel(4);
        let coordinator = Coordinator::new(
            trust.clone(),
            events_rx,
            dir.path().to_path_buf(),
            String::new(),
            None,
            None,
        );

        let (settled_tx, settled_rx) = oneshot::channel();
        settled_tx.send(()).unwrap();
        let task = tokio::spawn(coordinator.run(settled_rx));

        let (ack_tx, ack_rx) = oneshot::channel();
        events_tx
            .send(Event::Reload { ack: Some(ack_tx) })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), ack_rx)
            .await
            .expect("reload must be acked")
            .unwrap();

        trust.request_shutdown();
        task.await.unwrap();
    }
}
