//! Shared trust state.
//!
//! The trust state is the only process-wide mutable object: the current
//! key set, the debounced offline counter, the committed license set and
//! its generation number live behind one reader-writer lock, so readers
//! always observe a mutually consistent snapshot. Commit fan-out and the
//! one-shot readiness gate are watch channels owned by the handle.

use std::sync::Arc;

use licd_core::jwks::KeySet;
use licd_core::scanner::ParsedLicense;
use tokio::sync::{watch, RwLock, RwLockReadGuard};

/// Consecutive failed fetch attempts after which the daemon reports
/// offline to readers and the scanner.
pub const OFFLINE_THRESHOLD: u8 = 3;

/// Shared handle to the trust state.
pub type SharedTrust = Arc<TrustHandle>;

/// The mutable trust state, guarded by the handle's lock.
#[derive(Debug)]
pub struct TrustState {
    keys: Option<Arc<KeySet>>,
    offline_count: u8,
    claims: Arc<Vec<Arc<ParsedLicense>>>,
    generation: u64,
}

impl TrustState {
    /// The current key set, when one has been fetched.
    #[must_use]
    pub fn keys(&self) -> Option<&Arc<KeySet>> {
        self.keys.as_ref()
    }

    /// The committed license set, oldest first.
    #[must_use]
    pub fn claims(&self) -> &Arc<Vec<Arc<ParsedLicense>>> {
        &self.claims
    }

    /// The commit generation; increases monotonically.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The debounced offline flag reported to readers and the scanner.
    #[must_use]
    pub fn offline_effective(&self) -> bool {
        self.offline_count >= OFFLINE_THRESHOLD
    }
}

/// Result of folding a fetch outcome into the state.
#[derive(Debug, Clone, Copy)]
pub struct FetchIntegration {
    /// Whether a new key set instance was installed.
    pub keys_changed: bool,
    /// Whether this update pushed the state over the offline threshold.
    pub went_offline: bool,
    /// Whether this update brought the state back below the threshold.
    pub came_online: bool,
}

/// Owner of the trust state and its signals.
///
/// The coordinator is the single writer; everything else reads.
pub struct TrustHandle {
    inner: RwLock<TrustState>,
    update_tx: watch::Sender<u64>,
    ready_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for TrustHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustHandle {
    /// Creates the handle. The state starts offline; the first successful
    /// key-set fetch clears the counter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TrustState {
                keys: None,
                offline_count: OFFLINE_THRESHOLD,
                claims: Arc::new(Vec::new()),
                generation: 0,
            }),
            update_tx: watch::channel(0).0,
            ready_tx: watch::channel(false).0,
            shutdown_tx: watch::channel(false).0,
        }
    }

    /// Acquires the reader lock.
    pub async fn read(&self) -> RwLockReadGuard<'_, TrustState> {
        self.inner.read().await
    }

    /// Commits a new license set: swaps the snapshot under the writer
    /// lock, advances the generation and only then notifies watchers, so
    /// a woken watcher always reads the new contents.
    pub async fn commit(&self, claims: Arc<Vec<Arc<ParsedLicense>>>) -> u64 {
        let generation = {
            let mut state = self.inner.write().await;
            state.claims = claims;
            state.generation += 1;
            state.generation
        };
        self.update_tx.send_replace(generation);
        generation
    }

    /// Folds a key-set fetch outcome into the state.
    ///
    /// Every failed attempt advances the offline counter (capped at the
    /// threshold); any success resets it to zero.
    pub async fn integrate_fetch(
        &self,
        new_keys: Option<KeySet>,
        failed_attempts: u32,
        success: bool,
    ) -> FetchIntegration {
        let mut state = self.inner.write().await;
        let was_offline = state.offline_effective();

        if success {
            state.offline_count = 0;
        } else {
            let advanced = u32::from(state.offline_count).saturating_add(failed_attempts);
            state.offline_count = u8::try_from(advanced.min(u32::from(OFFLINE_THRESHOLD)))
                .unwrap_or(OFFLINE_THRESHOLD);
        }

        let keys_changed = if let Some(keys) = new_keys {
            state.keys = Some(Arc::new(keys));
            true
        } else {
            false
        };

        let is_offline = state.offline_effective();
        FetchIntegration {
            keys_changed,
            went_offline: !was_offline && is_offline,
            came_online: was_offline && !is_offline,
        }
    }

    /// Subscribes to commit notifications. The receiver observes at least
    /// every commit that happens after subscription; rapid commits may
    /// coalesce.
    #[must_use]
    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.update_tx.subscribe()
    }

    /// Subscribes to the one-shot readiness gate.
    #[must_use]
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Closes the readiness gate; idempotent.
    pub fn mark_ready(&self) {
        self.ready_tx.send_replace(true);
    }

    /// Requests an ordered shutdown of all tasks.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Subscribes to the shutdown signal.
    #[must_use]
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_offline_with_empty_snapshot() {
        let trust = TrustHandle::new();
        let state = trust.read().await;
        assert!(state.offline_effective());
        assert!(state.keys().is_none());
        assert!(state.claims().is_empty());
        assert_eq!(state.generation(), 0);
    }

    #[tokio::test]
    async fn commit_advances_generation_and_notifies() {
        let trust = TrustHandle::new();
        let mut updates = trust.subscribe_updates();

        let first = trust.commit(Arc::new(Vec::new())).await;
        let second = trust.commit(Arc::new(Vec::new())).await;
        assert!(second > first, "generation must be monotonic");

        updates.changed().await.unwrap();
        assert_eq!(*updates.borrow_and_update(), second);
    }

    #[tokio::test]
    async fn watcher_sees_commits_after_subscription() {
        let trust = TrustHandle::new();
        trust.commit(Arc::new(Vec::new())).await;

        let mut updates = trust.subscribe_updates();
        // No pending notification for commits before subscription.
        assert!(!updates.has_changed().unwrap());

        trust.commit(Arc::new(Vec::new())).await;
        assert!(updates.has_changed().unwrap());
    }

    #[tokio::test]
    async fn single_success_resets_offline_counter() {
        let trust = TrustHandle::new();
        assert!(trust.read().await.offline_effective());

        let integration = trust.integrate_fetch(Some(KeySet::default()), 0, true).await;
        assert!(integration.came_online);
        assert!(!trust.read().await.offline_effective());
    }

    #[tokio::test]
    async fn three_failed_attempts_cross_the_threshold() {
        let trust = TrustHandle::new();
        trust.integrate_fetch(Some(KeySet::default()), 0, true).await;

        let one = trust.integrate_fetch(None, 1, false).await;
        assert!(!one.went_offline);
        let two = trust.integrate_fetch(None, 1, false).await;
        assert!(!two.went_offline);
        let three = trust.integrate_fetch(None, 1, false).await;
        assert!(three.went_offline);
        assert!(trust.read().await.offline_effective());
    }

    #[tokio::test]
    async fn exhausted_retry_budget_crosses_threshold_at_once() {
        let trust = TrustHandle::new();
        trust.integrate_fetch(Some(KeySet::default()), 0, true).await;

        let integration = trust.integrate_fetch(None, 3, false).await;
        assert!(integration.went_offline);
        assert!(trust.read().await.offline_effective());
    }

    #[tokio::test]
    async fn not_modified_keeps_keys_without_change_flag() {
        let trust = TrustHandle::new();
        trust
            .integrate_fetch(Some(KeySet::default()), 0, true)
            .await;

        let integration = trust.integrate_fetch(None, 0, true).await;
        assert!(!integration.keys_changed);
        assert!(trust.read().await.keys().is_some());
    }

    #[tokio::test]
    async fn ready_gate_closes_once() {
        let trust = TrustHandle::new();
        let mut ready = trust.ready();
        assert!(!*ready.borrow());

        trust.mark_ready();
        ready.wait_for(|ready| *ready).await.unwrap();

        // Idempotent.
        trust.mark_ready();
        assert!(*trust.ready().borrow());
    }
}
