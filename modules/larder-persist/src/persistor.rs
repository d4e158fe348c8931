//! Boot-time hydration and the background snapshot writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use larder_engine::{Committed, Diagnostic, Dispatcher, StateTree, Store};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{Envelope, PersistConfig};
use crate::error::StorageError;
use crate::reducer::{persist_action, rehydrate_action};
use crate::storage::Storage;

/// Outcome of reading storage at boot.
#[derive(Debug, Clone, PartialEq)]
pub enum Hydrated {
    /// The persisted keys found in a matching snapshot.
    Restored(StateTree),
    /// Nothing usable was stored; every slice starts from its default.
    ColdStart,
}

/// Read the snapshot once. Never fails and never waits longer than the
/// configured timeout: anything unexpected is a cold start.
pub async fn hydrate<S: Storage + ?Sized>(config: &PersistConfig, storage: &S) -> Hydrated {
    let key = config.storage_key();
    let raw = match tokio::time::timeout(config.hydrate_timeout, storage.get(&key)).await {
        Ok(Ok(Some(raw))) => raw,
        Ok(Ok(None)) => {
            debug!(key = key.as_str(), "Nothing persisted");
            return Hydrated::ColdStart;
        }
        Ok(Err(err)) => {
            warn!(key = key.as_str(), error = %err, "Reading snapshot failed, starting cold");
            return Hydrated::ColdStart;
        }
        Err(_) => {
            warn!(
                key = key.as_str(),
                timeout_ms = config.hydrate_timeout.as_millis() as u64,
                "Reading snapshot timed out, starting cold"
            );
            return Hydrated::ColdStart;
        }
    };

    if raw.trim().is_empty() {
        debug!(key = key.as_str(), "Empty snapshot");
        return Hydrated::ColdStart;
    }
    let envelope: Envelope = match serde_json::from_str(&raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(key = key.as_str(), error = %err, "Snapshot does not parse");
            return Hydrated::ColdStart;
        }
    };
    if envelope.version != config.version {
        debug!(
            key = key.as_str(),
            stored = envelope.version,
            expected = config.version,
            "Snapshot version mismatch"
        );
        return Hydrated::ColdStart;
    }

    Hydrated::Restored(
        envelope
            .data
            .into_iter()
            .filter(|(key, _)| config.is_persisted(key))
            .collect(),
    )
}

struct PersistorInner {
    config: PersistConfig,
    storage: Arc<dyn Storage>,
    dispatcher: Dispatcher,
    commits: watch::Receiver<Committed>,
    /// Revision of the last snapshot written. Held across the write so
    /// writes never overlap.
    written: Mutex<Option<u64>>,
    paused: AtomicBool,
}

impl PersistorInner {
    /// Write `committed` unless a newer revision is already stored. Returns
    /// whether anything was written.
    async fn write(&self, committed: &Committed) -> Result<bool, StorageError> {
        let mut written = self.written.lock().await;
        if written.is_some_and(|revision| revision >= committed.revision) {
            return Ok(false);
        }

        let key = self.config.storage_key();
        let result = match serde_json::to_string(&self.config.envelope(&committed.tree)) {
            Ok(json) => self.storage.set(&key, json).await,
            Err(err) => Err(StorageError::from(err)),
        };
        match result {
            Ok(()) => {
                *written = Some(committed.revision);
                debug!(key = key.as_str(), revision = committed.revision, "Snapshot written");
                Ok(true)
            }
            Err(err) => {
                warn!(key = key.as_str(), revision = committed.revision, error = %err, "Persist failed");
                self.dispatcher.report(Diagnostic::PersistFailed {
                    key,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

/// Handle to the snapshot writer of one store. Cheap to clone.
#[derive(Clone)]
pub struct Persistor {
    inner: Arc<PersistorInner>,
}

impl Persistor {
    fn new(store: &Store, config: PersistConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            inner: Arc::new(PersistorInner {
                config,
                storage,
                dispatcher: store.dispatcher(),
                commits: store.watch(),
                written: Mutex::new(None),
                paused: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PersistConfig {
        &self.inner.config
    }

    /// Write `committed` in the background. Failures are reported as
    /// diagnostics.
    pub fn persist(&self, committed: Committed) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = inner.write(&committed).await;
        });
    }

    /// Write the latest committed tree now, even while paused.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let committed = self.inner.commits.borrow().clone();
        self.inner.write(&committed).await.map(|_| ())
    }

    /// Stop writing after commits until `resume`.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        debug!(key = self.inner.config.key.as_str(), "Persistence paused");
    }

    /// Resume writing. The next commit is written; call `flush` to write the
    /// current tree right away.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        debug!(key = self.inner.config.key.as_str(), "Persistence resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Delete the stored snapshot. A later commit writes a new one.
    pub async fn purge(&self) -> Result<(), StorageError> {
        let mut written = self.inner.written.lock().await;
        let key = self.inner.config.storage_key();
        self.inner.storage.remove(&key).await?;
        *written = None;
        info!(key = key.as_str(), "Persisted snapshot purged");
        Ok(())
    }
}

/// Watches commits and writes the newest one. Commits landing during the
/// throttle window or during a write collapse into one write.
async fn run_writer(inner: Arc<PersistorInner>, mut commits: watch::Receiver<Committed>) {
    loop {
        if commits.changed().await.is_err() {
            debug!(key = inner.config.key.as_str(), "Store dropped, writer stopping");
            return;
        }
        if !inner.config.throttle.is_zero() {
            tokio::time::sleep(inner.config.throttle).await;
        }
        let committed = commits.borrow_and_update().clone();
        if inner.paused.load(Ordering::SeqCst) {
            continue;
        }
        // Failures are already logged and reported; the next commit retries.
        let _ = inner.write(&committed).await;
    }
}

/// Boot `store`: mark persistence as started, restore the snapshot, start
/// the writer, then open the store to external dispatch.
///
/// Build the store `gated()` with its reducer wrapped by `persist_reducer`
/// using the same config. Actions dispatched before this returns are held
/// and applied after the restore, in order.
pub async fn persist_store(
    store: &Store,
    config: PersistConfig,
    storage: impl Storage,
) -> Persistor {
    let storage: Arc<dyn Storage> = Arc::new(storage);
    info!(
        key = config.key.as_str(),
        version = config.version,
        "Hydrating store"
    );

    store.dispatch_boot(persist_action(&config));
    let restored = match hydrate(&config, storage.as_ref()).await {
        Hydrated::Restored(tree) => {
            info!(keys = tree.len(), "Restored persisted state");
            Some(tree)
        }
        Hydrated::ColdStart => {
            info!("No usable snapshot, cold start");
            None
        }
    };
    store.dispatch_boot(rehydrate_action(&config, restored));

    let persistor = Persistor::new(store, config, storage);
    tokio::spawn(run_writer(persistor.inner.clone(), store.watch()));
    store.open();
    persistor
}
