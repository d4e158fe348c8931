//! Integration tests for booting, restoring and writing snapshots.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use larder_cache::{ActionTypes, CacheOp, CacheSlice, CacheState, SubscriptionId};
use larder_engine::{
    Action, ActionLog, CombinedReducer, Diagnostic, Dispatched, SerializabilityGuard, Slice,
    Store,
};
use larder_persist::{
    hydrate, persist_reducer, persist_store, Envelope, FileStorage, Hydrated, MemoryStorage,
    PersistConfig, PersistMeta, Storage, StorageError, LIFECYCLE_ACTIONS,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Domain slices
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct Auth {
    access_token: Option<String>,
    email: Option<String>,
}

struct AuthSlice;

impl Slice for AuthSlice {
    type State = Auth;

    fn reduce(&self, state: &mut Auth, action: &Action) {
        match action.kind() {
            "auth/loggedIn" => {
                let field = |name: &str| {
                    action
                        .payload()
                        .get(name)
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                };
                state.access_token = field("access_token");
                state.email = field("email");
            }
            "auth/loggedOut" => *state = Auth::default(),
            _ => {}
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct Products {
    selected_category: Option<String>,
}

struct ProductsSlice;

impl Slice for ProductsSlice {
    type State = Products;

    fn reduce(&self, state: &mut Products, action: &Action) {
        if action.is("products/categorySelected") {
            state.selected_category = action
                .payload()
                .get("category")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
    }
}

fn reducer() -> CombinedReducer {
    CombinedReducer::new()
        .slice("auth", AuthSlice)
        .slice("products", ProductsSlice)
        .slice("api", CacheSlice::new("api"))
}

fn config() -> PersistConfig {
    PersistConfig::new("root")
}

fn store_with(config: &PersistConfig, log: Option<Arc<ActionLog>>) -> Store {
    let mut builder = Store::builder()
        .gated()
        .middleware(SerializabilityGuard::new().ignore_actions(LIFECYCLE_ACTIONS));
    if let Some(log) = log {
        builder = builder.middleware(log);
    }
    builder
        .build(persist_reducer(config.clone(), reducer()))
        .unwrap()
}

fn login(token: &str) -> Action {
    Action::new("auth/loggedIn").with_payload(json!({
        "access_token": token,
        "email": "ada@example.com",
    }))
}

fn slice<T: serde::de::DeserializeOwned>(store: &Store, key: &str) -> T {
    store.get_state().slice(key).unwrap().unwrap()
}

async fn stored(storage: &MemoryStorage) -> Option<Envelope> {
    storage
        .get("persist:root")
        .await
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

// ---------------------------------------------------------------------------
// Storage doubles
// ---------------------------------------------------------------------------

/// Reads succeed, writes always fail.
#[derive(Default)]
struct ReadOnlyStorage {
    inner: MemoryStorage,
}

#[async_trait]
impl Storage for ReadOnlyStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, _key: &str, _value: String) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("quota exceeded".into()))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key).await
    }
}

/// Counts writes.
#[derive(Default)]
struct CountingStorage {
    inner: MemoryStorage,
    writes: AtomicUsize,
}

#[async_trait]
impl Storage for CountingStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key).await
    }
}

/// Never answers a read.
struct HangingStorage;

#[async_trait]
impl Storage for HangingStorage {
    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        std::future::pending().await
    }

    async fn set(&self, _key: &str, _value: String) -> Result<(), StorageError> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn restore_yields_persisted_keys_and_defaults_elsewhere() {
    let storage = Arc::new(MemoryStorage::new());
    let config = config().blacklist(["products"]);

    let first = store_with(&config, None);
    let persistor = persist_store(&first, config.clone(), storage.clone()).await;
    first.dispatch(login("token-1"));
    first.dispatch(Action::new("products/categorySelected").with_payload(json!({"category": "Tablets"})));
    persistor.flush().await.unwrap();

    let envelope = stored(&storage).await.unwrap();
    assert_eq!(envelope.version, 1);
    assert_eq!(envelope.data.keys().collect::<Vec<_>>(), vec!["auth"]);

    let second = store_with(&config, None);
    persist_store(&second, config, storage).await;

    let auth: Auth = slice(&second, "auth");
    assert_eq!(auth.access_token.as_deref(), Some("token-1"));
    assert_eq!(slice::<Products>(&second, "products"), Products::default());
    assert_eq!(
        PersistMeta::read(&second.get_state()),
        Some(PersistMeta {
            version: 1,
            rehydrated: true
        })
    );
}

#[tokio::test]
async fn hydrate_on_empty_or_garbage_storage_is_a_cold_start() {
    let storage = MemoryStorage::new();
    let config = config();
    assert_eq!(hydrate(&config, &storage).await, Hydrated::ColdStart);

    storage.set("persist:root", "".into()).await.unwrap();
    assert_eq!(hydrate(&config, &storage).await, Hydrated::ColdStart);

    storage.set("persist:root", "{not json".into()).await.unwrap();
    assert_eq!(hydrate(&config, &storage).await, Hydrated::ColdStart);
}

#[tokio::test]
async fn version_mismatch_is_a_cold_start() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .set(
            "persist:root",
            json!({"version": 1, "data": {"auth": {"access_token": "old"}}}).to_string(),
        )
        .await
        .unwrap();
    let config = config().version(2);

    assert_eq!(hydrate(&config, storage.as_ref()).await, Hydrated::ColdStart);

    let store = store_with(&config, None);
    persist_store(&store, config, storage).await;
    assert_eq!(slice::<Auth>(&store, "auth"), Auth::default());
}

#[tokio::test(start_paused = true)]
async fn hydrate_gives_up_after_the_timeout() {
    let config = config().hydrate_timeout(Duration::from_millis(50));
    assert_eq!(hydrate(&config, &HangingStorage).await, Hydrated::ColdStart);
}

#[tokio::test]
async fn write_failure_reports_a_diagnostic_and_keeps_state() {
    let store = store_with(&config(), None);
    let mut diagnostics = store.diagnostics();
    let persistor = persist_store(&store, config(), ReadOnlyStorage::default()).await;

    store.dispatch(login("token-1"));

    // The background writer hits the failure first.
    let diagnostic = tokio::time::timeout(Duration::from_secs(1), diagnostics.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        diagnostic,
        Diagnostic::PersistFailed { ref key, .. } if key == "persist:root"
    ));
    assert!(persistor.flush().await.is_err());

    let auth: Auth = slice(&store, "auth");
    assert_eq!(auth.access_token.as_deref(), Some("token-1"));
}

#[tokio::test]
async fn actions_dispatched_before_boot_apply_after_restore() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .set(
            "persist:root",
            json!({"version": 1, "data": {"auth": {"access_token": "restored", "email": null}}})
                .to_string(),
        )
        .await
        .unwrap();

    let log = Arc::new(ActionLog::new());
    let store = store_with(&config(), Some(log.clone()));
    assert_eq!(store.dispatch(login("fresh")), Dispatched::Held);
    assert_eq!(slice::<Auth>(&store, "auth"), Auth::default());

    persist_store(&store, config(), storage).await;

    assert_eq!(
        log.kinds(),
        vec!["persist/PERSIST", "persist/REHYDRATE", "auth/loggedIn"]
    );
    let auth: Auth = slice(&store, "auth");
    assert_eq!(auth.access_token.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn lifecycle_actions_pass_the_guard_silently() {
    let storage = Arc::new(MemoryStorage::new());
    let store = store_with(&config(), None);
    let mut diagnostics = store.diagnostics();

    persist_store(&store, config(), storage).await;
    assert!(diagnostics.try_recv().is_err());

    // Without the exemption the markers are flagged.
    let unguarded = Store::builder()
        .gated()
        .middleware(SerializabilityGuard::new())
        .build(persist_reducer(config(), reducer()))
        .unwrap();
    let mut flagged = unguarded.diagnostics();
    persist_store(&unguarded, config(), MemoryStorage::new()).await;
    assert!(matches!(
        flagged.try_recv().unwrap(),
        Diagnostic::NonSerializable { ref action, .. } if action == "persist/PERSIST"
    ));
}

#[tokio::test]
async fn cache_sub_tree_is_not_persisted_by_default() {
    let storage = Arc::new(MemoryStorage::new());
    let store = store_with(&config(), None);
    let persistor = persist_store(&store, config(), storage.clone()).await;

    let subscribe = ActionTypes::new("api")
        .build(
            CacheOp::Subscribe,
            &json!({
                "subscription": SubscriptionId::new(),
                "endpoint": "getMyCart",
                "args": null,
            }),
        )
        .unwrap();
    store.dispatch(subscribe);
    assert_eq!(
        CacheState::from_tree(&store.get_state(), "api").entries.len(),
        1
    );
    persistor.flush().await.unwrap();

    let envelope = stored(&storage).await.unwrap();
    assert!(!envelope.data.contains_key("api"));
    assert!(!envelope.data.contains_key("_persist"));
    assert!(envelope.data.contains_key("auth"));
}

#[tokio::test]
async fn opted_in_cache_restores_only_settled_entries() {
    let storage = Arc::new(MemoryStorage::new());
    let fulfilled = json!({
        "endpoint": "getMyCart", "args": null,
        "status": {"status": "fulfilled", "data": {"items": []}},
        "subscribers": [SubscriptionId::new()], "tags": [{"kind": "Cart"}],
        "request_id": null, "stale": false, "started_at": null, "fulfilled_at": null
    });
    let loading = json!({
        "endpoint": "getMyOrders", "args": null,
        "status": {"status": "loading"},
        "subscribers": [], "tags": [{"kind": "Orders"}],
        "request_id": null, "stale": false, "started_at": null, "fulfilled_at": null
    });
    storage
        .set(
            "persist:root",
            json!({"version": 1, "data": {"api": {"entries": {
                "getMyCart(null)": fulfilled,
                "getMyOrders(null)": loading,
            }}}})
            .to_string(),
        )
        .await
        .unwrap();

    let config = config().whitelist(["auth", "api"]);
    let store = store_with(&config, None);
    persist_store(&store, config, storage).await;

    let cache = CacheState::from_tree(&store.get_state(), "api");
    assert_eq!(cache.entries.len(), 1);
    let cart = cache.entries.values().next().unwrap();
    assert_eq!(cart.endpoint, "getMyCart");
    assert!(cart.stale);
    assert!(cart.subscribers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn throttled_writer_coalesces_bursts() {
    let storage = Arc::new(CountingStorage::default());
    let config = config().throttle(Duration::from_millis(100));
    let store = store_with(&config, None);
    persist_store(&store, config, storage.clone()).await;

    for token in ["a", "b", "c"] {
        store.dispatch(login(token));
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
    let raw = storage.get("persist:root").await.unwrap().unwrap();
    let envelope: Envelope = serde_json::from_str(&raw).unwrap();
    assert_eq!(envelope.data["auth"]["access_token"], json!("c"));
}

#[tokio::test]
async fn flush_never_regresses_the_snapshot() {
    let storage = Arc::new(CountingStorage::default());
    let store = store_with(&config(), None);
    let persistor = persist_store(&store, config(), storage.clone()).await;
    persistor.pause();

    store.dispatch(login("a"));
    persistor.flush().await.unwrap();
    persistor.flush().await.unwrap();

    // Same revision twice: one write.
    assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pause_resume_and_purge() {
    let storage = Arc::new(MemoryStorage::new());
    let store = store_with(&config(), None);
    let persistor = persist_store(&store, config(), storage.clone()).await;

    persistor.pause();
    assert!(persistor.is_paused());
    store.dispatch(login("paused"));
    tokio::task::yield_now().await;
    assert!(stored(&storage).await.is_none());

    persistor.resume();
    persistor.flush().await.unwrap();
    let envelope = stored(&storage).await.unwrap();
    assert_eq!(envelope.data["auth"]["access_token"], json!("paused"));

    persistor.purge().await.unwrap();
    assert!(stored(&storage).await.is_none());
}

#[tokio::test]
async fn file_storage_survives_a_restart() {
    let temp_dir = TempDir::new().unwrap();

    let first = store_with(&config(), None);
    let persistor = persist_store(&first, config(), FileStorage::new(temp_dir.path())).await;
    first.dispatch(login("on-disk"));
    persistor.flush().await.unwrap();
    assert!(temp_dir.path().join("persist_root.json").exists());

    let second = store_with(&config(), None);
    persist_store(&second, config(), FileStorage::new(temp_dir.path())).await;
    let auth: Auth = slice(&second, "auth");
    assert_eq!(auth.access_token.as_deref(), Some("on-disk"));
}
