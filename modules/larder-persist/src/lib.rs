//! Persistence for the larder store.
//!
//! A configured subset of the state tree is written to durable storage
//! after commits and restored once at boot, before the store accepts
//! external dispatches. Snapshots are stored as `{"version", "data"}`; a
//! version mismatch or unreadable snapshot is a cold start.
//!
//! ```ignore
//! // The cache sub-tree (`api` unless configured otherwise) is never stored.
//! let config = PersistConfig::from_config(&file_config);
//! let store = Store::builder()
//!     .gated()
//!     .middleware(SerializabilityGuard::new().ignore_actions(LIFECYCLE_ACTIONS))
//!     .middleware(api.middleware())
//!     .build(persist_reducer(config.clone(), reducer))?;
//! let persistor = persist_store(&store, config, FileStorage::new(".larder")).await;
//! ```

pub mod config;
pub mod error;
pub mod persistor;
pub mod reducer;
pub mod storage;

pub use config::{Envelope, PersistConfig, PersistMeta, META_KEY};
pub use error::StorageError;
pub use persistor::{hydrate, persist_store, Hydrated, Persistor};
pub use reducer::{
    persist_action, persist_reducer, rehydrate_action, PersistedReducer, LIFECYCLE_ACTIONS,
    PERSIST, REHYDRATE,
};
pub use storage::{FileStorage, MemoryStorage, Storage};
