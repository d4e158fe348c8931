//! Shared plumbing for the larder crates: file/env configuration and the
//! clock abstraction injected into the cache engine.

pub mod clock;
pub mod config;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, CacheConfig, FileConfig, HttpConfig, PersistSettings};
