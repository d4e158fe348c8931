//! Tag-indexed request cache on top of the larder store.
//!
//! Entries live in the state tree under one reducer path, keyed by a
//! fingerprint of endpoint and args. Queries attach tags to their entries;
//! invalidating a tag refetches every matching entry that still has
//! subscribers and marks the rest stale. Entries nobody subscribes to are
//! evicted after a grace period.
//!
//! Wiring: register `api.slice()` under `api.reducer_path()` and add
//! `api.middleware()` to the store.

pub mod actions;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod fetch;
pub mod fingerprint;
pub mod middleware;
pub mod state;
pub mod tag;

pub use actions::{ActionTypes, CacheOp};
pub use endpoint::{Api, ApiBuilder, Endpoint, EndpointKind, Subscription};
pub use entry::{CacheEntry, EntryStatus, RequestId, SubscriptionId};
pub use error::{ApiError, ApiResult, FetchError};
pub use fetch::{Fetcher, HttpFetcher};
pub use fingerprint::Fingerprint;
pub use middleware::CacheMiddleware;
pub use state::{CacheSlice, CacheState};
pub use tag::Tag;
