//! Cache entries and their identifiers.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::FetchError;
use crate::tag::Tag;

/// Identifies one subscription to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one network request. Results carrying a request id that no
/// longer matches the entry are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where an entry is in its fetch lifecycle. The payload lives on
/// `Fulfilled` and the error on `Errored`, nowhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    Uninitialized,
    Loading,
    Fulfilled { data: Value },
    Errored { error: FetchError },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub endpoint: String,
    pub args: Value,
    pub status: EntryStatus,
    pub subscribers: BTreeSet<SubscriptionId>,
    pub tags: BTreeSet<Tag>,
    /// Tags attached at subscribe time. They survive every refetch; the
    /// rest of `tags` is recomputed from each result.
    #[serde(default)]
    pub declared_tags: BTreeSet<Tag>,
    /// The request currently in flight, if any.
    pub request_id: Option<RequestId>,
    /// Invalidated since the last fetch started.
    pub stale: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(endpoint: impl Into<String>, args: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            args,
            status: EntryStatus::Uninitialized,
            subscribers: BTreeSet::new(),
            tags: BTreeSet::new(),
            declared_tags: BTreeSet::new(),
            request_id: None,
            stale: false,
            started_at: None,
            fulfilled_at: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_fetching(&self) -> bool {
        self.request_id.is_some()
    }

    pub fn data(&self) -> Option<&Value> {
        match &self.status {
            EntryStatus::Fulfilled { data } => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match &self.status {
            EntryStatus::Errored { error } => Some(error),
            _ => None,
        }
    }

    /// Holds a result, nothing in flight and nothing pending a refetch.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            EntryStatus::Fulfilled { .. } | EntryStatus::Errored { .. }
        ) && !self.is_fetching()
            && !self.stale
    }

    /// Whether a new fetch should start, ignoring whether one is already
    /// in flight.
    pub fn wants_fetch(&self) -> bool {
        match self.status {
            EntryStatus::Uninitialized | EntryStatus::Errored { .. } => true,
            EntryStatus::Loading => !self.is_fetching(),
            EntryStatus::Fulfilled { .. } => self.stale,
        }
    }
}
