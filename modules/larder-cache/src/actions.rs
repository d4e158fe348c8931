//! Cache lifecycle actions.
//!
//! Every cache action type is `<reducer_path>/<op>`. Payloads are plain
//! serde structs, so cache actions always pass the serializability guard.

use chrono::{DateTime, Utc};
use larder_engine::Action;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::{RequestId, SubscriptionId};
use crate::error::FetchError;
use crate::fingerprint::Fingerprint;
use crate::tag::Tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    Subscribe,
    Unsubscribe,
    QueryPending,
    QueryFulfilled,
    QueryRejected,
    InvalidateTags,
    Evict,
    MutationFulfilled,
    MutationRejected,
    Reset,
}

impl CacheOp {
    const ALL: [CacheOp; 10] = [
        CacheOp::Subscribe,
        CacheOp::Unsubscribe,
        CacheOp::QueryPending,
        CacheOp::QueryFulfilled,
        CacheOp::QueryRejected,
        CacheOp::InvalidateTags,
        CacheOp::Evict,
        CacheOp::MutationFulfilled,
        CacheOp::MutationRejected,
        CacheOp::Reset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CacheOp::Subscribe => "subscribe",
            CacheOp::Unsubscribe => "unsubscribe",
            CacheOp::QueryPending => "queryPending",
            CacheOp::QueryFulfilled => "queryFulfilled",
            CacheOp::QueryRejected => "queryRejected",
            CacheOp::InvalidateTags => "invalidateTags",
            CacheOp::Evict => "evict",
            CacheOp::MutationFulfilled => "mutationFulfilled",
            CacheOp::MutationRejected => "mutationRejected",
            CacheOp::Reset => "resetApiState",
        }
    }
}

/// Builds and recognizes the action types for one reducer path.
#[derive(Debug, Clone)]
pub struct ActionTypes {
    path: String,
}

impl ActionTypes {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn kind(&self, op: CacheOp) -> String {
        format!("{}/{}", self.path, op.name())
    }

    pub fn parse(&self, kind: &str) -> Option<CacheOp> {
        let name = kind.strip_prefix(self.path.as_str())?.strip_prefix('/')?;
        CacheOp::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn build<T: Serialize>(&self, op: CacheOp, payload: &T) -> Result<Action, serde_json::Error> {
        Action::from_serialize(self.kind(op), payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribe {
    pub subscription: SubscriptionId,
    pub endpoint: String,
    pub args: Value,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub subscription: SubscriptionId,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPending {
    pub fingerprint: Fingerprint,
    pub request_id: RequestId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFulfilled {
    pub fingerprint: Fingerprint,
    pub request_id: RequestId,
    pub data: Value,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub fulfilled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRejected {
    pub fingerprint: Fingerprint,
    pub request_id: RequestId,
    pub error: FetchError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateTags {
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evict {
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationFulfilled {
    pub endpoint: String,
    pub args: Value,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRejected {
    pub endpoint: String,
    pub args: Value,
    pub error: FetchError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_only_matches_own_path() {
        let types = ActionTypes::new("api");
        assert_eq!(types.kind(CacheOp::InvalidateTags), "api/invalidateTags");
        assert_eq!(types.parse("api/invalidateTags"), Some(CacheOp::InvalidateTags));
        assert_eq!(types.parse("api/resetApiState"), Some(CacheOp::Reset));
        assert_eq!(types.parse("apix/subscribe"), None);
        assert_eq!(types.parse("other/subscribe"), None);
        assert_eq!(types.parse("api/getProducts/fulfilled"), None);
    }
}
