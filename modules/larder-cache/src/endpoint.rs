//! Endpoint registry and the `Api` handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use larder_common::{CacheConfig, Clock, SystemClock};
use larder_engine::{Action, StateTree, Store};
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::actions::{
    ActionTypes, CacheOp, InvalidateTags, MutationFulfilled, MutationRejected, Subscribe,
    Unsubscribe,
};
use crate::entry::{CacheEntry, RequestId, SubscriptionId};
use crate::error::{ApiError, ApiResult};
use crate::fetch::Fetcher;
use crate::fingerprint::Fingerprint;
use crate::middleware::CacheMiddleware;
use crate::state::{CacheSlice, CacheState};
use crate::tag::Tag;

type TagFn = Arc<dyn Fn(&Value, Option<&Value>) -> Vec<Tag> + Send + Sync>;
type RuleFn = Arc<dyn Fn(&Action) -> Vec<Tag> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Query,
    Mutation,
}

/// One named request. Queries provide tags to the entries they fill;
/// mutations invalidate tags once they succeed.
#[derive(Clone)]
pub struct Endpoint {
    name: String,
    kind: EndpointKind,
    tags: Vec<Tag>,
    tags_with: Option<TagFn>,
}

impl Endpoint {
    pub fn query(name: impl Into<String>) -> Self {
        Self::new(name, EndpointKind::Query)
    }

    pub fn mutation(name: impl Into<String>) -> Self {
        Self::new(name, EndpointKind::Mutation)
    }

    fn new(name: impl Into<String>, kind: EndpointKind) -> Self {
        Self {
            name: name.into(),
            kind,
            tags: Vec::new(),
            tags_with: None,
        }
    }

    /// Tags held by every entry of this query.
    pub fn provides(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Tags computed from the args and, once fulfilled, the result.
    pub fn provides_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, Option<&Value>) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.tags_with = Some(Arc::new(f));
        self
    }

    /// Tags invalidated after this mutation succeeds.
    pub fn invalidates(self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.provides(tags)
    }

    pub fn invalidates_with<F>(self, f: F) -> Self
    where
        F: Fn(&Value, Option<&Value>) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.provides_with(f)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn tags_for(&self, args: &Value, result: Option<&Value>) -> Vec<Tag> {
        let mut tags = self.tags.clone();
        if let Some(f) = &self.tags_with {
            tags.extend(f(args, result));
        }
        tags
    }
}

/// Invalidates tags whenever an action of type `kind` commits.
#[derive(Clone)]
pub(crate) struct InvalidateRule {
    pub(crate) kind: String,
    pub(crate) tags: RuleFn,
}

pub struct ApiBuilder {
    reducer_path: String,
    endpoints: HashMap<String, Endpoint>,
    rules: Vec<InvalidateRule>,
    keep_unused_for: Duration,
    clock: Arc<dyn Clock>,
}

impl ApiBuilder {
    pub fn new(reducer_path: impl Into<String>) -> Self {
        Self {
            reducer_path: reducer_path.into(),
            endpoints: HashMap::new(),
            rules: Vec::new(),
            keep_unused_for: CacheConfig::default().keep_unused_for(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Reducer path and grace period from configuration.
    pub fn with_config(config: &CacheConfig) -> Self {
        Self::new(config.reducer_path.clone()).keep_unused_for(config.keep_unused_for())
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.insert(endpoint.name.clone(), endpoint);
        self
    }

    /// Invalidate the tags returned by `f` after any action of type `kind`
    /// commits.
    pub fn invalidate_on<F>(mut self, kind: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Action) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.rules.push(InvalidateRule {
            kind: kind.into(),
            tags: Arc::new(f),
        });
        self
    }

    /// How long an entry with no subscribers is kept before eviction.
    pub fn keep_unused_for(mut self, grace: Duration) -> Self {
        self.keep_unused_for = grace;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self, fetcher: impl Fetcher) -> Api {
        info!(
            reducer_path = self.reducer_path.as_str(),
            endpoints = self.endpoints.len(),
            keep_unused_for_ms = self.keep_unused_for.as_millis() as u64,
            "Cache api built"
        );
        Api {
            inner: Arc::new(ApiInner {
                types: ActionTypes::new(self.reducer_path.clone()),
                reducer_path: self.reducer_path,
                endpoints: self.endpoints,
                rules: self.rules,
                keep_unused_for: self.keep_unused_for,
                clock: self.clock,
                fetcher: Arc::new(fetcher),
                in_flight: Mutex::new(HashMap::new()),
                evictions: Mutex::new(HashMap::new()),
            }),
        }
    }
}

pub(crate) struct ApiInner {
    pub(crate) types: ActionTypes,
    pub(crate) reducer_path: String,
    pub(crate) endpoints: HashMap<String, Endpoint>,
    pub(crate) rules: Vec<InvalidateRule>,
    pub(crate) keep_unused_for: Duration,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    /// Fetches started but not yet settled, by entry.
    pub(crate) in_flight: Mutex<HashMap<Fingerprint, RequestId>>,
    /// Pending eviction timers, by entry.
    pub(crate) evictions: Mutex<HashMap<Fingerprint, AbortHandle>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A live subscription. Hand it back to `Api::unsubscribe` when done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub fingerprint: Fingerprint,
}

/// Handle to one cache engine: its endpoints, its slice, its middleware.
/// Cheap to clone.
#[derive(Clone)]
pub struct Api {
    pub(crate) inner: Arc<ApiInner>,
}

impl Api {
    pub fn builder(reducer_path: impl Into<String>) -> ApiBuilder {
        ApiBuilder::new(reducer_path)
    }

    pub fn reducer_path(&self) -> &str {
        &self.inner.reducer_path
    }

    pub fn action_types(&self) -> &ActionTypes {
        &self.inner.types
    }

    /// The slice to register under `reducer_path`.
    pub fn slice(&self) -> CacheSlice {
        CacheSlice::new(self.inner.reducer_path.clone())
    }

    pub fn middleware(&self) -> CacheMiddleware {
        CacheMiddleware::new(self.clone())
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.inner.endpoints.get(name)
    }

    pub fn fingerprint(&self, endpoint: &str, args: &Value) -> Fingerprint {
        Fingerprint::new(endpoint, args)
    }

    /// Eviction timers armed and not yet fired or cancelled.
    pub fn scheduled_evictions(&self) -> usize {
        lock(&self.inner.evictions).len()
    }

    fn query_endpoint(&self, name: &str) -> ApiResult<&Endpoint> {
        let endpoint = self
            .endpoint(name)
            .ok_or_else(|| ApiError::UnknownEndpoint(name.to_string()))?;
        match endpoint.kind {
            EndpointKind::Query => Ok(endpoint),
            EndpointKind::Mutation => Err(ApiError::NotAQuery(name.to_string())),
        }
    }

    fn mutation_endpoint(&self, name: &str) -> ApiResult<&Endpoint> {
        let endpoint = self
            .endpoint(name)
            .ok_or_else(|| ApiError::UnknownEndpoint(name.to_string()))?;
        match endpoint.kind {
            EndpointKind::Mutation => Ok(endpoint),
            EndpointKind::Query => Err(ApiError::NotAMutation(name.to_string())),
        }
    }

    /// Subscribe to `endpoint(args)`. Creates the entry on first use and
    /// starts a fetch if the entry has no usable result.
    pub fn subscribe(&self, store: &Store, endpoint: &str, args: Value) -> ApiResult<Subscription> {
        let tags = self.query_endpoint(endpoint)?.tags_for(&args, None);
        self.subscribe_tagged(store, endpoint, args, tags)
    }

    /// Like `subscribe`, with extra tags attached to the entry up front.
    pub fn subscribe_tagged(
        &self,
        store: &Store,
        endpoint: &str,
        args: Value,
        tags: Vec<Tag>,
    ) -> ApiResult<Subscription> {
        self.query_endpoint(endpoint)?;
        let subscription = Subscription {
            id: SubscriptionId::new(),
            fingerprint: self.fingerprint(endpoint, &args),
        };
        let action = self.inner.types.build(
            CacheOp::Subscribe,
            &Subscribe {
                subscription: subscription.id,
                endpoint: endpoint.to_string(),
                args,
                tags,
            },
        )?;
        store.dispatch(action);
        Ok(subscription)
    }

    pub fn unsubscribe(&self, store: &Store, subscription: Subscription) -> ApiResult<()> {
        let action = self.inner.types.build(
            CacheOp::Unsubscribe,
            &Unsubscribe {
                subscription: subscription.id,
                fingerprint: subscription.fingerprint,
            },
        )?;
        store.dispatch(action);
        Ok(())
    }

    pub fn invalidate_tags(&self, store: &Store, tags: Vec<Tag>) -> ApiResult<()> {
        let action = self
            .inner
            .types
            .build(CacheOp::InvalidateTags, &InvalidateTags { tags })?;
        store.dispatch(action);
        Ok(())
    }

    /// Drop every entry and cancel pending evictions.
    pub fn reset(&self, store: &Store) {
        store.dispatch(Action::new(self.inner.types.kind(CacheOp::Reset)));
    }

    /// The whole cache sub-tree of `tree`.
    pub fn state(&self, tree: &StateTree) -> CacheState {
        CacheState::from_tree(tree, &self.inner.reducer_path)
    }

    /// One entry of `tree`, decoded on its own.
    pub fn read(&self, tree: &StateTree, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let raw = tree
            .get(&self.inner.reducer_path)?
            .get("entries")?
            .get(fingerprint.as_str())?;
        match serde_json::from_value(raw.clone()) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(fingerprint = %fingerprint, error = %err, "Entry does not decode");
                None
            }
        }
    }

    /// The entry for `endpoint(args)` in the store's latest state.
    pub fn select(&self, store: &Store, endpoint: &str, args: &Value) -> Option<CacheEntry> {
        self.read(&store.get_state(), &self.fingerprint(endpoint, args))
    }

    /// Wait until the entry exists and holds a settled result. `None` if the
    /// store goes away first.
    pub async fn settled(&self, store: &Store, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut commits = store.watch();
        loop {
            let entry = {
                let committed = commits.borrow_and_update();
                self.read(&committed.tree, fingerprint)
            };
            if let Some(entry) = entry.filter(CacheEntry::is_settled) {
                return Some(entry);
            }
            if commits.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Subscribe, wait for a result, unsubscribe. The entry stays cached for
    /// the grace period.
    pub async fn query(&self, store: &Store, endpoint: &str, args: Value) -> ApiResult<Value> {
        let subscription = self.subscribe(store, endpoint, args)?;
        let entry = self.settled(store, &subscription.fingerprint).await;
        self.unsubscribe(store, subscription)?;
        let entry = entry.ok_or(ApiError::StoreClosed)?;
        match (entry.data(), entry.error()) {
            (Some(data), _) => Ok(data.clone()),
            (None, Some(error)) => Err(ApiError::Fetch(error.clone())),
            (None, None) => Ok(Value::Null),
        }
    }

    /// Run a mutation. On success, the tags it invalidates are invalidated
    /// once the `mutationFulfilled` action has committed.
    pub async fn mutate(&self, store: &Store, endpoint: &str, args: Value) -> ApiResult<Value> {
        self.mutation_endpoint(endpoint)?;
        match self.inner.fetcher.execute(endpoint, &args).await {
            Ok(data) => {
                let action = self.inner.types.build(
                    CacheOp::MutationFulfilled,
                    &MutationFulfilled {
                        endpoint: endpoint.to_string(),
                        args,
                        data: data.clone(),
                    },
                )?;
                store.dispatch(action);
                Ok(data)
            }
            Err(error) => {
                let action = self.inner.types.build(
                    CacheOp::MutationRejected,
                    &MutationRejected {
                        endpoint: endpoint.to_string(),
                        args,
                        error: error.clone(),
                    },
                )?;
                store.dispatch(action);
                Err(ApiError::Fetch(error))
            }
        }
    }
}
