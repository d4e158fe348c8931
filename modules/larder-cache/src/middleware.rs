//! The cache middleware: starts fetches, schedules evictions and turns
//! committed actions into tag invalidations.
//!
//! Every reaction runs after `next.run`, so it sees the committed state of
//! the action that triggered it. Follow-up actions go through the queue and
//! network results come back as dispatched actions; nothing here writes to
//! the tree directly.

use larder_engine::{Action, Context, Dispatcher, Middleware, Next};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::actions::{
    CacheOp, Evict, InvalidateTags, MutationFulfilled, QueryFulfilled, QueryPending,
    QueryRejected, Subscribe, Unsubscribe,
};
use crate::endpoint::{lock, Api};
use crate::entry::RequestId;
use crate::error::FetchError;
use crate::fingerprint::Fingerprint;
use crate::tag::Tag;

/// Identity of a settled query result, shared by fulfilled and rejected
/// payloads.
#[derive(Deserialize)]
struct Settled {
    fingerprint: Fingerprint,
    request_id: RequestId,
}

pub struct CacheMiddleware {
    api: Api,
}

impl CacheMiddleware {
    pub(crate) fn new(api: Api) -> Self {
        Self { api }
    }

    fn on_cache_action(&self, ctx: &Context<'_>, op: CacheOp, action: &Action) {
        match op {
            CacheOp::Subscribe => {
                if let Some(sub) = decode::<Subscribe>(action) {
                    let fingerprint = Fingerprint::new(&sub.endpoint, &sub.args);
                    self.cancel_eviction(&fingerprint);
                    self.start_if_needed(ctx, &fingerprint);
                }
            }
            CacheOp::Unsubscribe => {
                if let Some(unsub) = decode::<Unsubscribe>(action) {
                    self.release_if_unused(ctx, &unsub.fingerprint);
                }
            }
            CacheOp::QueryFulfilled | CacheOp::QueryRejected => {
                if let Some(settled) = decode::<Settled>(action) {
                    self.on_settled(ctx, settled);
                }
            }
            CacheOp::InvalidateTags => {
                if let Some(invalidate) = decode::<InvalidateTags>(action) {
                    let state = self.api.state(&ctx.state());
                    for fingerprint in state.invalidated_by(&invalidate.tags) {
                        self.start_if_needed(ctx, &fingerprint);
                    }
                }
            }
            CacheOp::MutationFulfilled => {
                if let Some(done) = decode::<MutationFulfilled>(action) {
                    let tags = self
                        .api
                        .endpoint(&done.endpoint)
                        .map(|endpoint| endpoint.tags_for(&done.args, Some(&done.data)))
                        .unwrap_or_default();
                    self.invalidate(ctx, tags);
                }
            }
            CacheOp::Reset => {
                for (_, timer) in lock(&self.api.inner.evictions).drain() {
                    timer.abort();
                }
                lock(&self.api.inner.in_flight).clear();
            }
            CacheOp::QueryPending | CacheOp::Evict | CacheOp::MutationRejected => {}
        }
    }

    fn on_settled(&self, ctx: &Context<'_>, settled: Settled) {
        {
            let mut in_flight = lock(&self.api.inner.in_flight);
            if in_flight.get(&settled.fingerprint) == Some(&settled.request_id) {
                in_flight.remove(&settled.fingerprint);
            }
        }
        let Some(entry) = self.api.read(&ctx.state(), &settled.fingerprint) else {
            return;
        };
        if entry.subscribers.is_empty() {
            self.release_if_unused(ctx, &settled.fingerprint);
        } else if entry.stale {
            // Invalidated while the request was in flight.
            self.start_if_needed(ctx, &settled.fingerprint);
        }
    }

    fn invalidate(&self, ctx: &Context<'_>, tags: Vec<Tag>) {
        if tags.is_empty() {
            return;
        }
        if let Some(action) = self.build(CacheOp::InvalidateTags, &InvalidateTags { tags }) {
            ctx.dispatch(action);
        }
    }

    /// Start a fetch for `fingerprint` unless nobody is subscribed, the
    /// entry already holds a usable result, or a fetch is already running.
    fn start_if_needed(&self, ctx: &Context<'_>, fingerprint: &Fingerprint) {
        let Some(entry) = self.api.read(&ctx.state(), fingerprint) else {
            return;
        };
        if entry.subscribers.is_empty() || entry.is_fetching() || !entry.wants_fetch() {
            return;
        }

        let request_id = RequestId::new();
        {
            let mut in_flight = lock(&self.api.inner.in_flight);
            if in_flight.contains_key(fingerprint) {
                return;
            }
            in_flight.insert(fingerprint.clone(), request_id);
        }

        let pending = QueryPending {
            fingerprint: fingerprint.clone(),
            request_id,
            started_at: self.api.inner.clock.now(),
        };
        let Some(action) = self.build(CacheOp::QueryPending, &pending) else {
            lock(&self.api.inner.in_flight).remove(fingerprint);
            return;
        };
        ctx.dispatch(action);
        debug!(fingerprint = %fingerprint, request_id = %request_id, "Fetch started");

        let dispatcher = ctx.dispatcher();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_fetch(
                    self.api.clone(),
                    dispatcher,
                    fingerprint.clone(),
                    entry.endpoint,
                    entry.args,
                    request_id,
                ));
            }
            Err(_) => {
                warn!(fingerprint = %fingerprint, "No async runtime, failing fetch");
                let rejected = QueryRejected {
                    fingerprint: fingerprint.clone(),
                    request_id,
                    error: FetchError::Network {
                        message: "no async runtime available".to_string(),
                    },
                };
                if let Some(action) = self.build(CacheOp::QueryRejected, &rejected) {
                    ctx.dispatch(action);
                }
            }
        }
    }

    /// Arm the eviction timer once nobody is subscribed and nothing is in
    /// flight. An in-flight entry is re-checked when its result lands.
    fn release_if_unused(&self, ctx: &Context<'_>, fingerprint: &Fingerprint) {
        let Some(entry) = self.api.read(&ctx.state(), fingerprint) else {
            return;
        };
        if !entry.subscribers.is_empty() || entry.is_fetching() {
            return;
        }
        let Some(evict) = self.build(
            CacheOp::Evict,
            &Evict {
                fingerprint: fingerprint.clone(),
            },
        ) else {
            return;
        };

        let Ok(handle) = Handle::try_current() else {
            debug!(fingerprint = %fingerprint, "No async runtime, evicting now");
            ctx.dispatch(evict);
            return;
        };
        let dispatcher = ctx.dispatcher();
        let grace = self.api.inner.keep_unused_for;
        let api = self.api.clone();
        let key = fingerprint.clone();
        // Spawn and register under the lock, so the timer cannot look for
        // its own handle before it is in the map.
        let mut evictions = lock(&self.api.inner.evictions);
        let timer = handle.spawn(async move {
            tokio::time::sleep(grace).await;
            {
                let mut evictions = lock(&api.inner.evictions);
                if evictions
                    .get(&key)
                    .is_some_and(|timer| Some(timer.id()) == tokio::task::try_id())
                {
                    evictions.remove(&key);
                }
            }
            dispatcher.dispatch(evict);
        });
        if let Some(previous) = evictions.insert(fingerprint.clone(), timer.abort_handle()) {
            previous.abort();
        }
        drop(evictions);
        debug!(fingerprint = %fingerprint, grace_ms = grace.as_millis() as u64, "Eviction scheduled");
    }

    fn cancel_eviction(&self, fingerprint: &Fingerprint) {
        if let Some(timer) = lock(&self.api.inner.evictions).remove(fingerprint) {
            timer.abort();
            debug!(fingerprint = %fingerprint, "Eviction cancelled");
        }
    }

    fn apply_rules(&self, ctx: &Context<'_>, action: &Action) {
        for rule in &self.api.inner.rules {
            if rule.kind == action.kind() {
                self.invalidate(ctx, (rule.tags)(action));
            }
        }
    }

    fn build<T: Serialize>(&self, op: CacheOp, payload: &T) -> Option<Action> {
        match self.api.inner.types.build(op, payload) {
            Ok(action) => Some(action),
            Err(err) => {
                warn!(op = op.name(), error = %err, "Failed to build cache action");
                None
            }
        }
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: &Context<'_>, action: &Action, next: Next<'_>) {
        next.run(action);
        match self.api.inner.types.parse(action.kind()) {
            Some(op) => self.on_cache_action(ctx, op, action),
            None => self.apply_rules(ctx, action),
        }
    }
}

fn decode<T: DeserializeOwned>(action: &Action) -> Option<T> {
    match action.decode() {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(action = action.kind(), error = %err, "Malformed cache action");
            None
        }
    }
}

/// Runs outside the dispatch loop; the only way back in is the dispatcher.
async fn run_fetch(
    api: Api,
    dispatcher: Dispatcher,
    fingerprint: Fingerprint,
    endpoint: String,
    args: Value,
    request_id: RequestId,
) {
    let outcome = api.inner.fetcher.execute(&endpoint, &args).await;
    let types = &api.inner.types;
    let action = match outcome {
        Ok(data) => {
            let tags = api
                .endpoint(&endpoint)
                .map(|e| e.tags_for(&args, Some(&data)))
                .unwrap_or_default();
            types.build(
                CacheOp::QueryFulfilled,
                &QueryFulfilled {
                    fingerprint: fingerprint.clone(),
                    request_id,
                    data,
                    tags,
                    fulfilled_at: api.inner.clock.now(),
                },
            )
        }
        Err(error) => {
            debug!(fingerprint = %fingerprint, error = %error, "Fetch failed");
            types.build(
                CacheOp::QueryRejected,
                &QueryRejected {
                    fingerprint: fingerprint.clone(),
                    request_id,
                    error,
                },
            )
        }
    };

    match action {
        Ok(action) => {
            if dispatcher.dispatch(action).is_none() {
                debug!(fingerprint = %fingerprint, "Store dropped before fetch settled");
            }
        }
        Err(err) => {
            warn!(fingerprint = %fingerprint, error = %err, "Failed to build fetch result");
            lock(&api.inner.in_flight).remove(&fingerprint);
        }
    }
}
