//! The cache sub-tree and the slice that reduces it.

use std::collections::{BTreeMap, BTreeSet};

use larder_engine::{Action, Slice, StateTree};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::actions::{
    ActionTypes, CacheOp, Evict, InvalidateTags, QueryFulfilled, QueryPending, QueryRejected,
    Subscribe, Unsubscribe,
};
use crate::entry::{CacheEntry, EntryStatus, SubscriptionId};
use crate::fingerprint::Fingerprint;
use crate::tag::Tag;

/// Index slot for tags provided without an id.
const WITHOUT_ID: &str = "__without_id";

/// Everything the cache engine keeps in the state tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheState {
    pub entries: BTreeMap<Fingerprint, CacheEntry>,
    /// tag kind → tag id → entries providing that tag.
    pub provided: BTreeMap<String, BTreeMap<String, BTreeSet<Fingerprint>>>,
    pub subscriptions: BTreeMap<SubscriptionId, Fingerprint>,
}

impl CacheState {
    /// Read the cache sub-tree stored under `path`. A missing or malformed
    /// sub-tree reads as empty.
    pub fn from_tree(tree: &StateTree, path: &str) -> Self {
        match tree.slice::<CacheState>(path) {
            Ok(Some(state)) => state,
            Ok(None) => Self::default(),
            Err(err) => {
                warn!(path, error = %err, "Cache sub-tree does not decode, reading as empty");
                Self::default()
            }
        }
    }

    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<&CacheEntry> {
        self.entries.get(fingerprint)
    }

    /// Entries hit by invalidating any of `tags`.
    pub fn invalidated_by(&self, tags: &[Tag]) -> BTreeSet<Fingerprint> {
        let mut hit = BTreeSet::new();
        for tag in tags {
            let Some(by_id) = self.provided.get(&tag.kind) else {
                continue;
            };
            match &tag.id {
                None => hit.extend(by_id.values().flatten().cloned()),
                Some(id) => {
                    if let Some(fingerprints) = by_id.get(id) {
                        hit.extend(fingerprints.iter().cloned());
                    }
                }
            }
        }
        hit
    }

    fn index(&mut self, fingerprint: &Fingerprint, tag: &Tag) {
        self.provided
            .entry(tag.kind.clone())
            .or_default()
            .entry(tag.id.clone().unwrap_or_else(|| WITHOUT_ID.to_string()))
            .or_default()
            .insert(fingerprint.clone());
    }

    fn unindex(&mut self, fingerprint: &Fingerprint, tags: &BTreeSet<Tag>) {
        for tag in tags {
            let id = tag.id.as_deref().unwrap_or(WITHOUT_ID);
            let Some(by_id) = self.provided.get_mut(&tag.kind) else {
                continue;
            };
            if let Some(fingerprints) = by_id.get_mut(id) {
                fingerprints.remove(fingerprint);
                if fingerprints.is_empty() {
                    by_id.remove(id);
                }
            }
            if by_id.is_empty() {
                self.provided.remove(&tag.kind);
            }
        }
    }

    /// Attach subscribe-time tags. These are kept across refetches.
    fn declare_tags(&mut self, fingerprint: &Fingerprint, tags: &[Tag]) {
        let Some(entry) = self.entries.get_mut(fingerprint) else {
            return;
        };
        let added: Vec<Tag> = tags
            .iter()
            .filter(|tag| {
                entry.declared_tags.insert((*tag).clone());
                entry.tags.insert((*tag).clone())
            })
            .cloned()
            .collect();
        for tag in &added {
            self.index(fingerprint, tag);
        }
    }

    /// Replace the entry's tags with its declared tags plus `provided`,
    /// moving the index along with them.
    fn retag(&mut self, fingerprint: &Fingerprint, provided: Vec<Tag>) {
        let Some(entry) = self.entries.get_mut(fingerprint) else {
            return;
        };
        let mut next = entry.declared_tags.clone();
        next.extend(provided);
        let previous = std::mem::replace(&mut entry.tags, next.clone());

        let dropped: BTreeSet<Tag> = previous.difference(&next).cloned().collect();
        self.unindex(fingerprint, &dropped);
        for tag in next.difference(&previous) {
            self.index(fingerprint, tag);
        }
    }

    fn rebuild_index(&mut self) {
        self.provided.clear();
        let pairs: Vec<(Fingerprint, Tag)> = self
            .entries
            .iter()
            .flat_map(|(fp, entry)| entry.tags.iter().map(move |tag| (fp.clone(), tag.clone())))
            .collect();
        for (fingerprint, tag) in &pairs {
            self.index(fingerprint, tag);
        }
    }

    fn subscribe(&mut self, sub: Subscribe) {
        let fingerprint = Fingerprint::new(&sub.endpoint, &sub.args);
        let entry = self
            .entries
            .entry(fingerprint.clone())
            .or_insert_with(|| CacheEntry::new(&sub.endpoint, sub.args.clone()));
        entry.subscribers.insert(sub.subscription);
        self.subscriptions.insert(sub.subscription, fingerprint.clone());
        self.declare_tags(&fingerprint, &sub.tags);
    }

    fn unsubscribe(&mut self, unsub: Unsubscribe) {
        if let Some(entry) = self.entries.get_mut(&unsub.fingerprint) {
            entry.subscribers.remove(&unsub.subscription);
        }
        self.subscriptions.remove(&unsub.subscription);
    }

    fn pending(&mut self, pending: QueryPending) {
        let Some(entry) = self.entries.get_mut(&pending.fingerprint) else {
            debug!(fingerprint = %pending.fingerprint, "Pending for unknown entry, ignoring");
            return;
        };
        entry.status = EntryStatus::Loading;
        entry.request_id = Some(pending.request_id);
        entry.stale = false;
        entry.started_at = Some(pending.started_at);
    }

    fn fulfilled(&mut self, done: QueryFulfilled) {
        let Some(entry) = self.entries.get_mut(&done.fingerprint) else {
            return;
        };
        if entry.request_id != Some(done.request_id) {
            debug!(fingerprint = %done.fingerprint, "Dropping superseded result");
            return;
        }
        entry.request_id = None;
        entry.status = EntryStatus::Fulfilled { data: done.data };
        entry.fulfilled_at = Some(done.fulfilled_at);
        self.retag(&done.fingerprint, done.tags);
    }

    fn rejected(&mut self, failed: QueryRejected) {
        let Some(entry) = self.entries.get_mut(&failed.fingerprint) else {
            return;
        };
        if entry.request_id != Some(failed.request_id) {
            debug!(fingerprint = %failed.fingerprint, "Dropping superseded error");
            return;
        }
        entry.request_id = None;
        entry.status = EntryStatus::Errored {
            error: failed.error,
        };
    }

    /// Entries with subscribers go back to loading; the rest keep their
    /// result and are only flagged stale.
    fn invalidate(&mut self, invalidate: InvalidateTags) {
        for fingerprint in self.invalidated_by(&invalidate.tags) {
            if let Some(entry) = self.entries.get_mut(&fingerprint) {
                entry.stale = true;
                if !entry.subscribers.is_empty() {
                    entry.status = EntryStatus::Loading;
                }
            }
        }
    }

    fn evict(&mut self, evict: Evict) {
        let removable = self
            .entries
            .get(&evict.fingerprint)
            .is_some_and(|entry| entry.subscribers.is_empty() && !entry.is_fetching());
        if !removable {
            return;
        }
        if let Some(entry) = self.entries.remove(&evict.fingerprint) {
            self.unindex(&evict.fingerprint, &entry.tags);
        }
    }

    /// Restored cache: keep settled results only, forget every subscriber
    /// and in-flight request, and treat all of it as stale.
    fn restored(&mut self) {
        self.entries.retain(|_, entry| {
            matches!(
                entry.status,
                EntryStatus::Fulfilled { .. } | EntryStatus::Errored { .. }
            )
        });
        for entry in self.entries.values_mut() {
            entry.subscribers.clear();
            entry.request_id = None;
            entry.stale = true;
        }
        self.subscriptions.clear();
        self.rebuild_index();
    }
}

/// Reducer for the cache sub-tree.
pub struct CacheSlice {
    types: ActionTypes,
}

impl CacheSlice {
    pub fn new(reducer_path: impl Into<String>) -> Self {
        Self {
            types: ActionTypes::new(reducer_path),
        }
    }
}

fn decode<T: DeserializeOwned>(action: &Action) -> Option<T> {
    match action.decode() {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(action = action.kind(), error = %err, "Malformed cache action, ignoring");
            None
        }
    }
}

impl Slice for CacheSlice {
    type State = CacheState;

    fn reduce(&self, state: &mut CacheState, action: &Action) {
        let Some(op) = self.types.parse(action.kind()) else {
            return;
        };
        match op {
            CacheOp::Subscribe => decode(action).map(|p| state.subscribe(p)),
            CacheOp::Unsubscribe => decode(action).map(|p| state.unsubscribe(p)),
            CacheOp::QueryPending => decode(action).map(|p| state.pending(p)),
            CacheOp::QueryFulfilled => decode(action).map(|p| state.fulfilled(p)),
            CacheOp::QueryRejected => decode(action).map(|p| state.rejected(p)),
            CacheOp::InvalidateTags => decode(action).map(|p| state.invalidate(p)),
            CacheOp::Evict => decode(action).map(|p| state.evict(p)),
            CacheOp::Reset => {
                *state = CacheState::default();
                None
            }
            CacheOp::MutationFulfilled | CacheOp::MutationRejected => None,
        };
    }

    fn on_rehydrate(&self, state: &mut CacheState) {
        state.restored();
    }
}
