//! Lifecycle actions and the reducer wrapper that applies a restored
//! snapshot.

use larder_engine::{Action, Opaque, Payload, RootReducer, SliceError, StateTree};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{PersistConfig, META_KEY};

/// Dispatched when the boot sequence starts.
pub const PERSIST: &str = "persist/PERSIST";
/// Dispatched once with whatever was restored from storage.
pub const REHYDRATE: &str = "persist/REHYDRATE";
/// Action types carrying adapter-internal markers. Exempt them from the
/// serializability guard.
pub const LIFECYCLE_ACTIONS: [&str; 2] = [PERSIST, REHYDRATE];

/// Marker carried by `persist/PERSIST`.
#[derive(Debug)]
struct BootMarker {
    version: u32,
}

/// Marker carried by `persist/REHYDRATE`: the restored snapshot, or `None`
/// on a cold start.
#[derive(Debug)]
struct Restored(Option<StateTree>);

pub fn persist_action(config: &PersistConfig) -> Action {
    let payload: Payload = [
        ("key", Payload::from(config.key.as_str())),
        (
            "marker",
            Opaque::new(BootMarker {
                version: config.version,
            })
            .into(),
        ),
    ]
    .into_iter()
    .collect();
    Action::new(PERSIST).with_payload(payload)
}

pub fn rehydrate_action(config: &PersistConfig, restored: Option<StateTree>) -> Action {
    let payload: Payload = [
        ("key", Payload::from(config.key.as_str())),
        ("restored", Opaque::new(Restored(restored)).into()),
    ]
    .into_iter()
    .collect();
    Action::new(REHYDRATE).with_payload(payload)
}

fn marker<'a, T: 'static>(action: &'a Action, field: &str) -> Option<&'a T> {
    action.payload().get(field)?.as_opaque()?.downcast_ref::<T>()
}

fn meta(version: u32, rehydrated: bool) -> Value {
    json!({ "version": version, "rehydrated": rehydrated })
}

/// Wraps a root reducer so the restore action replaces the persisted keys
/// and nothing else.
pub struct PersistedReducer<R> {
    config: PersistConfig,
    inner: R,
}

pub fn persist_reducer<R: RootReducer>(config: PersistConfig, inner: R) -> PersistedReducer<R> {
    PersistedReducer { config, inner }
}

impl<R> PersistedReducer<R> {
    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: RootReducer> PersistedReducer<R> {
    fn restore(&self, next: &mut StateTree, restored: &StateTree) {
        for (key, value) in restored.iter() {
            if !self.config.is_persisted(key) {
                debug!(key, "Skipping restored key that is not persisted");
                continue;
            }
            match self.inner.rehydrate(key, value.clone()) {
                Ok(value) => {
                    next.insert(key, value);
                }
                Err(err) => {
                    warn!(key, error = %err, "Dropping restored value, keeping default");
                }
            }
        }
    }
}

impl<R: RootReducer> RootReducer for PersistedReducer<R> {
    fn initial_state(&self) -> Result<StateTree, SliceError> {
        let mut tree = self.inner.initial_state()?;
        tree.insert(META_KEY, meta(self.config.version, false));
        Ok(tree)
    }

    fn reduce(&self, state: &StateTree, action: &Action) -> Result<StateTree, SliceError> {
        let mut next = self.inner.reduce(state, action)?;
        match action.kind() {
            PERSIST => {
                let version = marker::<BootMarker>(action, "marker")
                    .map(|m| m.version)
                    .unwrap_or(self.config.version);
                next.insert(META_KEY, meta(version, false));
            }
            REHYDRATE => {
                if let Some(Restored(Some(restored))) = marker::<Restored>(action, "restored") {
                    self.restore(&mut next, restored);
                }
                next.insert(META_KEY, meta(self.config.version, true));
            }
            _ => {}
        }
        Ok(next)
    }

    fn rehydrate(&self, key: &str, value: Value) -> Result<Value, SliceError> {
        self.inner.rehydrate(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistMeta;
    use larder_engine::{CombinedReducer, Slice};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Auth {
        token: Option<String>,
    }

    struct AuthSlice;

    impl Slice for AuthSlice {
        type State = Auth;

        fn reduce(&self, state: &mut Auth, action: &Action) {
            if action.is("auth/loggedIn") {
                state.token = action
                    .payload()
                    .get("token")
                    .and_then(|t| t.as_str())
                    .map(str::to_string);
            }
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Ui {
        drawer_open: bool,
    }

    struct UiSlice;

    impl Slice for UiSlice {
        type State = Ui;

        fn reduce(&self, state: &mut Ui, action: &Action) {
            if action.is("ui/toggled") {
                state.drawer_open = !state.drawer_open;
            }
        }
    }

    fn reducer() -> PersistedReducer<CombinedReducer> {
        persist_reducer(
            PersistConfig::new("root").blacklist(["ui"]),
            CombinedReducer::new()
                .slice("auth", AuthSlice)
                .slice("ui", UiSlice),
        )
    }

    fn restored(entries: Vec<(&str, Value)>) -> StateTree {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn initial_state_carries_meta() {
        let tree = reducer().initial_state().unwrap();
        assert_eq!(tree.get(META_KEY), Some(&meta(1, false)));
        assert!(tree.contains_key("auth"));
    }

    #[test]
    fn rehydrate_replaces_only_persisted_keys() {
        let reducer = reducer();
        let mut tree = reducer.initial_state().unwrap();
        tree = reducer
            .reduce(&tree, &Action::new("ui/toggled"))
            .unwrap();

        let action = rehydrate_action(
            reducer.config(),
            Some(restored(vec![
                ("auth", json!({"token": "abc"})),
                ("ui", json!({"drawer_open": false})),
            ])),
        );
        let next = reducer.reduce(&tree, &action).unwrap();

        assert_eq!(next.get("auth"), Some(&json!({"token": "abc"})));
        assert_eq!(next.get("ui"), Some(&json!({"drawer_open": true})));
        assert_eq!(
            PersistMeta::read(&next),
            Some(PersistMeta {
                version: 1,
                rehydrated: true
            })
        );
    }

    #[test]
    fn undecodable_values_are_dropped() {
        let reducer = reducer();
        let tree = reducer.initial_state().unwrap();
        let action = rehydrate_action(
            reducer.config(),
            Some(restored(vec![
                ("auth", json!(42)),
                ("unknown", json!({"x": 1})),
            ])),
        );

        let next = reducer.reduce(&tree, &action).unwrap();

        assert_eq!(next.get("auth"), Some(&json!({"token": null})));
        assert!(!next.contains_key("unknown"));
    }

    #[test]
    fn cold_start_only_flips_the_meta_flag() {
        let reducer = reducer();
        let tree = reducer.initial_state().unwrap();
        let persisted = reducer
            .reduce(&tree, &persist_action(reducer.config()))
            .unwrap();
        let next = reducer
            .reduce(&persisted, &rehydrate_action(reducer.config(), None))
            .unwrap();

        assert_eq!(next.get("auth"), tree.get("auth"));
        assert_eq!(next.get(META_KEY), Some(&meta(1, true)));
    }

    #[test]
    fn lifecycle_payloads_are_not_serializable() {
        let config = PersistConfig::new("root");
        for action in [persist_action(&config), rehydrate_action(&config, None)] {
            assert!(action.payload().find_non_serializable().is_some());
        }
    }
}
