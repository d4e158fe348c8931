//! Reducer composition: many named slices, one tree.

use serde::Deserialize;
use serde_json::Value;

use crate::action::Action;
use crate::error::SliceError;
use crate::state::StateTree;
use crate::traits::{RootReducer, Slice};

trait ErasedSlice: Send + Sync {
    fn initial(&self, key: &str) -> Result<Value, SliceError>;
    fn reduce(&self, key: &str, current: Option<&Value>, action: &Action)
        -> Result<Value, SliceError>;
    fn rehydrate(&self, key: &str, value: Value) -> Result<Value, SliceError>;
}

struct Erased<S>(S);

impl<S: Slice> Erased<S> {
    fn decode(key: &str, value: &Value) -> Result<S::State, SliceError> {
        S::State::deserialize(value).map_err(|source| SliceError::Decode {
            key: key.to_string(),
            source,
        })
    }

    fn encode(key: &str, state: &S::State) -> Result<Value, SliceError> {
        serde_json::to_value(state).map_err(|source| SliceError::Encode {
            key: key.to_string(),
            source,
        })
    }
}

impl<S: Slice> ErasedSlice for Erased<S> {
    fn initial(&self, key: &str) -> Result<Value, SliceError> {
        Self::encode(key, &S::State::default())
    }

    fn reduce(
        &self,
        key: &str,
        current: Option<&Value>,
        action: &Action,
    ) -> Result<Value, SliceError> {
        let mut state = match current {
            Some(value) => Self::decode(key, value)?,
            None => S::State::default(),
        };
        self.0.reduce(&mut state, action);
        Self::encode(key, &state)
    }

    fn rehydrate(&self, key: &str, value: Value) -> Result<Value, SliceError> {
        let mut state = Self::decode(key, &value)?;
        self.0.on_rehydrate(&mut state);
        Self::encode(key, &state)
    }
}

/// Combines slices under stable top-level keys.
///
/// Keys in the tree that no slice owns (such as persistence metadata) are
/// carried through untouched.
#[derive(Default)]
pub struct CombinedReducer {
    slices: Vec<(String, Box<dyn ErasedSlice>)>,
}

impl CombinedReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `slice` under `key`. A second registration for the same key
    /// replaces the first.
    pub fn slice<S: Slice>(mut self, key: impl Into<String>, slice: S) -> Self {
        let key = key.into();
        let erased: Box<dyn ErasedSlice> = Box::new(Erased(slice));
        match self.slices.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => {
                tracing::warn!(key = key.as_str(), "slice registered twice, replacing");
                existing.1 = erased;
            }
            None => self.slices.push((key, erased)),
        }
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slices.iter().map(|(k, _)| k.as_str())
    }
}

impl RootReducer for CombinedReducer {
    fn initial_state(&self) -> Result<StateTree, SliceError> {
        self.slices
            .iter()
            .map(|(key, slice)| Ok((key.clone(), slice.initial(key)?)))
            .collect()
    }

    fn reduce(&self, state: &StateTree, action: &Action) -> Result<StateTree, SliceError> {
        let mut next = state.clone();
        for (key, slice) in &self.slices {
            let value = slice.reduce(key, state.get(key), action)?;
            next.insert(key.clone(), value);
        }
        Ok(next)
    }

    fn rehydrate(&self, key: &str, value: Value) -> Result<Value, SliceError> {
        let (_, slice) = self
            .slices
            .iter()
            .find(|(k, _)| k == key)
            .ok_or_else(|| SliceError::UnknownKey(key.to_string()))?;
        slice.rehydrate(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: i64,
    }

    struct CounterSlice;

    impl Slice for CounterSlice {
        type State = Counter;

        fn reduce(&self, state: &mut Counter, action: &Action) {
            if action.is("counter/increment") {
                state.value += 1;
            }
        }

        fn on_rehydrate(&self, state: &mut Counter) {
            state.value = state.value.max(0);
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Names(Vec<String>);

    struct NamesSlice;

    impl Slice for NamesSlice {
        type State = Names;

        fn reduce(&self, state: &mut Names, action: &Action) {
            if action.is("names/add") {
                if let Some(name) = action.payload().as_str() {
                    state.0.push(name.to_string());
                }
            }
        }
    }

    fn reducer() -> CombinedReducer {
        CombinedReducer::new()
            .slice("counter", CounterSlice)
            .slice("names", NamesSlice)
    }

    #[test]
    fn initial_state_has_every_slice_default() {
        let tree = reducer().initial_state().unwrap();
        assert_eq!(tree.get("counter"), Some(&json!({"value": 0})));
        assert_eq!(tree.get("names"), Some(&json!([])));
    }

    #[test]
    fn each_slice_sees_every_action() {
        let r = reducer();
        let tree = r.initial_state().unwrap();
        let tree = r.reduce(&tree, &Action::new("counter/increment")).unwrap();
        let tree = r
            .reduce(&tree, &Action::new("names/add").with_payload("ada"))
            .unwrap();

        assert_eq!(tree.get("counter"), Some(&json!({"value": 1})));
        assert_eq!(tree.get("names"), Some(&json!(["ada"])));
    }

    #[test]
    fn unowned_keys_pass_through() {
        let r = reducer();
        let mut tree = r.initial_state().unwrap();
        tree.insert("_meta", json!({"v": 1}));
        let next = r.reduce(&tree, &Action::new("counter/increment")).unwrap();
        assert_eq!(next.get("_meta"), Some(&json!({"v": 1})));
    }

    #[test]
    fn corrupt_slice_state_fails_the_whole_reduce() {
        let r = reducer();
        let mut tree = r.initial_state().unwrap();
        tree.insert("counter", json!("not a counter"));
        let err = r.reduce(&tree, &Action::new("names/add")).unwrap_err();
        assert!(matches!(err, SliceError::Decode { ref key, .. } if key == "counter"));
    }

    #[test]
    fn rehydrate_runs_slice_hook() {
        let r = reducer();
        let value = r.rehydrate("counter", json!({"value": -4})).unwrap();
        assert_eq!(value, json!({"value": 0}));
        assert!(matches!(
            r.rehydrate("missing", json!(null)),
            Err(SliceError::UnknownKey(_))
        ));
    }
}
