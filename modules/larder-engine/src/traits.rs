//! Core traits for the store.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::action::Action;
use crate::error::SliceError;
use crate::state::StateTree;
use crate::store::{Context, Next};

/// Pure state updates for one named slice of the tree. No I/O, no side
/// effects.
///
/// Called for every committed action. Slices own disjoint state and should
/// ignore actions they do not recognize.
pub trait Slice: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Default + Send;

    fn reduce(&self, state: &mut Self::State, action: &Action);

    /// Adjust state restored from durable storage before it enters the tree.
    fn on_rehydrate(&self, _state: &mut Self::State) {}
}

/// Reducer over the whole tree.
///
/// Implemented by `CombinedReducer` and by wrappers around it. `reduce`
/// returns a complete next tree or an error; it never applies half an
/// action.
pub trait RootReducer: Send + Sync + 'static {
    fn initial_state(&self) -> Result<StateTree, SliceError>;

    fn reduce(&self, state: &StateTree, action: &Action) -> Result<StateTree, SliceError>;

    /// Turn a persisted value for `key` into the value placed in the tree.
    fn rehydrate(&self, key: &str, value: Value) -> Result<Value, SliceError>;
}

/// Intercepts actions on their way to the reducer.
///
/// Call `next.run(action)` to pass the action on; code after that call
/// observes the committed state.
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, ctx: &Context<'_>, action: &Action, next: Next<'_>);
}

impl<M: Middleware + ?Sized> Middleware for std::sync::Arc<M> {
    fn handle(&self, ctx: &Context<'_>, action: &Action, next: Next<'_>) {
        (**self).handle(ctx, action, next)
    }
}
