//! Single-writer state store.
//!
//! Actions flow through an ordered middleware chain into a composed reducer
//! that owns the whole state tree: dispatch → middleware → reduce → commit →
//! notify. Actions dispatched while another is being applied are queued and
//! applied in order, one at a time.
//!
//! Consumers define their domain by implementing `Slice` (pure state updates
//! for one named key) and, where they need side effects, `Middleware`.

pub mod action;
pub mod combine;
pub mod diagnostics;
pub mod error;
pub mod guard;
pub mod log;
pub mod state;
pub mod store;
pub mod traits;

pub use action::{Action, Opaque, Payload, Violation};
pub use combine::CombinedReducer;
pub use diagnostics::Diagnostic;
pub use error::{PayloadError, SliceError};
pub use guard::SerializabilityGuard;
pub use log::{ActionLog, LoggedAction};
pub use state::StateTree;
pub use store::{Committed, Context, Dispatched, Dispatcher, ListenerId, Next, Store, StoreBuilder};
pub use traits::{Middleware, RootReducer, Slice};
