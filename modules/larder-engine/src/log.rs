//! In-memory action log middleware.

use std::sync::Mutex;

use crate::action::Action;
use crate::store::{Context, Next};
use crate::traits::Middleware;

/// One action as seen by the log, after the rest of the chain ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedAction {
    pub kind: String,
    /// Revision of the tree once the action was handled.
    pub revision: u64,
}

/// Records every action passing through it, in apply order. Thread-safe.
///
/// Register it as `Arc<ActionLog>` to keep a handle for assertions.
#[derive(Debug, Default)]
pub struct ActionLog {
    entries: Mutex<Vec<LoggedAction>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LoggedAction> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Action types only, in order.
    pub fn kinds(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.kind).collect()
    }
}

impl Middleware for ActionLog {
    fn handle(&self, ctx: &Context<'_>, action: &Action, next: Next<'_>) {
        next.run(action);
        let revision = ctx.revision();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(LoggedAction {
                kind: action.kind().to_string(),
                revision,
            });
    }
}
