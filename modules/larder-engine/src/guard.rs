//! Serializability guard middleware.

use std::collections::HashSet;

use tracing::warn;

use crate::action::Action;
use crate::diagnostics::Diagnostic;
use crate::store::{Context, Next};
use crate::traits::Middleware;

/// Warns about action payloads that hold values with no JSON form.
///
/// Violations are reported, never enforced: the action still reaches the
/// reducer. Action types on the ignore list are not inspected at all.
#[derive(Debug, Default)]
pub struct SerializabilityGuard {
    ignored_actions: HashSet<String>,
}

impl SerializabilityGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip inspection for these action types.
    pub fn ignore_actions<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_actions.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn is_ignored(&self, kind: &str) -> bool {
        self.ignored_actions.contains(kind)
    }
}

impl Middleware for SerializabilityGuard {
    fn handle(&self, ctx: &Context<'_>, action: &Action, next: Next<'_>) {
        if !self.is_ignored(action.kind()) {
            if let Some(violation) = action.payload().find_non_serializable() {
                warn!(
                    action = action.kind(),
                    path = violation.path.as_str(),
                    found = violation.found.as_str(),
                    "Non-serializable value in action payload"
                );
                ctx.report(Diagnostic::NonSerializable {
                    action: action.kind().to_string(),
                    path: violation.path,
                    found: violation.found,
                });
            }
        }
        next.run(action);
    }
}
