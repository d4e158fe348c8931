//! Non-fatal problems reported by the store and its collaborators.
//!
//! Diagnostics never interrupt dispatch. They are logged via `tracing` at the
//! point of origin and broadcast to anyone holding a receiver from
//! `Store::diagnostics`.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// An action payload held a value with no JSON form.
    NonSerializable {
        action: String,
        path: String,
        found: String,
    },
    /// The reducer rejected an action; the tree was left unchanged.
    ReducerFailed { action: String, error: String },
    /// Writing or removing the persisted snapshot failed.
    PersistFailed { key: String, error: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::NonSerializable {
                action,
                path,
                found,
            } => write!(
                f,
                "non-serializable value in action `{action}` at {path}: {found}"
            ),
            Diagnostic::ReducerFailed { action, error } => {
                write!(f, "reducer failed for action `{action}`: {error}")
            }
            Diagnostic::PersistFailed { key, error } => {
                write!(f, "persisting `{key}` failed: {error}")
            }
        }
    }
}
