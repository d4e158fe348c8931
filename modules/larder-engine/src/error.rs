//! Typed errors for the store core.

use thiserror::Error;

/// Errors converting an action payload to JSON or a typed value.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not serializable at {path}: {found}")]
    NotSerializable { path: String, found: String },

    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors moving slice state in and out of the tree.
#[derive(Debug, Error)]
pub enum SliceError {
    /// The value stored under `key` does not match the slice's state type.
    #[error("slice `{key}`: stored state does not decode: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The slice's state could not be written back as JSON.
    #[error("slice `{key}`: state does not encode: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no slice registered under `{0}`")]
    UnknownKey(String),
}
