//! Typed errors for the cache engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failed fetch. Stored on the cache entry, so it must serialize.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchError {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never got a response.
    #[error("network error: {message}")]
    Network { message: String },

    #[error("request timed out")]
    Timeout,

    /// The response body was not valid JSON.
    #[error("invalid response body: {message}")]
    Decode { message: String },

    /// The fetcher has no route for this endpoint.
    #[error("unknown endpoint `{endpoint}`")]
    UnknownEndpoint { endpoint: String },

    /// The args could not be turned into a request.
    #[error("invalid request args: {message}")]
    InvalidArgs { message: String },
}

/// Errors from the `Api` surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),

    #[error("endpoint `{0}` is a mutation, not a query")]
    NotAQuery(String),

    #[error("endpoint `{0}` is a query, not a mutation")]
    NotAMutation(String),

    #[error("store dropped before the entry settled")]
    StoreClosed,

    #[error("failed to encode cache action: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
