//! Error taxonomy shared by the relay client, cache, and HTTP surface.
//!
//! A relay that fails while others answer is not an error: the fetcher logs it
//! and returns whatever the reachable relays produced.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed request input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Every relay in the set failed to connect.
    #[error("none of {attempted} relays could be reached")]
    RelayUnreachable { attempted: usize },
    /// Malformed `nsec`/`npub`/hex key material.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    /// Event id or signature does not match its content.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    /// Transport or protocol failure talking to one relay.
    #[error("relay {url}: {reason}")]
    Relay { url: String, reason: String },
    #[error("unknown profile {0}")]
    UnknownProfile(String),
    /// The background task running a cached fetch panicked or was cancelled.
    #[error("fetch task failed: {0}")]
    FetchTask(String),
    /// Failure of a fetch shared by several coalesced callers.
    #[error(transparent)]
    Shared(Arc<Error>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn relay(url: &str, reason: impl ToString) -> Self {
        Error::Relay {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The underlying error, looking through coalesced-fetch wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }
}
