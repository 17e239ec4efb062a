//! Signed destinations for uploads.
//!
//! Before any byte moves, the backend hands out a short-lived write URL
//! and the permanent public URL the object will have. [`HttpSigner`]
//! talks to the real endpoint; tests substitute their own
//! [`SignedRequestProvider`].

mod client;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use client::HttpSigner;

/// Errors from signing or remote deletion.
#[derive(Debug, thiserror::Error)]
pub enum SignRequestError {
    #[error("invalid sign request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signing endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed signing response: {0}")]
    Malformed(String),

    #[error("signing timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid auth token")]
    InvalidToken,
}

/// What to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    /// Object name inside `folder`; must be non-empty.
    pub resource_name: String,
    pub mime_type: String,
    pub folder: String,
    /// Ask for overwrite-friendly cache semantics (profile pictures).
    pub is_static: bool,
}

/// A write URL plus the public URL the object will be served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDestination {
    pub write_url: String,
    pub public_url: String,
}

/// Future returned by [`SignedRequestProvider`] operations.
pub type SignFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SignRequestError>> + Send + 'a>>;

/// Source of signed destinations.
pub trait SignedRequestProvider: Send + Sync {
    /// Obtains a destination for `request`.
    fn sign<'a>(&'a self, request: &'a SignRequest) -> SignFuture<'a, SignedDestination>;

    /// Removes a previously written object.
    fn delete<'a>(&'a self, folder: &'a str, filename: &'a str, is_static: bool) -> SignFuture<'a, ()>;
}
