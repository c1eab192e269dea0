//! Errors talking to an upstream registry.
use std::time::Duration;

use http::{StatusCode, Uri};
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error occured while fetching from an upstream registry.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream answered 404.
    #[error("not found upstream: {0}")]
    NotFound(Uri),

    /// The upstream refused our credentials (401 / 403).
    #[error("upstream denied access ({status}): {uri}")]
    Denied {
        /// The HTTP status returned.
        status: StatusCode,
        /// The requested URI.
        uri: Uri,
    },

    /// Any other unsuccessful status.
    #[error("upstream returned {status} for {uri}: {message}")]
    Status {
        /// The HTTP status returned.
        status: StatusCode,
        /// The requested URI.
        uri: Uri,
        /// The start of the response body.
        message: String,
    },

    /// The request did not complete in time.
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    /// Reading the response body failed.
    #[error("reading upstream response body")]
    Body(#[source] BoxError),

    /// The request could not be sent.
    #[error(transparent)]
    Transport(hyperdriver::client::Error),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    /// A credential could not be encoded as a header.
    #[error("invalid credential header")]
    Header(#[from] http::header::InvalidHeaderValue),

    /// A URI could not be parsed or joined.
    #[error(transparent)]
    Uri(#[from] crate::uri::ParseUriError),

    /// The upstream kept redirecting.
    #[error("too many redirects, last: {0}")]
    Redirects(Uri),

    /// A bearer token challenge could not be satisfied.
    #[error("token challenge failed: {0}")]
    Challenge(String),
}

impl UpstreamError {
    /// Whether the upstream positively said the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, UpstreamError::NotFound(_))
    }

    /// Whether the upstream rejected the credentials.
    pub fn is_denied(&self) -> bool {
        matches!(self, UpstreamError::Denied { .. })
    }
}
