//! URI utilities.

use camino::Utf8Path;
use http::Uri;
use thiserror::Error;
use url::Url;

/// The provided URL cannot be a base URL,
/// and so is not valid as the base of an upstream registry.
#[derive(Debug, Error)]
#[error("cannot be a base URL: {0}")]
pub struct CannotBeABase(url::Url);

/// Errors that can occur when parsing a URI.
#[derive(Debug, Error)]
pub enum ParseUriError {
    /// An error occurred while parsing the URI.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// The provided URL cannot be a base URL,
    #[error(transparent)]
    CannotBeABase(#[from] CannotBeABase),

    /// The URI is invalid, but URL parsing succeded.
    #[error("invalid URI: {0}")]
    Invalid(#[from] http::uri::InvalidUri),

    /// The URI parts could not be reassembled.
    #[error("invalid URI parts: {0}")]
    Parts(#[from] http::uri::InvalidUriParts),
}

/// Convert a value into a URI.
pub trait IntoUri {
    /// Convert the value into a URI.
    fn into_uri(self) -> Result<Uri, ParseUriError>;
}

impl IntoUri for Url {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        if self.cannot_be_a_base() {
            return Err(CannotBeABase(self).into());
        }

        Ok(self.as_str().parse()?)
    }
}

impl IntoUri for Uri {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        Ok(self)
    }
}

impl IntoUri for &str {
    fn into_uri(self) -> Result<Uri, ParseUriError> {
        let url: Url = self.parse()?;
        url.into_uri()
    }
}

/// Resolve a `Location` header against the URI it was returned for.
pub fn resolve(base: &Uri, location: &str) -> Result<Uri, ParseUriError> {
    let base: Url = base.to_string().parse()?;
    base.join(location)?.into_uri()
}

/// Extension trait for URIs.
pub trait UriExtension {
    /// Join a path to a URI. Absolute paths replace the base path.
    fn join<P: AsRef<str>>(self, path: P) -> Result<Uri, ParseUriError>;
}

impl UriExtension for Uri {
    fn join<P: AsRef<str>>(self, path: P) -> Result<Uri, ParseUriError> {
        let mut parts = self.into_parts();

        let base = parts
            .path_and_query
            .as_ref()
            .map(|pq| pq.path())
            .unwrap_or("/");
        let joined = Utf8Path::new(base).join(path.as_ref());
        let mut joined = joined.to_string();
        if path.as_ref().is_empty() && !joined.ends_with('/') {
            joined.push('/');
        }

        parts.path_and_query = Some(http::uri::PathAndQuery::from_maybe_shared(joined)?);
        Ok(Uri::from_parts(parts)?)
    }
}
