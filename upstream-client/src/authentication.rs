//! Per-request credentials for upstream registries.
//!
//! Credentials are resolved from a secret service just before each request and
//! attached to that request only; the client itself holds no identity.

use http::HeaderValue;
use secret::Secret;

use crate::error::UpstreamError;

/// Create a basic authentication header value, with the password being optional.
///
/// Basic authentication Base64 encodes the username and password, separated by a colon.
///
/// # Example
/// ```rust
/// use upstream_client::basic_auth;
/// let username = "username";
/// let password = "password";
///
/// let header = basic_auth(username, Some(password)).unwrap();
/// assert_eq!(header.to_str().unwrap(), "Basic dXNlcm5hbWU6cGFzc3dvcmQ=");
/// ```
pub fn basic_auth<U, P>(username: U, password: Option<P>) -> Result<HeaderValue, UpstreamError>
where
    U: std::fmt::Display,
    P: std::fmt::Display,
{
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:", username);
        if let Some(password) = password {
            let _ = write!(encoder, "{}", password);
        }
    }
    let mut header = HeaderValue::from_bytes(&buf)?;
    header.set_sensitive(true);
    Ok(header)
}

/// How to authenticate a single upstream request.
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    /// No authorization header.
    #[default]
    Anonymous,

    /// HTTP basic authentication.
    Basic {
        /// The username, sent in the clear.
        username: String,
        /// The optional password.
        password: Option<Secret>,
    },

    /// A bearer token.
    Bearer(Secret),
}

impl Credentials {
    /// Basic credentials from a username and password.
    pub fn basic<U: Into<String>>(username: U, password: Option<Secret>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password,
        }
    }

    /// The `Authorization` header for these credentials, if any.
    pub fn header(&self) -> Result<Option<HeaderValue>, UpstreamError> {
        match self {
            Credentials::Anonymous => Ok(None),
            Credentials::Basic { username, password } => Ok(Some(basic_auth(
                username,
                password.as_ref().map(Secret::revealed),
            )?)),
            Credentials::Bearer(token) => Ok(Some(token.bearer()?)),
        }
    }

    /// Attach the credentials to a request unless it already carries an authorization header.
    pub fn authenticate<B>(&self, req: &mut http::Request<B>) -> Result<(), UpstreamError> {
        if req.headers().contains_key(http::header::AUTHORIZATION) {
            tracing::warn!("{} header already set", http::header::AUTHORIZATION);
            return Ok(());
        }

        if let Some(value) = self.header()? {
            req.headers_mut().insert(http::header::AUTHORIZATION, value);
        }
        Ok(())
    }
}

/// A `WWW-Authenticate: Bearer ...` challenge, as sent by OCI registries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// The token endpoint.
    pub realm: String,
    /// Remaining parameters (`service`, `scope`, ...), passed to the token endpoint as query.
    pub params: Vec<(String, String)>,
}

impl BearerChallenge {
    /// Find a bearer challenge among response headers.
    pub fn from_headers(headers: &http::HeaderMap) -> Option<Self> {
        headers
            .get_all(http::header::WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(Self::parse)
    }

    /// Parse a single challenge header value.
    pub fn parse(value: &str) -> Option<Self> {
        let (scheme, rest) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut params = split_params(rest);
        let position = params.iter().position(|(k, _)| k == "realm")?;
        let (_, realm) = params.remove(position);
        Some(Self { realm, params })
    }
}

fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        params.push((key, value.trim().to_owned()));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

/// The body returned by an OCI token endpoint.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_secret(self) -> Option<Secret> {
        self.token.or(self.access_token).map(Secret::from)
    }
}
