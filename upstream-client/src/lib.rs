//! HTTP client for fetching artifacts from upstream registries.
//!
//! A thin layer over a shared `hyperdriver` client service. Every request carries
//! its own [`Credentials`], follows redirects (dropping credentials when the host
//! changes, as blob CDNs expect) and answers OCI bearer token challenges once.

use std::borrow::Cow;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::service::SharedService;
pub use secret::Secret;
use tower::ServiceExt;

mod authentication;
mod error;
pub mod mock;
pub mod uri;

pub use self::authentication::{basic_auth, BearerChallenge, Credentials};
pub use self::error::UpstreamError;
use self::uri::IntoUri as _;

/// The client service all upstream requests go through.
pub type ClientService = hyperdriver::client::SharedClientService<hyperdriver::Body>;

const USER_AGENT: &str = concat!("artifact-registry/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 5;
const MAX_ERROR_MESSAGE: usize = 512;

/// A client for upstream registries over HTTP / HTTPS.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    inner: ClientService,
    timeout: Duration,
}

impl UpstreamClient {
    /// Create a client that gives each request `timeout` to complete, body included.
    pub fn new(timeout: Duration) -> Self {
        let inner = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .layer(
                tower_http::set_header::SetRequestHeaderLayer::if_not_present(
                    header::USER_AGENT,
                    HeaderValue::from_static(USER_AGENT),
                ),
            )
            .build_service();

        Self { inner, timeout }
    }

    /// Create a client around another service, e.g. [`mock::MockUpstream`].
    pub fn with_service<S>(service: S, timeout: Duration) -> Self
    where
        S: tower::Service<
                hyperdriver::body::Request,
                Response = hyperdriver::body::Response,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let inner = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(
                tower_http::set_header::SetRequestHeaderLayer::if_not_present(
                    header::USER_AGENT,
                    HeaderValue::from_static(USER_AGENT),
                ),
            )
            .service(service);

        Self { inner, timeout }
    }

    /// The per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET a resource and collect its body.
    ///
    /// 404 becomes [`UpstreamError::NotFound`], 401 / 403 [`UpstreamError::Denied`] and any
    /// other non-success status [`UpstreamError::Status`].
    #[tracing::instrument(skip(self, uri, credentials, accept), fields(%uri))]
    pub async fn get(
        &self,
        uri: Uri,
        credentials: &Credentials,
        accept: &[&str],
    ) -> Result<UpstreamResponse, UpstreamError> {
        match tokio::time::timeout(self.timeout, self.fetch(uri, credentials, accept)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }

    async fn fetch(
        &self,
        mut uri: Uri,
        credentials: &Credentials,
        accept: &[&str],
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut credentials = Cow::Borrowed(credentials);
        let mut challenged = false;

        for _ in 0..MAX_REDIRECTS {
            let request = build_request(&uri, &credentials, accept)?;
            let response = self
                .inner
                .clone()
                .oneshot(request)
                .await
                .map_err(UpstreamError::Transport)?;
            let status = response.status();

            if status.is_redirection() {
                if let Some(location) = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                {
                    let next = crate::uri::resolve(&uri, location)?;
                    if next.authority() != uri.authority() {
                        credentials = Cow::Owned(Credentials::Anonymous);
                    }
                    tracing::trace!(from = %uri, to = %next, "following redirect");
                    uri = next;
                    continue;
                }
            }

            if status == StatusCode::UNAUTHORIZED && !challenged {
                if let Some(challenge) = BearerChallenge::from_headers(response.headers()) {
                    tracing::debug!(realm = %challenge.realm, "answering bearer challenge");
                    let token = self.token(&challenge, &credentials).await?;
                    credentials = Cow::Owned(Credentials::Bearer(token));
                    challenged = true;
                    continue;
                }
            }

            return UpstreamResponse::collect(uri, response).await;
        }

        Err(UpstreamError::Redirects(uri))
    }

    async fn token(
        &self,
        challenge: &BearerChallenge,
        credentials: &Credentials,
    ) -> Result<Secret, UpstreamError> {
        let mut realm: url::Url = challenge
            .realm
            .parse()
            .map_err(|err: url::ParseError| UpstreamError::Challenge(err.to_string()))?;
        realm
            .query_pairs_mut()
            .extend_pairs(challenge.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        // Only basic credentials are exchanged for a token.
        let anonymous = Credentials::Anonymous;
        let credentials = match credentials {
            Credentials::Basic { .. } => credentials,
            _ => &anonymous,
        };

        let request = build_request(&realm.into_uri()?, credentials, &["application/json"])?;
        let response = self
            .inner
            .clone()
            .oneshot(request)
            .await
            .map_err(UpstreamError::Transport)?;
        let uri = challenge.realm.as_str().into_uri()?;
        let body = UpstreamResponse::collect(uri, response).await?;

        serde_json::from_slice::<authentication::TokenResponse>(body.body())
            .map_err(|err| UpstreamError::Challenge(err.to_string()))?
            .into_secret()
            .ok_or_else(|| UpstreamError::Challenge("token endpoint returned no token".into()))
    }
}

fn build_request(
    uri: &Uri,
    credentials: &Credentials,
    accept: &[&str],
) -> Result<hyperdriver::body::Request, UpstreamError> {
    let mut builder = http::Request::builder().method(Method::GET).uri(uri.clone());
    for media_type in accept {
        builder = builder.header(header::ACCEPT, *media_type);
    }
    let mut request = builder.body(hyperdriver::Body::empty())?;
    credentials.authenticate(&mut request)?;
    Ok(request)
}

/// A successful upstream response with its body collected.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    uri: Uri,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl UpstreamResponse {
    async fn collect(
        uri: Uri,
        response: hyperdriver::body::Response,
    ) -> Result<Self, UpstreamError> {
        let (parts, body) = response.into_parts();
        let status = parts.status;

        if status == StatusCode::NOT_FOUND {
            return Err(UpstreamError::NotFound(uri));
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UpstreamError::Denied { status, uri });
        }

        let body = body
            .collect()
            .await
            .map_err(|err| UpstreamError::Body(err.into()))?
            .to_bytes();

        if !status.is_success() {
            let end = body.len().min(MAX_ERROR_MESSAGE);
            let message = String::from_utf8_lossy(&body[..end]).into_owned();
            return Err(UpstreamError::Status {
                status,
                uri,
                message,
            });
        }

        Ok(Self {
            uri,
            status,
            headers: parts.headers,
            body,
        })
    }

    /// The URI which finally answered, after redirects.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value, if present and valid UTF-8.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The `Content-Type`, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE)
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }

    /// The response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the response body.
    pub fn into_body(self) -> Bytes {
        self.body
    }
}
