//! A canned upstream for tests.
//!
//! [`MockUpstream`] answers by request path and records every request it sees, so
//! tests can assert how often (and how) the upstream was contacted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use http::response;

/// A configured response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: http::StatusCode,
    headers: http::HeaderMap,
    body: Vec<u8>,
}

impl MockResponse {
    /// Create a response.
    pub fn new(status: http::StatusCode, headers: http::HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

/// A request the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// The host the request was sent to.
    pub host: Option<String>,
    /// The request path.
    pub path: String,
    /// The query string, if any.
    pub query: Option<String>,
    /// Whether an `Authorization` header was present.
    pub authorization: bool,
}

/// A [tower::Service] standing in for an upstream registry.
///
/// Unconfigured paths answer 404. Clones share their request log.
#[derive(Debug, Default, Clone)]
pub struct MockUpstream {
    responses: Arc<HashMap<String, MockResponse>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockUpstream {
    /// A mock with no configured responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the response for a path.
    pub fn add(
        &mut self,
        path: &str,
        status: http::StatusCode,
        headers: http::HeaderMap,
        body: Vec<u8>,
    ) {
        let response = MockResponse::new(status, headers, body);
        Arc::make_mut(&mut self.responses).insert(path.to_owned(), response);
    }

    /// Configure a `200 OK` with a content type.
    pub fn ok(&mut self, path: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        let mut headers = http::HeaderMap::new();
        if let Ok(value) = http::HeaderValue::from_str(content_type) {
            headers.insert(http::header::CONTENT_TYPE, value);
        }
        self.add(path, http::StatusCode::OK, headers, body.into());
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Total number of requests seen.
    pub fn calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of requests seen for one path.
    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    fn record(&self, req: &hyperdriver::body::Request) {
        let recorded = RecordedRequest {
            host: req.uri().host().map(str::to_owned),
            path: req.uri().path().to_owned(),
            query: req.uri().query().map(str::to_owned),
            authorization: req.headers().contains_key(http::header::AUTHORIZATION),
        };
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(recorded);
    }
}

impl tower::Service<hyperdriver::body::Request> for MockUpstream {
    type Response = hyperdriver::body::Response;
    type Error = hyperdriver::client::Error;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: hyperdriver::body::Request) -> Self::Future {
        self.record(&req);
        tracing::trace!(path = %req.uri().path(), "mock upstream request");

        let response = match self.responses.get(req.uri().path()) {
            Some(configured) => {
                let mut builder = response::Builder::new()
                    .status(configured.status)
                    .version(http::Version::HTTP_11);
                for (key, value) in configured.headers.iter() {
                    builder = builder.header(key, value);
                }
                builder.body(hyperdriver::Body::from(Bytes::from(configured.body.clone())))
            }
            None => response::Builder::new()
                .status(http::StatusCode::NOT_FOUND)
                .body(hyperdriver::Body::empty()),
        }
        .unwrap_or_else(|_| http::Response::new(hyperdriver::Body::empty()));

        std::future::ready(Ok(response))
    }
}
