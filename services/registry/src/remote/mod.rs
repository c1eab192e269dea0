//! Fetching from upstream registries.

mod http;

use bytes::Bytes;

use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::model::UpstreamProxyConfig;

pub use self::http::HttpRemote;

/// Something to fetch from an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    /// An OCI manifest by tag or digest
    Manifest {
        /// Repository
        image: String,
        /// Tag or digest
        reference: String,
    },
    /// An OCI blob
    Blob {
        /// Repository
        image: String,
        /// Blob digest
        digest: Digest,
    },
    /// A Cargo sparse index file
    CargoIndex {
        /// Crate name
        name: String,
    },
    /// A `.crate` archive
    CargoCrate {
        /// Crate name
        name: String,
        /// Version
        version: String,
    },
    /// A generic file
    File {
        /// Package
        image: String,
        /// Version
        version: String,
        /// File name
        filename: String,
    },
}

/// What came back from an upstream.
#[derive(Debug, Clone)]
pub struct RemoteArtifact {
    /// Response body
    pub bytes: Bytes,
    /// `Content-Type` without parameters
    pub content_type: Option<String>,
    /// `Docker-Content-Digest`, when sent
    pub digest: Option<Digest>,
}

/// Format-aware upstream client.
///
/// Missing content maps to the matching not-found error, rejected credentials to
/// `Denied` and everything else (network, timeouts, 5xx) to `Unavailable`.
#[async_trait::async_trait]
pub trait RemoteAdapter: std::fmt::Debug + Send + Sync {
    /// Fetch one artifact from `upstream`.
    async fn fetch(
        &self,
        upstream: &UpstreamProxyConfig,
        request: &RemoteRequest,
    ) -> RegistryResult<RemoteArtifact>;
}

/// Sparse index path of a crate: `1/a`, `2/ab`, `3/a/abc`, `se/rd/serde`.
pub fn sparse_index_path(name: &str) -> String {
    let name = name.to_ascii_lowercase();
    match name.len() {
        1 => format!("1/{name}"),
        2 => format!("2/{name}"),
        3 => format!("3/{}/{name}", &name[..1]),
        _ => format!("{}/{}/{name}", &name[..2], &name[2..4]),
    }
}
