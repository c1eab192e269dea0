//! Format capabilities, each with a local and a pull-through implementation.

pub mod cargo;
pub mod generic;
pub mod oci;

use std::sync::Arc;

use crate::cache::{CacheContext, CacheEntry, PullThroughCacheWriter};
use crate::error::{RegistryError, RegistryResult};
use crate::model::{Principal, Registry, UpstreamProxyConfig};
use crate::remote::{RemoteAdapter, RemoteArtifact, RemoteRequest};

pub use self::cargo::{CargoArtifacts, CargoIndexFiles, LocalCargo, ProxyCargo};
pub use self::generic::{GenericArtifacts, LocalGeneric, ProxyGeneric};
pub use self::oci::{LocalOci, OciArtifacts, ProxyOci};

/// Remote access shared by the proxy implementations.
#[derive(Debug, Clone)]
pub struct Upstream {
    remote: Arc<dyn RemoteAdapter>,
    cache: PullThroughCacheWriter,
}

impl Upstream {
    /// Combine an adapter with the cache writer its results go to.
    pub fn new(remote: Arc<dyn RemoteAdapter>, cache: PullThroughCacheWriter) -> Self {
        Self { remote, cache }
    }

    fn config(registry: &Registry) -> RegistryResult<&UpstreamProxyConfig> {
        registry
            .upstream()
            .ok_or_else(|| RegistryError::Unknown(format!("{registry} has no upstream")))
    }

    async fn fetch(
        &self,
        registry: &Registry,
        request: RemoteRequest,
    ) -> RegistryResult<RemoteArtifact> {
        let config = Self::config(registry)?;
        self.remote.fetch(config, &request).await
    }

    fn cache(&self, principal: &Principal, registry: &Registry, image: &str, entry: CacheEntry) {
        self.cache.schedule(
            CacheContext {
                principal: principal.clone(),
                registry: registry.id,
                image: image.to_owned(),
            },
            entry,
        );
    }
}

fn denied(registry: &Registry) -> RegistryError {
    RegistryError::Denied(format!("{registry} is a read-only upstream proxy"))
}

/// OCI repository names: lowercase path components joined by `/`.
pub fn check_repository_name(name: &str) -> RegistryResult<()> {
    let component_ok = |component: &str| {
        let bytes = component.as_bytes();
        !bytes.is_empty()
            && bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric()
            && bytes.iter().all(|b| {
                b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
            })
    };

    if name.len() > 255 || !name.split('/').all(component_ok) {
        return Err(RegistryError::NameInvalid(name.to_owned()));
    }
    Ok(())
}

/// Generic package names, versions and file names: no empty, `.` or `..` segments.
pub fn check_path_name(name: &str) -> RegistryResult<()> {
    let segment_ok = |segment: &str| {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'+'))
    };

    if name.len() > 255 || !name.split('/').all(segment_ok) {
        return Err(RegistryError::NameInvalid(name.to_owned()));
    }
    Ok(())
}
