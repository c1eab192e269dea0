//! Registry lookup and fallback chain construction.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{RegistryError, RegistryResult};
use crate::metadata::MetadataStore;
use crate::model::{Registry, RegistryKind};

/// Turns a requested registry name into the ordered list of registries to try.
#[derive(Debug, Clone)]
pub struct RegistryResolver {
    metadata: Arc<dyn MetadataStore>,
}

impl RegistryResolver {
    /// Create a resolver over a metadata store.
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// The registry itself, without its proxies.
    pub async fn primary(&self, scope: &str, name: &str) -> RegistryResult<Registry> {
        self.metadata
            .registry(scope, name)
            .await?
            .ok_or_else(|| RegistryError::RegistryNotFound(format!("{scope}/{name}")))
    }

    /// `[primary, proxy-1, proxy-2, ...]`
    ///
    /// Proxies are appended in their stored order and never expanded further. A registry
    /// appears at most once.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_chain(&self, scope: &str, name: &str) -> RegistryResult<Vec<Registry>> {
        let primary = self.primary(scope, name).await?;

        let proxies = match &primary.kind {
            RegistryKind::Virtual { upstream_proxies } => upstream_proxies.clone(),
            RegistryKind::UpstreamProxy(_) => Vec::new(),
        };

        let mut seen = HashSet::from([primary.id]);
        let mut chain = vec![primary];

        for id in proxies {
            if !seen.insert(id) {
                continue;
            }

            match self.metadata.registry_by_id(id).await? {
                Some(proxy) => chain.push(proxy),
                None => tracing::warn!(%id, "upstream proxy no longer exists, skipping"),
            }
        }

        tracing::trace!(
            chain = ?chain.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            "resolved chain"
        );
        Ok(chain)
    }
}
