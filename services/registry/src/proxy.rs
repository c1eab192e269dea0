//! Running an operation across a registry chain.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{RegistryError, RegistryResult};
use crate::model::Registry;
use crate::resolver::RegistryResolver;

/// The local and proxy implementations of one capability, chosen by registry kind.
pub struct Capabilities<T: ?Sized> {
    local: Arc<T>,
    proxy: Arc<T>,
}

impl<T: ?Sized> Capabilities<T> {
    /// Pair a local implementation with a pull-through one.
    pub fn new(local: Arc<T>, proxy: Arc<T>) -> Self {
        Self { local, proxy }
    }

    /// Virtual registries get the local implementation, upstream proxies the proxy one.
    pub fn select(&self, registry: &Registry) -> Arc<T> {
        if registry.is_upstream_proxy() {
            self.proxy.clone()
        } else {
            self.local.clone()
        }
    }
}

impl<T: ?Sized> Clone for Capabilities<T> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Capabilities<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

/// Applies an operation to the registries of a chain.
pub struct ProxyCoordinator<T: ?Sized> {
    resolver: RegistryResolver,
    capabilities: Arc<Capabilities<T>>,
}

impl<T: ?Sized> Clone for ProxyCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for ProxyCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCoordinator")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized> ProxyCoordinator<T> {
    /// Create a coordinator over a fixed capability table.
    pub fn new(resolver: RegistryResolver, capabilities: Arc<Capabilities<T>>) -> Self {
        Self {
            resolver,
            capabilities,
        }
    }

    /// The resolver used to build chains.
    pub fn resolver(&self) -> &RegistryResolver {
        &self.resolver
    }

    /// Try `op` on each registry in order and return the first success.
    ///
    /// A registry whose pattern policy rejects `image` is not consulted and counts as a
    /// `Denied` failure. When every registry fails, the last error is returned.
    pub async fn fallback<R, F, Fut>(
        &self,
        chain: &[Registry],
        image: Option<&str>,
        mut op: F,
    ) -> RegistryResult<R>
    where
        F: FnMut(Registry, Arc<T>) -> Fut,
        Fut: Future<Output = RegistryResult<R>>,
    {
        let mut last = None;

        for registry in chain {
            let result = match image {
                Some(image) if !registry.permits(image) => Err(RegistryError::Denied(format!(
                    "{image} is not allowed in {registry}"
                ))),
                _ => {
                    let capability = self.capabilities.select(registry);
                    op(registry.clone(), capability).await
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if error.is_not_found() {
                        tracing::debug!(%registry, %error, "not found in registry");
                    } else {
                        tracing::warn!(%registry, %error, "registry failed, trying next");
                    }
                    last = Some(error);
                }
            }
        }

        Err(last.unwrap_or_else(|| RegistryError::Unknown("empty registry chain".into())))
    }

    /// Resolve the chain of `scope/name` and run [`ProxyCoordinator::fallback`] on it.
    pub async fn fallback_by_name<R, F, Fut>(
        &self,
        scope: &str,
        name: &str,
        image: Option<&str>,
        op: F,
    ) -> RegistryResult<R>
    where
        F: FnMut(Registry, Arc<T>) -> Fut,
        Fut: Future<Output = RegistryResult<R>>,
    {
        let chain = self.resolver.resolve_chain(scope, name).await?;
        self.fallback(&chain, image, op).await
    }

    /// Run `op` on the named registry only. Proxies are never consulted.
    pub async fn primary_only<R, F, Fut>(
        &self,
        scope: &str,
        name: &str,
        image: Option<&str>,
        op: F,
    ) -> RegistryResult<R>
    where
        F: FnOnce(Registry, Arc<T>) -> Fut,
        Fut: Future<Output = RegistryResult<R>>,
    {
        let registry = self.resolver.primary(scope, name).await?;
        if let Some(image) = image {
            if !registry.permits(image) {
                return Err(RegistryError::Denied(format!(
                    "{image} is not allowed in {registry}"
                )));
            }
        }

        let capability = self.capabilities.select(&registry);
        op(registry, capability).await
    }
}
