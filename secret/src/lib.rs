//! Secrets and how to find them.
//!
//! [`Secret`] keeps a sensitive value out of debug output and zeroes it on drop.
//! [`SecretResolver`] turns a [`SecretRef`] from configuration into a [`Secret`]
//! at the moment it is needed, so credentials are never stored in registry records.

use std::{borrow::Cow, collections::HashMap, env::VarError, fmt, ops::Deref, sync::Arc};

use http::{header::InvalidHeaderValue, HeaderValue};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// An API Key for a service. Generally any semi-secret item.
///
/// This wrapper just prevents the key from appearing in debug reprs.
///
/// Use [Secret::revealed] to get the underlying value.
#[derive(Clone, Deserialize, Serialize)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// Read a secret from an environment variable.
    pub fn from_env(var: &str) -> Result<Self, VarError> {
        let value = std::env::var(var)?;
        Ok(Secret(value.into()))
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

/// Tiny wrapper struct to indicate that the inner object should
/// be directly printed in fmt::Debug implementations.
struct DirectDebug<D>(D);

impl<D> fmt::Debug for DirectDebug<D>
where
    D: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&DirectDebug("****")).finish()
    }
}

impl Secret {
    /// Expose the underlying value of this API Key
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }

    /// The secret as a sensitive header value.
    pub fn to_header(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut header = HeaderValue::try_from(self.revealed())?;
        header.set_sensitive(true);
        Ok(header)
    }

    /// The secret as a sensitive `Bearer` authorization header.
    pub fn bearer(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut header = HeaderValue::try_from(format!("Bearer {}", self.revealed()))?;
        header.set_sensitive(true);
        Ok(header)
    }

    #[allow(clippy::should_implement_trait)]
    /// Copy a string into a secret.
    pub fn from_str(s: &str) -> Self {
        Secret(s.to_owned().into())
    }
}

impl From<Cow<'static, str>> for Secret {
    fn from(inner: Cow<'static, str>) -> Self {
        Secret(inner)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}

/// A named reference to a secret, as it appears in configuration.
///
/// The name is an identifier for the resolver, not the secret itself, so it is
/// safe to log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    /// Refer to a secret by name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        SecretRef(name.into())
    }

    /// The name of the referenced secret.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SecretRef {
    fn from(value: &str) -> Self {
        SecretRef::new(value)
    }
}

/// Failure to resolve a [`SecretRef`].
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// No resolver knows about this secret.
    #[error("secret {0} not found")]
    NotFound(SecretRef),

    /// The secret exists but could not be read.
    #[error("secret {name} could not be read")]
    Unreadable {
        /// The secret which failed.
        name: SecretRef,
        /// Why it failed.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

/// Looks up secret values by reference.
#[async_trait::async_trait]
pub trait SecretResolver: fmt::Debug + Send + Sync {
    /// Resolve a reference into its current value.
    async fn resolve(&self, secret: &SecretRef) -> Result<Secret, SecretError>;
}

#[async_trait::async_trait]
impl<R> SecretResolver for Arc<R>
where
    R: SecretResolver + ?Sized,
{
    async fn resolve(&self, secret: &SecretRef) -> Result<Secret, SecretError> {
        self.deref().resolve(secret).await
    }
}

/// Resolves secrets from environment variables.
///
/// The reference name is upper-cased and `-` / `.` become `_`, with an
/// optional prefix, so `upstream.token` with prefix `REGISTRY_` reads
/// `REGISTRY_UPSTREAM_TOKEN`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecrets {
    prefix: String,
}

impl EnvSecrets {
    /// Resolve secrets from variables starting with `prefix`.
    pub fn with_prefix<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The variable a reference maps to.
    pub fn variable(&self, secret: &SecretRef) -> String {
        let name: String = secret
            .name()
            .chars()
            .map(|c| match c {
                '-' | '.' | '/' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait::async_trait]
impl SecretResolver for EnvSecrets {
    async fn resolve(&self, secret: &SecretRef) -> Result<Secret, SecretError> {
        match Secret::from_env(&self.variable(secret)) {
            Ok(value) => Ok(value),
            Err(VarError::NotPresent) => Err(SecretError::NotFound(secret.clone())),
            Err(err) => Err(SecretError::Unreadable {
                name: secret.clone(),
                source: Box::new(err),
            }),
        }
    }
}

/// Resolves secrets from a fixed table, falling back to another resolver.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    secrets: HashMap<SecretRef, Secret>,
    fallback: Option<Arc<dyn SecretResolver>>,
}

impl StaticSecrets {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret to the table.
    pub fn insert<R: Into<SecretRef>, S: Into<Secret>>(&mut self, name: R, value: S) {
        self.secrets.insert(name.into(), value.into());
    }

    /// Consult `fallback` for names missing from the table.
    pub fn with_fallback<R: SecretResolver + 'static>(mut self, fallback: R) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }
}

impl<K, V> FromIterator<(K, V)> for StaticSecrets
where
    K: Into<SecretRef>,
    V: Into<Secret>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            secrets: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            fallback: None,
        }
    }
}

#[async_trait::async_trait]
impl SecretResolver for StaticSecrets {
    async fn resolve(&self, secret: &SecretRef) -> Result<Secret, SecretError> {
        if let Some(value) = self.secrets.get(secret) {
            return Ok(value.clone());
        }

        match &self.fallback {
            Some(fallback) => fallback.resolve(secret).await,
            None => Err(SecretError::NotFound(secret.clone())),
        }
    }
}
