//! Server configuration, read from a TOML file.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8Path;
use http::Uri;
use secret::{Secret, SecretRef, StaticSecrets};
use serde::Deserialize;
use storage::StorageConfig;
use upstream_client::uri::IntoUri as _;

use crate::model::{
    ImagePolicy, PackageType, Registry, RegistryId, RegistryKind, UpstreamCredentials,
    UpstreamProxyConfig, UpstreamSource,
};

const DOCKER_HUB: &str = "https://registry-1.docker.io";
const CRATES_IO_INDEX: &str = "https://index.crates.io";

/// Errors found while loading the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("reading {path}: {source}")]
    Io {
        /// Config path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The TOML did not match the expected shape
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml_edit::de::Error),

    /// Two registries share a scope and name
    #[error("duplicate registry {scope}/{name}")]
    Duplicate {
        /// Scope
        scope: String,
        /// Name
        name: String,
    },

    /// A proxy list names a registry that is not defined
    #[error("registry {registry} references unknown proxy {proxy}")]
    UnknownProxy {
        /// The virtual registry
        registry: String,
        /// The missing proxy
        proxy: String,
    },

    /// A proxy list names something that cannot be used as a proxy
    #[error("registry {registry} cannot use {proxy} as a proxy: {reason}")]
    InvalidProxy {
        /// The virtual registry
        registry: String,
        /// The offending entry
        proxy: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A registry definition is inconsistent with its kind
    #[error("registry {registry}: {reason}")]
    InvalidRegistry {
        /// The registry
        registry: String,
        /// What is wrong
        reason: String,
    },
}

/// Resource limits and timeouts
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Limits {
    /// Largest accepted manifest body
    pub max_manifest_bytes: usize,
    /// Largest accepted `cargo publish` body
    pub max_publish_bytes: usize,
    /// Idle time after which an upload session is discarded
    pub upload_session_ttl_secs: u64,
    /// Upper bound for one detached cache write
    pub cache_write_timeout_secs: u64,
    /// Upper bound for one upstream request
    pub upstream_timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_manifest_bytes: 4 * 1024 * 1024,
            max_publish_bytes: 10 * 1024 * 1024,
            upload_session_ttl_secs: 3600,
            cache_write_timeout_secs: 300,
            upstream_timeout_secs: 60,
        }
    }
}

impl Limits {
    /// Upload session TTL
    pub fn upload_session_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_session_ttl_secs)
    }

    /// Cache write timeout
    pub fn cache_write_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_write_timeout_secs)
    }

    /// Upstream request timeout
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

/// Virtual or upstream proxy, as written in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KindName {
    /// Local registry with optional proxies
    Virtual,
    /// Proxy of a remote registry
    UpstreamProxy,
}

/// The `upstream` table of a proxy registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamDefinition {
    /// Base URL; defaults for public sources
    pub url: Option<String>,
    /// URL layout
    #[serde(default = "default_source")]
    pub source: UpstreamSource,
    /// Basic-auth username
    pub username: Option<String>,
    /// Name of the secret holding the password or token
    pub secret: Option<SecretRef>,
}

fn default_source() -> UpstreamSource {
    UpstreamSource::Url
}

/// One `[[registries]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryDefinition {
    /// Name, unique within the scope
    pub name: String,
    /// Parent scope
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Package format
    pub package_type: PackageType,
    /// Virtual or upstream proxy
    pub kind: KindName,
    /// Names of proxy registries, tried in order after the local store
    #[serde(default)]
    pub upstream_proxies: Vec<String>,
    /// Remote side of a proxy
    pub upstream: Option<UpstreamDefinition>,
    /// Glob patterns of images that may be served; empty allows all
    #[serde(default)]
    pub allowed_patterns: Vec<String>,
    /// Glob patterns of images that are never served
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

fn default_scope() -> String {
    "root".to_owned()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_bucket() -> String {
    "registry".to_owned()
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Public base URL written into Cargo's `config.json`; the `Host` header otherwise
    #[serde(default)]
    pub base_url: Option<String>,
    /// Storage driver
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,
    /// Bucket holding blobs, indexes and upload staging
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Scope used to look up registries named in `/v2/` paths
    #[serde(default = "default_scope")]
    pub oci_scope: String,
    /// Limits and timeouts
    #[serde(default)]
    pub limits: Limits,
    /// Static secrets; anything missing is read from the environment
    #[serde(default)]
    pub secrets: HashMap<String, Secret>,
    /// Registry definitions
    #[serde(default)]
    pub registries: Vec<RegistryDefinition>,
}

impl RegistryConfig {
    /// Parse a configuration document.
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        Ok(toml_edit::de::from_str(document)?)
    }

    /// Read and parse a configuration file.
    pub async fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let document = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_string(),
                source,
            })?;
        Self::from_toml(&document)
    }

    /// The static secret table.
    pub fn static_secrets(&self) -> StaticSecrets {
        self.secrets
            .iter()
            .map(|(name, value)| (SecretRef::new(name.as_str()), value.clone()))
            .collect()
    }

    /// Check the registry definitions and turn them into records.
    ///
    /// Ids are assigned in file order starting at 1. Proxy lists may only name upstream
    /// proxies of the same scope and package type, which keeps chains one level deep.
    pub fn registries(&self) -> Result<Vec<Registry>, ConfigError> {
        let mut ids = HashMap::new();
        for (index, definition) in self.registries.iter().enumerate() {
            let key = (definition.scope.as_str(), definition.name.as_str());
            if ids.insert(key, (RegistryId(index as u64 + 1), definition)).is_some() {
                return Err(ConfigError::Duplicate {
                    scope: definition.scope.clone(),
                    name: definition.name.clone(),
                });
            }
        }

        let mut registries = Vec::with_capacity(self.registries.len());
        for (index, definition) in self.registries.iter().enumerate() {
            let invalid = |reason: String| ConfigError::InvalidRegistry {
                registry: definition.name.clone(),
                reason,
            };

            let kind = match definition.kind {
                KindName::Virtual => {
                    if definition.upstream.is_some() {
                        return Err(invalid("a virtual registry has no upstream".into()));
                    }

                    let mut seen = HashSet::new();
                    let mut upstream_proxies = Vec::new();
                    for proxy in &definition.upstream_proxies {
                        let Some((id, target)) = ids.get(&(definition.scope.as_str(), proxy.as_str()))
                        else {
                            return Err(ConfigError::UnknownProxy {
                                registry: definition.name.clone(),
                                proxy: proxy.clone(),
                            });
                        };

                        let reject = |reason| ConfigError::InvalidProxy {
                            registry: definition.name.clone(),
                            proxy: proxy.clone(),
                            reason,
                        };
                        if target.kind != KindName::UpstreamProxy {
                            return Err(reject("not an upstream proxy"));
                        }
                        if target.package_type != definition.package_type {
                            return Err(reject("package types differ"));
                        }
                        if seen.insert(*id) {
                            upstream_proxies.push(*id);
                        }
                    }

                    RegistryKind::Virtual { upstream_proxies }
                }
                KindName::UpstreamProxy => {
                    if !definition.upstream_proxies.is_empty() {
                        return Err(invalid("an upstream proxy cannot list proxies".into()));
                    }
                    let upstream = definition
                        .upstream
                        .as_ref()
                        .ok_or_else(|| invalid("missing [upstream] table".into()))?;
                    RegistryKind::UpstreamProxy(upstream_config(upstream).map_err(invalid)?)
                }
            };

            let policy = ImagePolicy::new(&definition.allowed_patterns, &definition.blocked_patterns)
                .map_err(|err| invalid(format!("pattern: {err}")))?;

            registries.push(Registry {
                id: RegistryId(index as u64 + 1),
                name: definition.name.clone(),
                scope: definition.scope.clone(),
                package_type: definition.package_type,
                kind,
                policy,
            });
        }

        Ok(registries)
    }

    /// Validate without keeping the result.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registries().map(|_| ())
    }
}

fn upstream_config(upstream: &UpstreamDefinition) -> Result<UpstreamProxyConfig, String> {
    let url = match (upstream.url.as_deref(), upstream.source) {
        (Some(url), _) => url,
        (None, UpstreamSource::DockerHub) => DOCKER_HUB,
        (None, UpstreamSource::CratesIo) => CRATES_IO_INDEX,
        (None, UpstreamSource::Url) => return Err("url is required".into()),
    };
    let url: Uri = url.into_uri().map_err(|err| format!("url: {err}"))?;

    let credentials = match (&upstream.username, &upstream.secret) {
        (Some(username), Some(secret)) => Some(UpstreamCredentials {
            username: username.clone(),
            secret: secret.clone(),
        }),
        (None, None) => None,
        _ => return Err("username and secret must be given together".into()),
    };

    Ok(UpstreamProxyConfig {
        url,
        source: upstream.source,
        credentials,
    })
}
