//! Records shared by the resolver, the formats and the metadata store.

use std::fmt;

use chrono::{DateTime, Utc};
use http::Uri;
use secret::SecretRef;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Identifies a registry across its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryId(pub u64);

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Package formats served by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageType {
    /// OCI / Docker images
    Oci,
    /// Cargo crates
    Cargo,
    /// Path-addressed files
    Generic,
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackageType::Oci => "oci",
            PackageType::Cargo => "cargo",
            PackageType::Generic => "generic",
        })
    }
}

/// Where an upstream proxy points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamSource {
    /// A custom base URL
    Url,
    /// The public crates.io index
    CratesIo,
    /// Docker Hub
    DockerHub,
}

/// A username and a reference to the matching password or token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamCredentials {
    /// Sent as the basic-auth user
    pub username: String,
    /// Resolved through the secret service on every request
    pub secret: SecretRef,
}

/// Connection details of an upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxyConfig {
    /// Base URL of the upstream
    pub url: Uri,
    /// Kind of upstream, which fixes the URL layout
    pub source: UpstreamSource,
    /// Optional credentials
    pub credentials: Option<UpstreamCredentials>,
}

/// What a registry does with requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryKind {
    /// Stores artifacts locally and falls back to its proxies, in order.
    Virtual {
        /// Upstream proxy registries consulted after the local store
        upstream_proxies: Vec<RegistryId>,
    },
    /// Fronts a remote registry, caching what it fetches.
    UpstreamProxy(UpstreamProxyConfig),
}

/// Which images a registry will serve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImagePolicy {
    allowed: Vec<glob::Pattern>,
    blocked: Vec<glob::Pattern>,
}

impl ImagePolicy {
    /// Compile allow and block lists of glob patterns.
    pub fn new<S: AsRef<str>>(allowed: &[S], blocked: &[S]) -> Result<Self, glob::PatternError> {
        let compile = |patterns: &[S]| {
            patterns
                .iter()
                .map(|pattern| glob::Pattern::new(pattern.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            allowed: compile(allowed)?,
            blocked: compile(blocked)?,
        })
    }

    /// An empty allow list permits everything not blocked.
    pub fn permits(&self, image: &str) -> bool {
        let allowed =
            self.allowed.is_empty() || self.allowed.iter().any(|pattern| pattern.matches(image));
        allowed && !self.blocked.iter().any(|pattern| pattern.matches(image))
    }
}

/// A registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    /// Unique id
    pub id: RegistryId,
    /// Name, unique within the scope
    pub name: String,
    /// Parent scope (account / root space)
    pub scope: String,
    /// Format of the packages it holds
    pub package_type: PackageType,
    /// Virtual or upstream proxy
    pub kind: RegistryKind,
    /// Image name filters
    pub policy: ImagePolicy,
}

impl Registry {
    /// Whether this registry proxies a remote one.
    pub fn is_upstream_proxy(&self) -> bool {
        matches!(self.kind, RegistryKind::UpstreamProxy(_))
    }

    /// The upstream configuration, for proxies.
    pub fn upstream(&self) -> Option<&UpstreamProxyConfig> {
        match &self.kind {
            RegistryKind::UpstreamProxy(config) => Some(config),
            RegistryKind::Virtual { .. } => None,
        }
    }

    /// Whether the image policy lets `image` through.
    pub fn permits(&self, image: &str) -> bool {
        self.policy.permits(image)
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

/// A file belonging to an artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// File name within the version
    pub name: String,
    /// Content digest
    pub digest: Digest,
    /// Size in bytes
    pub size: u64,
}

/// One version of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Owning registry
    pub registry: RegistryId,
    /// Image (package) name
    pub image: String,
    /// Version string
    pub version: String,
    /// Format-specific metadata
    pub metadata: serde_json::Value,
    /// Files of this version
    pub files: Vec<ArtifactFile>,
    /// Cargo yank flag
    pub yanked: bool,
    /// When it was first stored
    pub created: DateTime<Utc>,
}

impl Artifact {
    /// A version with no files yet.
    pub fn new(registry: RegistryId, image: &str, version: &str) -> Self {
        Self {
            registry,
            image: image.to_owned(),
            version: version.to_owned(),
            metadata: serde_json::Value::Null,
            files: Vec::new(),
            yanked: false,
            created: Utc::now(),
        }
    }

    /// Find a file by name.
    pub fn file(&self, name: &str) -> Option<&ArtifactFile> {
        self.files.iter().find(|file| file.name == name)
    }

    /// Add or replace a file by name.
    pub fn upsert_file(&mut self, file: ArtifactFile) {
        self.files.retain(|existing| existing.name != file.name);
        self.files.push(file);
    }
}

/// A stored manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    /// Owning registry
    pub registry: RegistryId,
    /// Repository name
    pub image: String,
    /// Digest of the payload
    pub digest: Digest,
    /// Media type it was stored with
    pub media_type: String,
    /// Payload size
    pub size: u64,
    /// Blobs referenced by an image manifest
    pub blobs: Vec<Digest>,
    /// Manifests referenced by an index
    pub manifests: Vec<Digest>,
    /// When it was stored
    pub created: DateTime<Utc>,
}

impl ManifestRecord {
    /// Whether this is a manifest list / image index.
    pub fn is_list(&self) -> bool {
        !self.manifests.is_empty()
    }
}

/// The caller, as established by the authentication middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// User or service account name
    pub name: String,
}

impl Principal {
    /// A named principal.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }

    /// Used when no middleware attached an identity.
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
