//! # Artifact Registry
//!
//! A multi-format artifact registry core: OCI images, Cargo crates and generic files,
//! stored in content-addressed blob storage and served over HTTP.
//!
//! ## Features
//!
//! - OCI distribution API, including resumable chunked uploads, range reads and
//!   cross-repository mounts
//! - Cargo sparse index, downloads, publish, yank and unyank
//! - Generic `{image}/{version}/{filename}` files
//! - Virtual registries that fall back to upstream proxies in a fixed order
//! - Pull-through caching of upstream content on detached tasks
//! - Pluggable storage backend via the `storage` crate
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use artifact_registry::RegistryBuilder;
//! use artifact_registry::metadata::MemoryMetadataStore;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .metadata(Arc::new(MemoryMetadataStore::new()))
//!     .build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, registry).await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub mod cache;
pub mod config;
pub mod content;
pub mod context;
pub mod digest;
mod error;
pub mod formats;
pub mod manifest;
pub mod metadata;
pub mod model;
pub mod proxy;
pub mod remote;
pub mod resolver;
pub mod upload;

pub use api::{RegistryBuilder, SECRET_ENV_PREFIX, router};
pub use context::RegistryContext;
pub use error::{RegistryError, RegistryResult};
