//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use storage::StorageErrorKind;

use crate::digest::Digest;
use crate::metadata::MetadataError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No registry with this name exists in the scope
    #[error("registry not found: {0}")]
    RegistryNotFound(String),

    /// The package or version does not exist
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Blob not found
    #[error("blob unknown: {0}")]
    BlobUnknown(String),

    /// Manifest not found
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// The upload session does not exist, expired or has finished
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// The operation is not permitted on this registry
    #[error("denied: {0}")]
    Denied(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestInvalid {
        /// Expected digest
        expected: Digest,
        /// Actual digest
        actual: Digest,
    },

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// The content length did not match
    #[error("size invalid: {0}")]
    SizeInvalid(String),

    /// The chunk did not start at the current upload offset
    #[error("range invalid: {0}")]
    RangeInvalid(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    /// Unsupported manifest media type
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// The manifest signature could not be verified
    #[error("manifest unverified: {0}")]
    ManifestUnverified(String),

    /// A manifest references a blob or manifest that does not exist
    #[error("manifest references unknown content: {0}")]
    ManifestBlobUnknown(Digest),

    /// The manifest is part of a manifest list and cannot be deleted
    #[error("manifest {digest} is referenced by manifest list {list}")]
    ManifestReferencedInList {
        /// The manifest being deleted
        digest: Digest,
        /// A list referencing it
        list: Digest,
    },

    /// The artifact is quarantined and must not be served
    #[error("artifact is quarantined: {0}")]
    Quarantined(Digest),

    /// The upstream registry could not be reached
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// Invalid repository or package name
    #[error("invalid name: {0}")]
    NameInvalid(String),

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// A published package or its metadata is malformed
    #[error("invalid package: {0}")]
    PackageInvalid(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Metadata store error
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// Anything else
    #[error("{0}")]
    Unknown(String),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::RegistryNotFound(_)
            | RegistryError::ArtifactNotFound(_)
            | RegistryError::BlobUnknown(_)
            | RegistryError::ManifestUnknown(_)
            | RegistryError::BlobUploadUnknown(_) => StatusCode::NOT_FOUND,
            RegistryError::Denied(_) | RegistryError::Quarantined(_) => StatusCode::FORBIDDEN,
            RegistryError::DigestInvalid { .. }
            | RegistryError::InvalidDigest(_)
            | RegistryError::SizeInvalid(_)
            | RegistryError::ManifestInvalid(_)
            | RegistryError::ManifestUnverified(_)
            | RegistryError::ManifestBlobUnknown(_)
            | RegistryError::NameInvalid(_)
            | RegistryError::BlobUploadInvalid(_)
            | RegistryError::PackageInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::RangeInvalid(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::ManifestReferencedInList { .. } => StatusCode::CONFLICT,
            RegistryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Storage(err) => match err.kind() {
                StorageErrorKind::NotFound => StatusCode::NOT_FOUND,
                StorageErrorKind::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
                StorageErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            RegistryError::Metadata(MetadataError::Conflict(_)) => StatusCode::CONFLICT,
            RegistryError::Metadata(_) | RegistryError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::RegistryNotFound(_) | RegistryError::ArtifactNotFound(_) => {
                "NAME_UNKNOWN"
            }
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::Denied(_) | RegistryError::Quarantined(_) => "DENIED",
            RegistryError::DigestInvalid { .. } | RegistryError::InvalidDigest(_) => {
                "DIGEST_INVALID"
            }
            RegistryError::SizeInvalid(_) => "SIZE_INVALID",
            RegistryError::RangeInvalid(_) | RegistryError::BlobUploadInvalid(_) => {
                "BLOB_UPLOAD_INVALID"
            }
            RegistryError::ManifestInvalid(_) | RegistryError::UnsupportedMediaType(_) => {
                "MANIFEST_INVALID"
            }
            RegistryError::ManifestUnverified(_) => "MANIFEST_UNVERIFIED",
            RegistryError::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::ManifestReferencedInList { .. } => "DENIED",
            RegistryError::NameInvalid(_) => "NAME_INVALID",
            RegistryError::PackageInvalid(_) => "UNSUPPORTED",
            RegistryError::Unavailable(_) => "UNAVAILABLE",
            RegistryError::Storage(err) if err.is_not_found() => "BLOB_UNKNOWN",
            RegistryError::Storage(_) | RegistryError::Metadata(_) | RegistryError::Unknown(_) => {
                "UNKNOWN"
            }
        }
    }

    /// Whether the error says the thing asked for does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            RegistryError::RegistryNotFound(_)
            | RegistryError::ArtifactNotFound(_)
            | RegistryError::BlobUnknown(_)
            | RegistryError::ManifestUnknown(_)
            | RegistryError::BlobUploadUnknown(_) => true,
            RegistryError::Storage(err) => err.is_not_found(),
            _ => false,
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        } else {
            tracing::debug!(%status, error = %self, "request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_family() {
        assert!(RegistryError::BlobUnknown("x".into()).is_not_found());
        assert!(RegistryError::RegistryNotFound("x".into()).is_not_found());
        assert!(!RegistryError::Denied("x".into()).is_not_found());

        let storage = storage::StorageError::not_found("memory", "b", "p");
        assert!(RegistryError::from(storage).is_not_found());
    }

    #[test]
    fn oci_codes_and_statuses() {
        let err = RegistryError::RangeInvalid("offset 100".into());
        assert_eq!(err.status_code(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(err.error_code(), "BLOB_UPLOAD_INVALID");

        let err = RegistryError::UnsupportedMediaType("text/plain".into());
        assert_eq!(err.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(err.error_code(), "MANIFEST_INVALID");

        let err = RegistryError::Metadata(MetadataError::Conflict("dup".into()));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn renders_oci_error_body() {
        let response = RegistryError::NameInvalid("Bad".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "NAME_INVALID");
        assert_eq!(json["errors"][0]["message"], "invalid name: Bad");
    }
}
