//! OCI distribution endpoints under `/v2/{registry}/...`.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use crate::context::RegistryContext;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::formats::check_repository_name;
use crate::formats::oci::BlobRange;
use crate::manifest::Reference;
use crate::model::Principal;
use crate::upload::{ChunkRange, UploadId, UploadSession, UploadSessionManager};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const DOCKER_UPLOAD_UUID: &str = "docker-upload-uuid";

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
pub(super) async fn version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

/// What a `/v2/{registry}/{rest}` path addresses. Image names may contain `/`, so the
/// path is split from the right.
#[derive(Debug, PartialEq, Eq)]
enum Target<'a> {
    Tags { image: &'a str },
    Manifest { image: &'a str, reference: &'a str },
    Uploads { image: &'a str, session: Option<&'a str> },
    Blob { image: &'a str, digest: &'a str },
}

impl<'a> Target<'a> {
    fn parse(rest: &'a str) -> Option<Self> {
        if let Some(image) = rest.strip_suffix("/tags/list") {
            return Some(Target::Tags { image });
        }
        if let Some(image) = rest
            .strip_suffix("/blobs/uploads/")
            .or_else(|| rest.strip_suffix("/blobs/uploads"))
        {
            return Some(Target::Uploads {
                image,
                session: None,
            });
        }
        if let Some((image, session)) = rest.rsplit_once("/blobs/uploads/") {
            return Some(Target::Uploads {
                image,
                session: Some(session),
            });
        }
        if let Some((image, reference)) = rest.rsplit_once("/manifests/") {
            return Some(Target::Manifest { image, reference });
        }
        if let Some((image, digest)) = rest.rsplit_once("/blobs/") {
            return Some(Target::Blob { image, digest });
        }
        None
    }

    fn image(&self) -> &'a str {
        match self {
            Target::Tags { image }
            | Target::Manifest { image, .. }
            | Target::Uploads { image, .. }
            | Target::Blob { image, .. } => *image,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct OciQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
    #[serde(rename = "_state")]
    state: Option<String>,
    n: Option<usize>,
    last: Option<String>,
}

/// Everything after `/v2/{registry}/`.
#[tracing::instrument(skip_all, fields(%method, registry = %registry, path = %rest))]
pub(super) async fn dispatch(
    State(ctx): State<RegistryContext>,
    principal: Principal,
    method: Method,
    Path((registry, rest)): Path<(String, String)>,
    Query(query): Query<OciQuery>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let Some(target) = Target::parse(&rest) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    check_repository_name(target.image())?;

    // Blob bodies are unbounded; manifests are held to the configured cap while reading.
    let limit = match (&method, &target) {
        (&Method::PUT, Target::Manifest { .. }) => ctx.limits().max_manifest_bytes,
        _ => usize::MAX,
    };
    let body = axum::body::to_bytes(body, limit).await.map_err(|err| {
        RegistryError::SizeInvalid(format!("request body refused at {limit} bytes: {err}"))
    })?;

    let request = OciRequest {
        ctx: &ctx,
        principal: &principal,
        registry: &registry,
    };

    match (method, target) {
        (Method::GET, Target::Tags { image }) => request.list_tags(image, &query).await,
        (method @ (Method::GET | Method::HEAD), Target::Manifest { image, reference }) => {
            request
                .get_manifest(image, &reference.parse()?, method == Method::HEAD)
                .await
        }
        (Method::PUT, Target::Manifest { image, reference }) => {
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok());
            request
                .put_manifest(image, &reference.parse()?, content_type, body)
                .await
        }
        (Method::DELETE, Target::Manifest { image, reference }) => {
            request.delete_manifest(image, &reference.parse()?).await
        }
        (Method::GET, Target::Blob { image, digest }) => {
            let range = headers
                .get(header::RANGE)
                .and_then(|value| value.to_str().ok())
                .map(str::parse::<BlobRange>)
                .transpose()?;
            request.get_blob(image, &digest.parse()?, range).await
        }
        (Method::HEAD, Target::Blob { image, digest }) => {
            request.head_blob(image, &digest.parse()?).await
        }
        (Method::DELETE, Target::Blob { image, digest }) => {
            request.delete_blob(image, &digest.parse()?).await
        }
        (Method::POST, Target::Uploads {
            image,
            session: None,
        }) => request.start_upload(image, &query, body).await,
        (Method::PATCH, Target::Uploads {
            image,
            session: Some(session),
        }) => {
            let range = headers
                .get(header::CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .map(str::parse::<ChunkRange>)
                .transpose()?;
            request.append(image, session, &query, range, body).await
        }
        (Method::PUT, Target::Uploads {
            image,
            session: Some(session),
        }) => request.complete_upload(image, session, &query, body).await,
        (Method::GET, Target::Uploads {
            image,
            session: Some(session),
        }) => request.upload_status(image, session, &query).await,
        (Method::DELETE, Target::Uploads {
            image,
            session: Some(session),
        }) => request.cancel_upload(image, session, &query).await,
        _ => Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    }
}

struct OciRequest<'a> {
    ctx: &'a RegistryContext,
    principal: &'a Principal,
    registry: &'a str,
}

fn header_value(value: impl AsRef<str>) -> RegistryResult<HeaderValue> {
    HeaderValue::from_str(value.as_ref())
        .map_err(|err| RegistryError::Unknown(format!("invalid header value: {err}")))
}

impl OciRequest<'_> {
    fn scope(&self) -> &str {
        self.ctx.oci_scope()
    }

    fn upload_location(&self, image: &str, session: &UploadSession) -> String {
        format!(
            "/v2/{}/{image}/blobs/uploads/{}?_state={}",
            self.registry,
            session.id,
            UploadSessionManager::state_token(session)
        )
    }

    fn upload_response(
        &self,
        status: StatusCode,
        image: &str,
        session: &UploadSession,
    ) -> RegistryResult<Response> {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, header_value(self.upload_location(image, session))?);
        headers.insert(header::RANGE, header_value(session.range())?);
        headers.insert(DOCKER_UPLOAD_UUID, header_value(session.id.to_string())?);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        Ok((status, headers).into_response())
    }

    fn blob_created(&self, image: &str, digest: &Digest) -> RegistryResult<Response> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            header_value(format!("/v2/{}/{image}/blobs/{digest}", self.registry))?,
        );
        headers.insert(DOCKER_CONTENT_DIGEST, header_value(digest.to_string())?);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        Ok((StatusCode::CREATED, headers).into_response())
    }

    async fn list_tags(&self, image: &str, query: &OciQuery) -> RegistryResult<Response> {
        let mut tags = self
            .ctx
            .oci()
            .fallback_by_name(self.scope(), self.registry, Some(image), |registry, oci| {
                async move { oci.list_tags(&registry, image).await }
            })
            .await?;

        if let Some(last) = &query.last {
            tags.retain(|tag| tag > last);
        }
        if let Some(n) = query.n {
            tags.truncate(n);
        }

        Ok(Json(json!({ "name": image, "tags": tags })).into_response())
    }

    async fn get_manifest(
        &self,
        image: &str,
        reference: &Reference,
        head: bool,
    ) -> RegistryResult<Response> {
        let principal = self.principal;
        let manifest = self
            .ctx
            .oci()
            .fallback_by_name(self.scope(), self.registry, Some(image), |registry, oci| {
                async move {
                    oci.get_manifest(principal, &registry, image, reference)
                        .await
                }
            })
            .await?;

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header_value(&manifest.media_type)?);
        headers.insert(DOCKER_CONTENT_DIGEST, header_value(manifest.digest.to_string())?);
        headers.insert(
            header::CONTENT_LENGTH,
            header_value(manifest.payload.len().to_string())?,
        );

        if head {
            return Ok((StatusCode::OK, headers).into_response());
        }
        Ok((StatusCode::OK, headers, manifest.payload).into_response())
    }

    async fn put_manifest(
        &self,
        image: &str,
        reference: &Reference,
        content_type: Option<&str>,
        payload: Bytes,
    ) -> RegistryResult<Response> {
        let record = self
            .ctx
            .oci()
            .primary_only(self.scope(), self.registry, Some(image), |registry, oci| {
                async move {
                    oci.put_manifest(&registry, image, reference, content_type, payload)
                        .await
                }
            })
            .await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            header_value(format!(
                "/v2/{}/{image}/manifests/{}",
                self.registry, record.digest
            ))?,
        );
        headers.insert(DOCKER_CONTENT_DIGEST, header_value(record.digest.to_string())?);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        Ok((StatusCode::CREATED, headers).into_response())
    }

    async fn delete_manifest(&self, image: &str, reference: &Reference) -> RegistryResult<Response> {
        self.ctx
            .oci()
            .primary_only(self.scope(), self.registry, Some(image), |registry, oci| {
                async move { oci.delete_manifest(&registry, image, reference).await }
            })
            .await?;
        Ok(StatusCode::ACCEPTED.into_response())
    }

    async fn get_blob(
        &self,
        image: &str,
        digest: &Digest,
        range: Option<BlobRange>,
    ) -> RegistryResult<Response> {
        let principal = self.principal;
        let blob = self
            .ctx
            .oci()
            .fallback_by_name(self.scope(), self.registry, Some(image), |registry, oci| {
                async move {
                    oci.get_blob(principal, &registry, image, digest, range)
                        .await
                }
            })
            .await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(DOCKER_CONTENT_DIGEST, header_value(blob.digest.to_string())?);
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(
            header::CONTENT_LENGTH,
            header_value(blob.bytes.len().to_string())?,
        );

        match blob.range {
            Some((first, last)) => {
                headers.insert(
                    header::CONTENT_RANGE,
                    header_value(format!("bytes {first}-{last}/{}", blob.size))?,
                );
                Ok((StatusCode::PARTIAL_CONTENT, headers, blob.bytes).into_response())
            }
            None => Ok((StatusCode::OK, headers, blob.bytes).into_response()),
        }
    }

    async fn head_blob(&self, image: &str, digest: &Digest) -> RegistryResult<Response> {
        let principal = self.principal;
        let size = self
            .ctx
            .oci()
            .fallback_by_name(self.scope(), self.registry, Some(image), |registry, oci| {
                async move { oci.blob_size(principal, &registry, image, digest).await }
            })
            .await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(DOCKER_CONTENT_DIGEST, header_value(digest.to_string())?);
        headers.insert(header::CONTENT_LENGTH, header_value(size.to_string())?);
        Ok((StatusCode::OK, headers).into_response())
    }

    async fn delete_blob(&self, image: &str, digest: &Digest) -> RegistryResult<Response> {
        self.ctx
            .oci()
            .primary_only(self.scope(), self.registry, Some(image), |registry, oci| {
                async move { oci.delete_blob(&registry, image, digest).await }
            })
            .await?;
        Ok(StatusCode::ACCEPTED.into_response())
    }

    /// `POST .../blobs/uploads/`: mount, monolithic upload, or a new session.
    async fn start_upload(
        &self,
        image: &str,
        query: &OciQuery,
        body: Bytes,
    ) -> RegistryResult<Response> {
        if let (Some(mount), Some(from)) = (&query.mount, &query.from) {
            let digest: Digest = mount.parse()?;
            check_repository_name(from)?;
            let mounted = self
                .ctx
                .oci()
                .primary_only(self.scope(), self.registry, Some(image), |registry, oci| {
                    let digest = &digest;
                    async move { oci.mount_blob(&registry, image, from, digest).await }
                })
                .await?;
            if mounted.is_some() {
                return self.blob_created(image, &digest);
            }
            tracing::debug!(%digest, from, "mount source missing, opening upload session");
        } else if let Some(digest) = &query.digest {
            let digest: Digest = digest.parse()?;
            let stored = self
                .ctx
                .oci()
                .primary_only(self.scope(), self.registry, Some(image), |registry, oci| {
                    let digest = &digest;
                    async move { oci.put_blob(&registry, image, digest, body).await }
                })
                .await?;
            return self.blob_created(image, &stored.digest);
        }

        let session = self
            .ctx
            .oci()
            .primary_only(self.scope(), self.registry, Some(image), |registry, oci| {
                async move { oci.start_upload(&registry, image).await }
            })
            .await?;
        self.upload_response(StatusCode::ACCEPTED, image, &session)
    }

    /// The session named in the path, checked against the repository and `_state`.
    ///
    /// Writers pass `wait = false`: a session busy with another request is refused with
    /// `RangeInvalid` rather than queued behind it.
    async fn session(
        &self,
        image: &str,
        id: &str,
        query: &OciQuery,
        wait: bool,
    ) -> RegistryResult<UploadSession> {
        let id: UploadId = id.parse()?;
        let registry = self
            .ctx
            .oci()
            .resolver()
            .primary(self.scope(), self.registry)
            .await?;
        let session = if wait {
            self.ctx.uploads().status(id).await?
        } else {
            self.ctx.uploads().try_status(id).await?
        };

        if session.registry != registry.id || session.image != image {
            return Err(RegistryError::BlobUploadUnknown(id.to_string()));
        }
        if let Some(state) = &query.state {
            UploadSessionManager::check_state_token(state, &session)?;
        }
        Ok(session)
    }

    async fn append(
        &self,
        image: &str,
        id: &str,
        query: &OciQuery,
        range: Option<ChunkRange>,
        body: Bytes,
    ) -> RegistryResult<Response> {
        let session = self.session(image, id, query, false).await?;
        self.ctx
            .uploads()
            .append_chunk(session.id, range, body)
            .await?;
        let session = self.ctx.uploads().status(session.id).await?;
        self.upload_response(StatusCode::ACCEPTED, image, &session)
    }

    async fn complete_upload(
        &self,
        image: &str,
        id: &str,
        query: &OciQuery,
        body: Bytes,
    ) -> RegistryResult<Response> {
        let digest: Digest = query
            .digest
            .as_deref()
            .ok_or_else(|| RegistryError::BlobUploadInvalid("missing digest".to_string()))?
            .parse()?;
        let session = self.session(image, id, query, false).await?;
        let id = session.id;

        let committed = self
            .ctx
            .oci()
            .primary_only(self.scope(), self.registry, Some(image), |registry, oci| {
                let digest = &digest;
                async move {
                    oci.complete_upload(&registry, image, id, body, digest)
                        .await
                }
            })
            .await?;
        self.blob_created(image, &committed.digest)
    }

    async fn upload_status(
        &self,
        image: &str,
        id: &str,
        query: &OciQuery,
    ) -> RegistryResult<Response> {
        let session = self.session(image, id, query, true).await?;
        self.upload_response(StatusCode::NO_CONTENT, image, &session)
    }

    async fn cancel_upload(
        &self,
        image: &str,
        id: &str,
        query: &OciQuery,
    ) -> RegistryResult<Response> {
        let session = self.session(image, id, query, true).await?;
        self.ctx.uploads().cancel(session.id).await?;
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_split_from_the_right() {
        assert_eq!(
            Target::parse("team/app/manifests/latest"),
            Some(Target::Manifest {
                image: "team/app",
                reference: "latest"
            })
        );
        assert_eq!(
            Target::parse("blobs/app/blobs/sha256:abc"),
            Some(Target::Blob {
                image: "blobs/app",
                digest: "sha256:abc"
            })
        );
        assert_eq!(
            Target::parse("app/blobs/uploads/"),
            Some(Target::Uploads {
                image: "app",
                session: None
            })
        );
        assert_eq!(
            Target::parse("a/b/blobs/uploads/1234"),
            Some(Target::Uploads {
                image: "a/b",
                session: Some("1234")
            })
        );
        assert_eq!(
            Target::parse("app/tags/list"),
            Some(Target::Tags { image: "app" })
        );
        assert_eq!(Target::parse("app/other"), None);
    }
}
