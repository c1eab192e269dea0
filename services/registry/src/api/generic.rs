//! Generic file endpoints.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use bytes::Bytes;

use crate::context::RegistryContext;
use crate::error::RegistryResult;
use crate::formats::check_path_name;
use crate::model::Principal;

type FilePath = Path<(String, String, String, String, String)>;

pub(super) fn router() -> Router<RegistryContext> {
    Router::new().route(
        "/pkg/{root}/{registry}/generic/{image}/{version}/{*filename}",
        get(get_file).put(put_file).delete(delete_file),
    )
}

fn check(image: &str, version: &str, filename: &str) -> RegistryResult<()> {
    check_path_name(image)?;
    check_path_name(version)?;
    check_path_name(filename)
}

async fn get_file(
    State(ctx): State<RegistryContext>,
    principal: Principal,
    Path((root, registry, image, version, filename)): FilePath,
) -> RegistryResult<Response> {
    check(&image, &version, &filename)?;

    let principal = &principal;
    let (image, version, filename) = (image.as_str(), version.as_str(), filename.as_str());
    let bytes = ctx
        .generic()
        .fallback_by_name(&root, &registry, Some(image), |registry, generic| async move {
            generic
                .get_file(principal, &registry, image, version, filename)
                .await
        })
        .await?;

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

#[tracing::instrument(skip(ctx, body), fields(size = body.len()))]
async fn put_file(
    State(ctx): State<RegistryContext>,
    Path((root, registry, image, version, filename)): FilePath,
    body: Bytes,
) -> RegistryResult<Response> {
    check(&image, &version, &filename)?;

    let (image, version, filename) = (image.as_str(), version.as_str(), filename.as_str());
    let file = ctx
        .generic()
        .primary_only(&root, &registry, Some(image), |registry, generic| async move {
            generic
                .put_file(&registry, image, version, filename, body)
                .await
        })
        .await?;

    Ok((StatusCode::CREATED, Json(file)).into_response())
}

async fn delete_file(
    State(ctx): State<RegistryContext>,
    Path((root, registry, image, version, filename)): FilePath,
) -> RegistryResult<Response> {
    check(&image, &version, &filename)?;

    let (image, version, filename) = (image.as_str(), version.as_str(), filename.as_str());
    ctx.generic()
        .primary_only(&root, &registry, Some(image), |registry, generic| async move {
            generic
                .delete_file(&registry, image, version, filename)
                .await
        })
        .await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}
