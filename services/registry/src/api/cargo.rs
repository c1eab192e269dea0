//! Cargo registry endpoints under `/pkg/{root}/{registry}/cargo/`.

use axum::Router;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use bytes::Bytes;
use serde_json::json;

use crate::config::Limits;
use crate::context::RegistryContext;
use crate::error::RegistryError;
use crate::formats::cargo::{CratePublish, check_crate_name};
use crate::model::Principal;
use crate::remote::sparse_index_path;

/// Cargo reads `{"errors": [{"detail": ...}]}` from failed API calls.
#[derive(Debug)]
struct CargoError(RegistryError);

impl From<RegistryError> for CargoError {
    fn from(error: RegistryError) -> Self {
        Self(error)
    }
}

impl IntoResponse for CargoError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            tracing::error!(%status, error = %self.0, "cargo request failed");
        } else {
            tracing::debug!(%status, error = %self.0, "cargo request rejected");
        }
        (
            status,
            Json(json!({ "errors": [{ "detail": self.0.to_string() }] })),
        )
            .into_response()
    }
}

type CargoResult<T> = Result<T, CargoError>;

pub(super) fn router(limits: &Limits) -> Router<RegistryContext> {
    Router::new()
        .route("/pkg/{root}/{registry}/cargo/index/config.json", get(config))
        .route("/pkg/{root}/{registry}/cargo/index/{*path}", get(index_file))
        .route(
            "/pkg/{root}/{registry}/cargo/api/v1/crates/new",
            put(publish).layer(DefaultBodyLimit::max(limits.max_publish_bytes)),
        )
        .route(
            "/pkg/{root}/{registry}/cargo/api/v1/crates/{name}/{version}/download",
            get(download),
        )
        .route(
            "/pkg/{root}/{registry}/cargo/api/v1/crates/{name}/{version}/yank",
            delete(yank),
        )
        .route(
            "/pkg/{root}/{registry}/cargo/api/v1/crates/{name}/{version}/unyank",
            put(unyank),
        )
        .route(
            "/pkg/{root}/{registry}/cargo/api/v1/crates/{name}/regenerate-index",
            post(regenerate_index),
        )
}

/// `config.json` pointing Cargo at this registry's API and downloads.
async fn config(
    State(ctx): State<RegistryContext>,
    Path((root, registry)): Path<(String, String)>,
    headers: HeaderMap,
) -> CargoResult<Response> {
    ctx.cargo().resolver().primary(&root, &registry).await?;

    let base = match ctx.base_url() {
        Some(base) => base.to_owned(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("localhost");
            format!("http://{host}")
        }
    };
    let api = format!("{base}/pkg/{root}/{registry}/cargo");

    Ok(Json(json!({
        "dl": format!("{api}/api/v1/crates"),
        "api": api,
    }))
    .into_response())
}

async fn index_file(
    State(ctx): State<RegistryContext>,
    principal: Principal,
    Path((root, registry, path)): Path<(String, String, String)>,
) -> CargoResult<Response> {
    let name = path.rsplit('/').next().unwrap_or(path.as_str());
    check_crate_name(name)?;
    if sparse_index_path(name) != path {
        return Err(RegistryError::ArtifactNotFound(path.clone()).into());
    }

    let principal = &principal;
    let file = ctx
        .cargo()
        .fallback_by_name(&root, &registry, Some(name), |registry, cargo| async move {
            cargo.index_file(principal, &registry, name).await
        })
        .await?;

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], file).into_response())
}

async fn download(
    State(ctx): State<RegistryContext>,
    principal: Principal,
    Path((root, registry, name, version)): Path<(String, String, String, String)>,
) -> CargoResult<Response> {
    check_crate_name(&name)?;

    let principal = &principal;
    let (name, version) = (name.as_str(), version.as_str());
    let archive = ctx
        .cargo()
        .fallback_by_name(&root, &registry, Some(name), |registry, cargo| async move {
            cargo.download(principal, &registry, name, version).await
        })
        .await?;

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], archive).into_response())
}

#[tracing::instrument(skip(ctx, body), fields(size = body.len()))]
async fn publish(
    State(ctx): State<RegistryContext>,
    Path((root, registry)): Path<(String, String)>,
    body: Bytes,
) -> CargoResult<Response> {
    let publish = CratePublish::parse(body)?;
    let name = publish.metadata.name.clone();

    ctx.cargo()
        .primary_only(&root, &registry, Some(name.as_str()), |registry, cargo| async move {
            cargo.publish(&registry, publish).await
        })
        .await?;

    Ok(Json(json!({
        "warnings": {
            "invalid_categories": [],
            "invalid_badges": [],
            "other": [],
        }
    }))
    .into_response())
}

async fn set_yanked(
    ctx: &RegistryContext,
    root: &str,
    registry: &str,
    name: &str,
    version: &str,
    yanked: bool,
) -> CargoResult<Response> {
    check_crate_name(name)?;
    ctx.cargo()
        .primary_only(root, registry, Some(name), |registry, cargo| async move {
            cargo.set_yanked(&registry, name, version, yanked).await
        })
        .await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn yank(
    State(ctx): State<RegistryContext>,
    Path((root, registry, name, version)): Path<(String, String, String, String)>,
) -> CargoResult<Response> {
    set_yanked(&ctx, &root, &registry, &name, &version, true).await
}

async fn unyank(
    State(ctx): State<RegistryContext>,
    Path((root, registry, name, version)): Path<(String, String, String, String)>,
) -> CargoResult<Response> {
    set_yanked(&ctx, &root, &registry, &name, &version, false).await
}

async fn regenerate_index(
    State(ctx): State<RegistryContext>,
    Path((root, registry, name)): Path<(String, String, String)>,
) -> CargoResult<Response> {
    check_crate_name(&name)?;
    let name = name.as_str();
    ctx.cargo()
        .primary_only(&root, &registry, Some(name), |registry, cargo| async move {
            cargo.regenerate_index(&registry, name).await
        })
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
