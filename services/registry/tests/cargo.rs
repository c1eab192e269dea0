//! Cargo registry API over HTTP.

mod common;

use artifact_registry::config::Limits;
use artifact_registry::digest::Digest;
use artifact_registry::model::PackageType;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{TestRegistry, body, json, proxy_registry, publish_body, virtual_registry};
use upstream_client::mock::MockUpstream;

const API: &str = "/pkg/root/crates/cargo";

fn registry(upstream: MockUpstream) -> TestRegistry {
    TestRegistry::with_upstream(
        vec![
            virtual_registry(1, "crates", PackageType::Cargo, &[2]),
            proxy_registry(2, "mirror", PackageType::Cargo, "http://upstream.test/cargo/"),
        ],
        upstream,
    )
}

fn index_lines(bytes: &[u8]) -> Vec<serde_json::Value> {
    std::str::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

async fn publish(registry: &TestRegistry, name: &str, version: &str, archive: &[u8]) -> StatusCode {
    registry
        .put(
            &format!("{API}/api/v1/crates/new"),
            publish_body(name, version, archive),
        )
        .await
        .status()
}

#[tokio::test]
async fn publish_updates_index_and_serves_download() {
    let registry = registry(MockUpstream::new());
    let archive = b"demo crate archive";

    let response = registry
        .put(
            &format!("{API}/api/v1/crates/new"),
            publish_body("demo", "1.0.0", archive),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(json(response).await["warnings"]["other"].is_array());

    assert_eq!(publish(&registry, "demo", "1.1.0", b"newer").await, StatusCode::OK);

    let response = registry.get(&format!("{API}/index/de/mo/demo")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let lines = index_lines(&body(response).await);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["name"], "demo");
    assert_eq!(lines[0]["vers"], "1.0.0");
    assert_eq!(lines[0]["cksum"], Digest::sha256(archive).hex());
    assert_eq!(lines[0]["yanked"], false);
    assert_eq!(lines[1]["vers"], "1.1.0");

    let response = registry
        .get(&format!("{API}/api/v1/crates/demo/1.0.0/download"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body(response).await[..], archive);
    assert_eq!(registry.upstream.calls(), 0);
}

#[tokio::test]
async fn duplicate_versions_conflict() {
    let registry = registry(MockUpstream::new());
    assert_eq!(publish(&registry, "demo", "1.0.0", b"a").await, StatusCode::OK);

    let response = registry
        .put(
            &format!("{API}/api/v1/crates/new"),
            publish_body("demo", "1.0.0", b"b"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let errors = json(response).await;
    assert!(errors["errors"][0]["detail"].is_string());
}

#[tokio::test]
async fn names_differing_in_case_are_the_same_crate() {
    let registry = registry(MockUpstream::new());
    assert_eq!(publish(&registry, "Demo", "1.0.0", b"a").await, StatusCode::OK);
    assert_eq!(publish(&registry, "demo", "2.0.0", b"b").await, StatusCode::CONFLICT);
    assert_eq!(publish(&registry, "Demo", "2.0.0", b"b").await, StatusCode::OK);

    let index = body(registry.get(&format!("{API}/index/de/mo/demo")).await).await;
    let lines = index_lines(&index);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["name"], "Demo");

    let response = registry
        .get(&format!("{API}/api/v1/crates/demo/1.0.0/download"))
        .await;
    assert_eq!(&body(response).await[..], b"a");
}

#[tokio::test]
async fn oversized_publish_is_refused() {
    let registry = TestRegistry::with_limits(
        vec![virtual_registry(1, "crates", PackageType::Cargo, &[])],
        Limits {
            max_publish_bytes: 1024,
            ..Limits::default()
        },
    );

    let response = registry
        .put(
            &format!("{API}/api/v1/crates/new"),
            publish_body("demo", "1.0.0", &[0u8; 2048]),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    assert_eq!(publish(&registry, "demo", "1.0.0", b"small").await, StatusCode::OK);
}

#[tokio::test]
async fn malformed_publish_is_rejected() {
    let registry = registry(MockUpstream::new());
    let response = registry
        .put(&format!("{API}/api/v1/crates/new"), &b"\x10\x00"[..])
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(
        publish(&registry, "demo", "not-a-version", b"a").await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn yank_and_unyank_rewrite_the_index() {
    let registry = registry(MockUpstream::new());
    assert_eq!(publish(&registry, "demo", "1.0.0", b"a").await, StatusCode::OK);

    let response = registry
        .send(
            Request::delete(format!("{API}/api/v1/crates/demo/1.0.0/yank"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["ok"], true);

    let index = body(registry.get(&format!("{API}/index/de/mo/demo")).await).await;
    assert_eq!(index_lines(&index)[0]["yanked"], true);

    let response = registry
        .put(&format!("{API}/api/v1/crates/demo/1.0.0/unyank"), "")
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let index = body(registry.get(&format!("{API}/index/de/mo/demo")).await).await;
    assert_eq!(index_lines(&index)[0]["yanked"], false);
}

#[tokio::test]
async fn yanking_never_reaches_upstream() {
    let mut upstream = MockUpstream::new();
    upstream.ok(
        "/cargo/api/v1/crates/remote/1.0.0/download",
        "application/octet-stream",
        b"remote crate".to_vec(),
    );
    let registry = registry(upstream);

    let response = registry
        .send(
            Request::delete(format!("{API}/api/v1/crates/remote/1.0.0/yank"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = registry
        .send(
            Request::delete("/pkg/root/mirror/cargo/api/v1/crates/remote/1.0.0/yank")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(registry.upstream.calls(), 0);
}

#[tokio::test]
async fn upstream_crates_are_cached_on_first_download() {
    let mut upstream = MockUpstream::new();
    upstream.ok(
        "/cargo/index/re/mo/remote",
        "text/plain",
        br#"{"name":"remote","vers":"1.0.0","deps":[],"cksum":"00","features":{},"yanked":false}"#
            .to_vec(),
    );
    upstream.ok(
        "/cargo/api/v1/crates/remote/1.0.0/download",
        "application/octet-stream",
        b"remote crate".to_vec(),
    );
    let registry = registry(upstream);

    let response = registry.get(&format!("{API}/index/re/mo/remote")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(index_lines(&body(response).await)[0]["name"], "remote");

    let download = format!("{API}/api/v1/crates/remote/1.0.0/download");
    let response = registry.get(&download).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body(response).await[..], b"remote crate");

    registry.settle().await;

    let response = registry.get(&download).await;
    assert_eq!(&body(response).await[..], b"remote crate");
    assert_eq!(
        registry
            .upstream
            .calls_to("/cargo/api/v1/crates/remote/1.0.0/download"),
        1
    );
}

#[tokio::test]
async fn local_crates_shadow_upstream() {
    let mut upstream = MockUpstream::new();
    upstream.ok(
        "/cargo/index/de/mo/demo",
        "text/plain",
        br#"{"name":"demo","vers":"9.9.9","deps":[],"cksum":"00","features":{},"yanked":false}"#
            .to_vec(),
    );
    let registry = registry(upstream);
    assert_eq!(publish(&registry, "demo", "1.0.0", b"a").await, StatusCode::OK);

    let index = body(registry.get(&format!("{API}/index/de/mo/demo")).await).await;
    assert_eq!(index_lines(&index)[0]["vers"], "1.0.0");
    assert_eq!(registry.upstream.calls(), 0);
}

#[tokio::test]
async fn config_points_at_this_registry() {
    let registry = registry(MockUpstream::new());
    let response = registry
        .send(
            Request::get(format!("{API}/index/config.json"))
                .header(header::HOST, "registry.test:8080")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let config = json(response).await;
    assert_eq!(config["api"], "http://registry.test:8080/pkg/root/crates/cargo");
    assert_eq!(
        config["dl"],
        "http://registry.test:8080/pkg/root/crates/cargo/api/v1/crates"
    );
}

#[tokio::test]
async fn index_paths_must_match_the_crate() {
    let registry = registry(MockUpstream::new());
    assert_eq!(publish(&registry, "demo", "1.0.0", b"a").await, StatusCode::OK);

    let response = registry.get(&format!("{API}/index/xx/yy/demo")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
