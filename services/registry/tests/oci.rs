//! OCI distribution API over HTTP.

mod common;

use artifact_registry::config::Limits;
use artifact_registry::digest::Digest;
use artifact_registry::manifest::OCI_MANIFEST;
use artifact_registry::model::{PackageType, RegistryId};
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{
    GatedStorage, TestRegistry, body, header, json, proxy_registry, virtual_registry,
};

fn registry() -> TestRegistry {
    TestRegistry::new(vec![
        virtual_registry(1, "images", PackageType::Oci, &[]),
        virtual_registry(2, "other", PackageType::Oci, &[]),
        proxy_registry(3, "hub", PackageType::Oci, "http://upstream.test/"),
    ])
}

async fn push_blob(registry: &TestRegistry, name: &str, image: &str, data: &[u8]) -> Digest {
    let digest = Digest::sha256(data);
    let response = registry
        .send(
            Request::post(format!("/v2/{name}/{image}/blobs/uploads/?digest={digest}"))
                .body(Body::from(data.to_vec()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header(&response, "docker-content-digest"), digest.to_string());
    digest
}

fn image_manifest(config: &Digest, layer: &Digest) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config.to_string(),
            "size": 2,
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": layer.to_string(),
            "size": 5,
        }],
    }))
    .unwrap()
}

#[tokio::test]
async fn test_api_version_check() {
    let registry = registry();
    let response = registry.get("/v2/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header(&response, "docker-distribution-api-version"),
        "registry/2.0"
    );
}

#[tokio::test]
async fn monolithic_upload_round_trips() {
    let registry = registry();
    let data = b"Hello, OCI Registry!";
    let digest = push_blob(&registry, "images", "team/app", data).await;

    let response = registry.get(&format!("/v2/images/team/app/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body(response).await[..], data);

    let response = registry
        .send(
            Request::head(format!("/v2/images/team/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-length"), data.len().to_string());
}

#[tokio::test]
async fn mismatched_digest_stores_nothing() {
    let registry = registry();
    let claimed = Digest::sha256(b"something else");

    let response = registry
        .send(
            Request::post(format!("/v2/images/app/blobs/uploads/?digest={claimed}"))
                .body(Body::from("actual bytes"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["errors"][0]["code"], "DIGEST_INVALID");

    let response = registry.get(&format!("/v2/images/app/blobs/{claimed}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!registry.context.content().exists(&claimed).await.unwrap());
}

#[tokio::test]
async fn chunked_upload_rejects_overlapping_chunks() {
    let registry = registry();
    let data: Vec<u8> = (0..150u8).collect();
    let digest = Digest::sha256(&data);

    let response = registry
        .send(
            Request::post("/v2/images/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header(&response, "range"), "0-0");
    let location = header(&response, "location").to_owned();
    assert!(location.contains("_state="));

    let response = registry
        .send(
            Request::patch(&location)
                .header(header::CONTENT_RANGE, "0-99")
                .body(Body::from(data[..100].to_vec()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header(&response, "range"), "0-99");

    let response = registry
        .send(
            Request::patch(&location)
                .header(header::CONTENT_RANGE, "50-149")
                .body(Body::from(data[50..].to_vec()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let response = registry.get(&location).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "range"), "0-99");

    let response = registry
        .send(
            Request::put(format!("{location}&digest={digest}"))
                .body(Body::from(data[100..].to_vec()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = registry.get(&format!("/v2/images/app/blobs/{digest}")).await;
    assert_eq!(&body(response).await[..], &data[..]);

    let response = registry.get(&location).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancelled_upload_is_gone() {
    let registry = registry();
    let response = registry
        .send(
            Request::post("/v2/images/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let location = header(&response, "location").to_owned();

    let response = registry
        .send(Request::delete(&location).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = registry.get(&location).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["errors"][0]["code"], "BLOB_UPLOAD_UNKNOWN");
}

async fn open_upload(registry: &TestRegistry) -> String {
    let response = registry
        .send(
            Request::post("/v2/images/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    header(&response, "location").to_owned()
}

#[tokio::test]
async fn concurrent_chunks_on_one_session_are_refused() {
    let gate = GatedStorage::new();
    let registry = TestRegistry::with_storage(
        vec![virtual_registry(1, "images", PackageType::Oci, &[])],
        upstream_client::mock::MockUpstream::new(),
        gate.clone().into(),
    );
    let location = open_upload(&registry).await;

    let first = registry.spawn(
        Request::patch(&location)
            .body(Body::from("first"))
            .unwrap(),
    );
    gate.parked().await;

    let response = registry
        .send(
            Request::patch(&location)
                .body(Body::from("second"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let response = registry
        .send(
            Request::put(format!("{location}&digest={}", Digest::sha256(b"second")))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    gate.release();
    let response = first.await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header(&response, "range"), "0-4");

    let digest = Digest::sha256(b"first");
    let response = registry
        .send(
            Request::put(format!("{location}&digest={digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let response = registry.get(&format!("/v2/images/app/blobs/{digest}")).await;
    assert_eq!(&body(response).await[..], b"first");
}

#[tokio::test]
async fn expired_uploads_are_unknown() {
    let registry = TestRegistry::with_limits(
        vec![virtual_registry(1, "images", PackageType::Oci, &[])],
        Limits {
            upload_session_ttl_secs: 0,
            ..Limits::default()
        },
    );
    let location = open_upload(&registry).await;

    let response = registry
        .send(
            Request::patch(&location)
                .body(Body::from("late"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["errors"][0]["code"], "BLOB_UPLOAD_UNKNOWN");

    let response = registry.get(&location).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(registry.context.uploads().len(), 0);
}

#[tokio::test]
async fn manifest_bodies_are_capped_but_blobs_are_not() {
    let registry = TestRegistry::with_limits(
        vec![virtual_registry(1, "images", PackageType::Oci, &[])],
        Limits {
            max_manifest_bytes: 64,
            ..Limits::default()
        },
    );

    let layer = vec![7u8; 4096];
    let layer = push_blob(&registry, "images", "app", &layer).await;
    let config = push_blob(&registry, "images", "app", b"{}").await;

    let manifest = image_manifest(&config, &layer);
    assert!(manifest.len() > 64);
    let response = registry
        .send(
            Request::put("/v2/images/app/manifests/v1")
                .header(header::CONTENT_TYPE, OCI_MANIFEST)
                .body(Body::from(manifest))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["errors"][0]["code"], "SIZE_INVALID");

    let response = registry.get("/v2/images/app/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unbounded_chunk_range_is_refused() {
    let registry = registry();
    let location = open_upload(&registry).await;

    let response = registry
        .send(
            Request::patch(&location)
                .header(header::CONTENT_RANGE, "0-18446744073709551615")
                .body(Body::from("x"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let response = registry.get(&location).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "range"), "0-0");
}

#[tokio::test]
async fn range_reads_return_partial_content() {
    let registry = registry();
    let digest = push_blob(&registry, "images", "app", b"0123456789").await;

    let response = registry
        .send(
            Request::get(format!("/v2/images/app/blobs/{digest}"))
                .header(header::RANGE, "bytes=2-5")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&response, "content-range"), "bytes 2-5/10");
    assert_eq!(&body(response).await[..], b"2345");

    let response = registry
        .send(
            Request::get(format!("/v2/images/app/blobs/{digest}"))
                .header(header::RANGE, "bytes=20-")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn identical_blobs_share_storage_but_not_visibility() {
    let registry = registry();
    let data = b"shared layer";
    let digest = push_blob(&registry, "images", "app", data).await;

    let response = registry.get(&format!("/v2/other/app/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    push_blob(&registry, "other", "app", data).await;

    let response = registry
        .send(
            Request::delete(format!("/v2/images/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = registry.get(&format!("/v2/images/app/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = registry.get(&format!("/v2/other/app/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body(response).await[..], data);
}

#[tokio::test]
async fn mount_links_blob_into_another_repository() {
    let registry = registry();
    let digest = push_blob(&registry, "images", "base", b"layer").await;

    let response = registry
        .send(
            Request::post(format!(
                "/v2/images/derived/blobs/uploads/?mount={digest}&from=base"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = registry.get(&format!("/v2/images/derived/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let missing = Digest::sha256(b"not here");
    let response = registry
        .send(
            Request::post(format!(
                "/v2/images/derived/blobs/uploads/?mount={missing}&from=base"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(header(&response, "location").contains("/v2/images/derived/blobs/uploads/"));
}

#[tokio::test]
async fn manifests_push_pull_and_list_tags() {
    let registry = registry();
    let config = push_blob(&registry, "images", "app", b"{}").await;
    let layer = push_blob(&registry, "images", "app", b"layer").await;
    let payload = image_manifest(&config, &layer);
    let expected = Digest::sha256(&payload);

    for tag in ["v2", "v1"] {
        let response = registry
            .send(
                Request::put(format!("/v2/images/app/manifests/{tag}"))
                    .header(header::CONTENT_TYPE, OCI_MANIFEST)
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(header(&response, "docker-content-digest"), expected.to_string());
    }

    let response = registry.get("/v2/images/app/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), OCI_MANIFEST);
    assert_eq!(&body(response).await[..], &payload[..]);

    let response = registry.get(&format!("/v2/images/app/manifests/{expected}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let tags = json(registry.get("/v2/images/app/tags/list").await).await;
    assert_eq!(tags["name"], "app");
    assert_eq!(tags["tags"], serde_json::json!(["v1", "v2"]));

    let tags = json(registry.get("/v2/images/app/tags/list?n=1").await).await;
    assert_eq!(tags["tags"], serde_json::json!(["v1"]));

    let response = registry.get("/v2/images/app/manifests/v3").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["errors"][0]["code"], "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn manifest_with_unknown_blob_is_rejected() {
    let registry = registry();
    let config = push_blob(&registry, "images", "app", b"{}").await;
    let payload = image_manifest(&config, &Digest::sha256(b"never pushed"));

    let response = registry
        .send(
            Request::put("/v2/images/app/manifests/latest")
                .header(header::CONTENT_TYPE, OCI_MANIFEST)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");
}

#[tokio::test]
async fn quarantined_blob_is_refused() {
    let registry = registry();
    let digest = push_blob(&registry, "images", "app", b"bad layer").await;
    registry
        .metadata
        .set_quarantine(RegistryId(1), "app", &digest, true)
        .await;

    let response = registry.get(&format!("/v2/images/app/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json(response).await["errors"][0]["code"], "DENIED");
}

#[tokio::test]
async fn proxy_registries_refuse_pushes() {
    let registry = registry();
    let response = registry
        .send(
            Request::post("/v2/hub/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(registry.upstream.calls(), 0);
}

#[tokio::test]
async fn invalid_names_and_digests() {
    let registry = registry();

    let response = registry.get("/v2/images/App/blobs/sha256:abc").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["errors"][0]["code"], "NAME_INVALID");

    let response = registry.get("/v2/images/app/blobs/invalid-digest").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = registry.get("/v2/missing/app/manifests/latest").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blobs_are_stored_once_on_disk() {
    let storage = storage::Storage::new(storage::TempDriver::new().unwrap());
    let registry = common::TestRegistry::with_storage(
        vec![
            virtual_registry(1, "images", PackageType::Oci, &[]),
            virtual_registry(2, "other", PackageType::Oci, &[]),
        ],
        upstream_client::mock::MockUpstream::new(),
        storage,
    );

    let data = b"layer pushed twice";
    let digest = push_blob(&registry, "images", "app", data).await;
    push_blob(&registry, "other", "app", data).await;
    push_blob(&registry, "images", "copy", data).await;

    let blobs = registry
        .context
        .content()
        .bucket()
        .list(Some(camino::Utf8Path::new("blobs")))
        .await
        .unwrap();
    assert_eq!(blobs.len(), 1);

    let response = registry.get(&format!("/v2/other/app/blobs/{digest}")).await;
    assert_eq!(&body(response).await[..], data);
}
