use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use parcel_server::config::ServerConfig;
use parcel_server::storage::DiskBlobStore;
use parcel_server::store::MemorySessionStore;
use parcel_server::{build_state, router};
use parcel_transfer::digest_hex;
use parcel_types::{HashAlgorithm, headers};
use serde_json::{Value, json};
use tower::ServiceExt;

const MIB: usize = 1024 * 1024;

async fn app() -> (Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        storage_dir: dir.path().to_path_buf(),
        public_url: "http://parcel.test".into(),
        ..ServerConfig::default()
    };
    let blobs = DiskBlobStore::new(config.storage_dir.clone()).await.unwrap();
    let state = build_state(
        Arc::new(config),
        Arc::new(MemorySessionStore::new()),
        Arc::new(blobs),
    );
    (router(state), dir)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, req).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn init_body(size: Option<u64>, chunk_size: Option<u64>) -> Value {
    json!({
        "chunkSize": chunk_size,
        "fileMetadata": { "size": size, "metadata": "enc-meta", "name": "x.bin", "type": "application/octet-stream" },
        "authorization": "auth-token",
        "sessionId": "client-session",
        "securityConfig": { "enableVerification": true, "hashAlgorithm": "SHA-256" }
    })
}

fn chunk_request(upload_id: &str, index: u32, data: Vec<u8>, hash: &str) -> Request<Body> {
    Request::post("/api/upload/chunk")
        .header(headers::UPLOAD_ID, upload_id)
        .header(headers::SESSION_ID, "client-session")
        .header(headers::CHUNK_INDEX, index.to_string())
        .header(headers::TOTAL_CHUNKS, "3")
        .header(headers::CHUNK_HASH, hash)
        .header(headers::HASH_ALGORITHM, "SHA-256")
        .body(Body::from(data))
        .unwrap()
}

async fn init(app: &Router, size: u64, chunk_size: Option<u64>) -> Value {
    let body = init_body(Some(size), chunk_size);
    let (status, body) = send_json(app, post_json("/api/upload/init", body)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body
}

#[tokio::test]
async fn twelve_megabytes_in_five_megabyte_chunks() {
    let (app, _dir) = app().await;
    let payload: Vec<u8> = (0..12 * MIB).map(|i| (i % 251) as u8).collect();

    let init = init(&app, payload.len() as u64, None).await;
    assert_eq!(init["totalChunks"], 3);
    assert_eq!(init["chunkSize"], 5 * MIB);
    assert_eq!(init["sessionId"], "client-session");
    let upload_id = init["uploadId"].as_str().unwrap().to_string();

    let mut hashes = Vec::new();
    for (index, part) in payload.chunks(5 * MIB).enumerate() {
        let hash = digest_hex(HashAlgorithm::Sha256, part);
        let (status, body) =
            send_json(&app, chunk_request(&upload_id, index as u32, part.to_vec(), &hash)).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["receivedChunks"], index + 1);
        hashes.push(hash);
    }

    let (status, done) = send_json(
        &app,
        post_json(
            "/api/upload/finalize",
            json!({
                "uploadId": upload_id,
                "totalChunks": 3,
                "totalSize": payload.len(),
                "integrityHashes": hashes,
                "metrics": { "durationMs": 10, "retries": 0, "averageSpeedBps": 1.0 }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", done);
    assert_eq!(done["size"], 12 * MIB);
    assert_eq!(done["chunks"], 3);
    let file_id = done["fileId"].as_str().unwrap();
    assert_eq!(done["url"], format!("http://parcel.test/api/download/{}", file_id));

    let uri = format!("/api/download/{}", file_id);
    let (status, bytes) = send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, payload);

    // single download allowance by default
    let (status, _) = send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn init_without_size_is_rejected() {
    let (app, _dir) = app().await;
    for size in [None, Some(0)] {
        let (status, body) = send_json(&app, post_json("/api/upload/init", init_body(size, None))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");
    }
}

#[tokio::test]
async fn corrupted_chunk_is_rejected_then_retried() {
    let (app, _dir) = app().await;
    let init = init(&app, 30, Some(10)).await;
    let upload_id = init["uploadId"].as_str().unwrap();

    let first = vec![1u8; 10];
    let (status, _) = send_json(
        &app,
        chunk_request(upload_id, 0, first.clone(), &digest_hex(HashAlgorithm::Sha256, &first)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let second = vec![2u8; 10];
    let wrong = digest_hex(HashAlgorithm::Sha256, b"something else");
    let (status, body) = send_json(&app, chunk_request(upload_id, 1, second.clone(), &wrong)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "integrity");

    let status_uri = format!("/api/upload/{}/status", upload_id);
    let (_, status_body) =
        send_json(&app, Request::get(&status_uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status_body["receivedChunks"], 1);

    let (status, body) = send_json(
        &app,
        chunk_request(upload_id, 1, second.clone(), &digest_hex(HashAlgorithm::Sha256, &second)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["receivedChunks"], 2);
}

#[tokio::test]
async fn finalize_before_all_chunks_reports_counts() {
    let (app, _dir) = app().await;
    let init = init(&app, 30, Some(10)).await;
    let upload_id = init["uploadId"].as_str().unwrap();

    let data = vec![7u8; 10];
    send_json(
        &app,
        chunk_request(upload_id, 0, data.clone(), &digest_hex(HashAlgorithm::Sha256, &data)),
    )
    .await;

    let (status, body) = send_json(
        &app,
        post_json("/api/upload/finalize", json!({ "uploadId": upload_id, "totalChunks": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "incomplete_upload");
    assert_eq!(body["received"], 1);
    assert_eq!(body["expected"], 3);
}

#[tokio::test]
async fn unknown_sessions_are_not_found() {
    let (app, _dir) = app().await;

    let (status, body) = send_json(&app, chunk_request("missing", 0, vec![1], "00")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = send_json(
        &app,
        Request::get("/api/upload/missing/status").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chunk_without_upload_id_is_a_validation_error() {
    let (app, _dir) = app().await;
    let req = Request::post("/api/upload/chunk")
        .header(headers::CHUNK_INDEX, "0")
        .body(Body::from(vec![1u8]))
        .unwrap();
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");
}

#[tokio::test]
async fn cleanup_always_succeeds_and_removes_session() {
    let (app, _dir) = app().await;
    let init = init(&app, 10, None).await;
    let upload_id = init["uploadId"].as_str().unwrap();

    for _ in 0..2 {
        let uri = format!("/api/upload/{}", upload_id);
        let (status, body) =
            send_json(&app, Request::delete(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    let uri = format!("/api/upload/{}/status", upload_id);
    let (status, _) = send_json(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_uploads_and_error_rate() {
    let (app, _dir) = app().await;
    init(&app, 10, None).await;
    send_json(&app, post_json("/api/upload/init", init_body(None, None))).await;

    let (status, body) =
        send_json(&app, Request::get("/api/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["activeUploads"], 1);
    assert_eq!(body["totalUploads"], 1);
    assert_eq!(body["errorRate"], 0.5);
    assert_eq!(body["status"], "warning");
}

#[tokio::test]
async fn malformed_json_answers_with_an_error_body() {
    let (app, _dir) = app().await;

    let (status, body) =
        send_json(&app, post_json("/api/upload/init", json!({ "authorization": "a" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");
    assert!(body["message"].as_str().unwrap().starts_with("invalid metadata"));

    let req = Request::post("/api/upload/finalize")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");
}
