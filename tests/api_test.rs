//! HTTP surface, driven through the router with `tower::ServiceExt::oneshot`.

mod common;

use audit_ledger::api::{router, AppState};
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{append_events, setup_test_ledger, test_config};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn app(entries: usize) -> Router {
    let (ledger, clock) = setup_test_ledger("2023-06-15T09:00:00Z").await;
    append_events(&ledger, &clock, entries).await;
    router(AppState::new(ledger, test_config()))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value, Option<String>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body, disposition)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = app(0).await;
    let (status, body, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_verify_chain_endpoint() {
    let app = app(5).await;

    let (status, body, _) = send(&app, post("/verify-chain?startId=2&endId=4")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["checkedCount"], 3);
    assert_eq!(body["brokenAtId"], Value::Null);

    let (status, body, _) = send(&app, post("/verify-chain")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checkedCount"], 5);
}

#[tokio::test]
async fn test_bad_ids_are_client_errors() {
    let app = app(2).await;

    let (status, body, _) = send(&app, post("/verify-chain?startId=5&endId=1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("range"));

    let (status, _, _) = send(&app, post("/verify-chain?startId=abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, post("/verify/0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, post("/verify/99")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, get("/metadata/99")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_append_verify_and_metadata() {
    let app = app(0).await;

    let event = json!({
        "actorId": "u-42",
        "actorName": "Buyer",
        "action": "create_purchase_order",
        "entityType": "purchase_order",
        "entityId": "PO-1",
        "changes": "{\"total\": 1200.50}"
    });
    let (status, body, _) = send(&app, post_json("/events", event)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], 1);
    assert_eq!(body["changes"], "{\"total\": 1200.50}");

    let (status, body, _) = send(&app, post("/verify/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);

    let (status, body, _) = send(&app, get("/metadata/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["location"]["store"], "live");
    assert_eq!(body["chainDigest"].as_str().unwrap().len(), "sha256:".len() + 64);

    let missing_actor = json!({ "actorId": "", "actorName": "x", "action": "a", "entityType": "t" });
    let (status, _, _) = send(&app, post_json("/events", missing_actor)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_endpoint() {
    let app = app(5).await;

    let (status, body, _) = send(&app, get("/list?page=2&limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 5);
    assert_eq!(body["totalPages"], 3);
    let ids: Vec<i64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![3, 2]);

    let (status, _, _) = send(&app, get("/list?isSensitive=maybe")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_export_endpoint() {
    let app = app(3).await;

    let request = Request::builder()
        .uri("/export?entityType=rfq")
        .header("x-actor-id", "auditor-7")
        .header("x-actor-name", "Auditor Seven")
        .body(Body::empty())
        .unwrap();
    let (status, body, disposition) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(disposition.unwrap().starts_with("attachment; filename=\"audit-export-"));
    assert_eq!(body["totalRecords"], 3);
    assert_eq!(body["exportedBy"]["id"], "auditor-7");
    assert_eq!(body["records"][0]["previousDigest"], audit_ledger::audit::GENESIS_DIGEST);

    let (_, stats, _) = send(&app, get("/stats")).await;
    assert_eq!(stats["totalLive"], 4);
}

#[tokio::test]
async fn test_archive_endpoint_and_stats() {
    let app = app(4).await;

    let (status, body, _) = send(&app, post_json("/archive", json!({ "beforeId": 2 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["partitions"][0]["partitionKey"], 2023);
    assert_eq!(body["partitions"][0]["lastId"], 2);

    let (_, body, _) = send(&app, get("/metadata/1")).await;
    assert_eq!(body["location"]["store"], "archive");
    assert_eq!(body["location"]["partitionKey"], 2023);
    assert_eq!(body["partition"]["rowCount"], 2);

    let (_, stats, _) = send(&app, get("/stats")).await;
    assert_eq!(stats["totalLive"], 2);
    assert_eq!(stats["totalArchived"], 2);
    assert_eq!(stats["lastKnownValid"], Value::Null);

    send(&app, post("/verify-chain")).await;
    let (_, stats, _) = send(&app, get("/stats")).await;
    assert_eq!(stats["lastKnownValid"], true);

    let (status, _, _) = send(
        &app,
        post_json("/archive", json!({ "beforeId": 3, "retentionDays": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
