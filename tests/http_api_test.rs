//! End-to-end HTTP tests against a real server process and a
//! local-filesystem backend: dataset listing, incremental ingest/read
//! round trips across the codec matrix, change-feed continuation, and
//! error-status mapping.

mod common;

use common::TestServer;
use serde_json::{json, Value};

#[tokio::test]
async fn lists_configured_datasets() {
    let server = TestServer::start(json!([
        {"dataset": "people", "storageType": "localstorage"},
    ]))
    .await;

    let resp = reqwest::get(format!("{}/datasets", server.base_url())).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let names: Vec<&str> = body.as_array().unwrap().iter().map(|d| d["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["people"]);
}

#[tokio::test]
async fn json_dataset_round_trips_entities() {
    let server = TestServer::start(json!([
        {"dataset": "people", "storageType": "localstorage"},
    ]))
    .await;

    let client = reqwest::Client::new();
    let body = json!([
        {"id": "@context", "namespaces": {"a": "http://example.com/a/"}},
        {"id": "a:1", "props": {"a:name": "Frank"}},
        {"id": "a:2", "props": {"a:name": "Bob"}},
    ]);

    let resp = client
        .post(format!("{}/datasets/people/entities", server.base_url()))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Incremental writes land under `changes/…`; `GetEntities` is the
    // fullsync snapshot reader, a separate object space (spec §4.9).
    let resp = client
        .get(format!("{}/datasets/people/changes", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let out: Value = resp.json().await.unwrap();
    let arr = out.as_array().unwrap();
    assert_eq!(arr[0]["id"], "@context");
    let ids: Vec<&str> = arr[1..arr.len() - 1].iter().map(|e| e["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["a:1", "a:2"]);
    assert_eq!(arr.last().unwrap()["id"], "@continuation");
}

#[tokio::test]
async fn csv_dataset_round_trips_through_lowering() {
    let server = TestServer::start(json!([
        {
            "dataset": "rows",
            "storageType": "localstorage",
            "csv": {"header": true, "order": ["id", "name"]},
            "decode": {"defaultNamespace": "ns"},
        },
    ]))
    .await;

    let client = reqwest::Client::new();
    let body = json!([
        {"id": "@context", "namespaces": {}},
        {"id": "r:1", "props": {"ns:name": "Frank"}},
    ]);
    let resp = client
        .post(format!("{}/datasets/rows/entities", server.base_url()))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/datasets/rows/changes", server.base_url()))
        .send()
        .await
        .unwrap();
    let out: Value = resp.json().await.unwrap();
    let arr = out.as_array().unwrap();
    assert_eq!(arr[0]["id"], "@context");
    assert_eq!(arr[1]["id"], "r:1");
    assert_eq!(arr[1]["props"]["ns:name"], "Frank");
    assert_eq!(arr.last().unwrap()["id"], "@continuation");
}

#[tokio::test]
async fn changes_endpoint_returns_a_continuation_token() {
    let server = TestServer::start(json!([
        {"dataset": "events", "storageType": "localstorage"},
    ]))
    .await;

    let client = reqwest::Client::new();
    let body = json!([
        {"id": "@context", "namespaces": {}},
        {"id": "e:1"},
    ]);
    client
        .post(format!("{}/datasets/events/entities", server.base_url()))
        .json(&body)
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{}/datasets/events/changes", server.base_url()))
        .send()
        .await
        .unwrap();
    let out: Value = resp.json().await.unwrap();
    let arr = out.as_array().unwrap();
    let last = arr.last().unwrap();
    assert_eq!(last["id"], "@continuation");
    assert!(!last["token"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_dataset_is_404() {
    let server = TestServer::start(json!([])).await;
    let resp = reqwest::get(format!("{}/datasets/missing/entities", server.base_url())).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn fullsync_against_a_backend_that_does_not_support_it_is_400() {
    let server = TestServer::start(json!([
        {"dataset": "people", "storageType": "localstorage"},
    ]))
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/datasets/people/entities", server.base_url()))
        .header("universal-data-api-full-sync-id", "session-1")
        .header("universal-data-api-full-sync-start", "true")
        .json(&json!([{"id": "@context", "namespaces": {}}]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn malformed_body_is_400() {
    let server = TestServer::start(json!([
        {"dataset": "people", "storageType": "localstorage"},
    ]))
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/datasets/people/entities", server.base_url()))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
