//! End-to-end exercise of the HTTP surface: create a model, wait for the
//! background training to finish, predict, and check the envelope shape,
//! rate limiting and payload caps.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use modelforge_api::{create_router, AppState};
use modelforge_core::{
    DocumentStore, FeatureValue, MemoryDocumentStore, ModelStatus, Row, Settings,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn seeded_documents() -> Arc<MemoryDocumentStore> {
    let documents = Arc::new(MemoryDocumentStore::new());
    let rows: Vec<Row> = (0..50)
        .map(|i| {
            let mut row = Row::new();
            row.insert("age".into(), FeatureValue::Number(20.0 + (i % 40) as f64));
            row.insert(
                "income".into(),
                FeatureValue::Number(30_000.0 + i as f64 * 1_400.0),
            );
            row.insert(
                "category".into(),
                FeatureValue::Text(["A", "B", "C"][i % 3].into()),
            );
            row.insert(
                "region".into(),
                FeatureValue::Text(["N", "S", "E", "W"][i % 4].into()),
            );
            row.insert(
                "purchased".into(),
                FeatureValue::Bool(i % 2 == 0 || i % 3 == 0),
            );
            row
        })
        .collect();
    documents.insert_rows("t1", "purchases", rows);
    documents
}

async fn test_state(root: &std::path::Path) -> AppState {
    let mut settings = Settings::default();
    settings.storage.local_root = root.join("models").display().to_string();
    settings.pool.disk_dir = root.join("cache").display().to_string();
    settings.training.epochs = 25;
    settings.training.learning_rate = 0.01;
    settings.rate_limit.predict_per_window = 5;
    AppState::new(settings, Some(seeded_documents() as Arc<dyn DocumentStore>))
        .await
        .unwrap()
}

async fn call(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-tenant-id", "t1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-tenant-id", "t1")
        .body(Body::empty())
        .unwrap()
}

fn create_model_body() -> Value {
    json!({
        "name": "purchase-intent",
        "type": "classification",
        "config": {
            "algorithm": "dense_nn",
            "features": ["age", "income", "category", "region"],
            "target": "purchased"
        },
        "training_data": { "source": "purchases", "seed": 42 }
    })
}

async fn create_and_train(state: &AppState, router: &axum::Router) -> String {
    let (status, body) = call(router, post_json("/ai/models", create_model_body())).await;
    assert_eq!(status, StatusCode::OK, "create failed: {body}");
    let model_id = body["data"]["id"].as_str().unwrap().to_string();

    // Background training flips the status; poll the registry directly.
    let id = model_id.parse().unwrap();
    for _ in 0..600 {
        let record = state.registry.get(id).unwrap();
        match record.status {
            ModelStatus::Ready => return model_id,
            ModelStatus::Error => panic!("training errored: {:?}", record.last_error),
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("training did not finish in time");
}

#[tokio::test]
async fn create_train_predict_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path()).await;
    let router = create_router(state.clone());

    let model_id = create_and_train(&state, &router).await;

    let (status, body) = call(
        &router,
        post_json(
            &format!("/ai/models/{model_id}/predict"),
            json!({
                "input": { "age": 30, "income": 55000, "category": "B", "region": "S" }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "predict failed: {body}");
    assert_eq!(body["status"], "success");
    let label = body["data"]["output"]["prediction"].as_str().unwrap();
    assert!(label == "Class 0" || label == "Class 1");
    let confidence = body["data"]["output"]["confidence"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&confidence));
    let probabilities = body["data"]["output"]["probabilities"].as_object().unwrap();
    assert!(probabilities.contains_key("Class 0"));
    assert!(probabilities.contains_key("Class 1"));

    // The version directory metadata observed through the model detail.
    let (status, detail) = call(&router, get_req(&format!("/ai/models/{model_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["data"]["status"], "ready");
    assert_eq!(detail["data"]["current_version"], "1.0.0");
}

#[tokio::test]
async fn model_listing_is_paginated_and_tenant_scoped() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path()).await;
    let router = create_router(state.clone());
    create_and_train(&state, &router).await;

    let (status, body) = call(&router, get_req("/ai/models?page=0&per_page=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pagination"]["total"], 1);

    let foreign = Request::builder()
        .method("GET")
        .uri("/ai/models")
        .header("x-tenant-id", "other")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&router, foreign).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pagination"]["total"], 0);
}

#[tokio::test]
async fn rate_limit_returns_429_with_retry_after() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path()).await;
    let router = create_router(state.clone());
    let model_id = create_and_train(&state, &router).await;

    let input = json!({
        "input": { "age": 30, "income": 55000, "category": "B", "region": "S" }
    });
    for _ in 0..5 {
        let (status, _) = call(
            &router,
            post_json(&format!("/ai/models/{model_id}/predict"), input.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/ai/models/{model_id}/predict"),
            input,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap();
    assert!((1..=60).contains(&retry_after));
}

#[tokio::test]
async fn oversized_predict_payload_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path()).await;
    let router = create_router(state.clone());
    let model_id = create_and_train(&state, &router).await;

    // 201 KiB of padding inside the JSON body.
    let padding = "x".repeat(201 * 1024);
    let (status, _) = call(
        &router,
        post_json(
            &format!("/ai/models/{model_id}/predict"),
            json!({ "input": { "category": padding } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn missing_tenant_header_is_a_bad_request() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path()).await;
    let router = create_router(state);

    let request = Request::builder()
        .method("GET")
        .uri("/ai/models")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let state = test_state(root.path()).await;
    let router = create_router(state);

    let (status, body) = call(
        &router,
        get_req(&format!("/ai/models/{}", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
}
