use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::integration::common::{TEST_API_KEY, setup_test_app};

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_API_KEY}"));
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn listing_schema(schema_id: &str) -> Value {
    json!({
        "schema_id": schema_id,
        "source_id": "shop",
        "definition": {
            "container_selector": "div.item",
            "fields": [
                { "name": "title", "selector": "h2" },
                { "name": "price", "selector": ".price", "type": "float", "required": false }
            ]
        }
    })
}

#[tokio::test]
#[ignore = "requires docker"]
async fn health_reports_database() {
    let (app, _container) = setup_test_app().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["database"], "ok");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn publishing_switches_the_active_schema() {
    let (app, _container) = setup_test_app().await;

    let (status, _) = send(&app, "POST", "/v1/schemas", Some(listing_schema("listing"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, "POST", "/v1/schemas", Some(listing_schema("listing_v2"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, active) = send(&app, "GET", "/v1/schemas?source_id=shop&active_only=true", None).await;
    assert_eq!(active["total"], 1);
    assert_eq!(active["schemas"][0]["schema_id"], "listing_v2");

    let (status, published) = send(
        &app,
        "PUT",
        "/v1/schemas/listing",
        Some(json!({ "definition": listing_schema("listing")["definition"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(published["version"], 2);
    assert_eq!(published["is_active"], true);

    let (_, old) = send(&app, "GET", "/v1/schemas/listing_v2", None).await;
    assert_eq!(old["is_active"], false);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn task_is_queued_listed_and_cancelled() {
    let (app, _container) = setup_test_app().await;
    send(&app, "POST", "/v1/schemas", Some(listing_schema("listing"))).await;

    let (status, created) = send(
        &app,
        "POST",
        "/v1/tasks",
        Some(json!({
            "source_id": "shop",
            "schema_id": "listing",
            "target_url": "https://shop.test/list",
            "mode": "browser",
            "priority": 1,
            "callback_url": "https://hooks.test/done"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(created["schema_version"], 1);
    assert_eq!(created["mode"], "browser");
    let id = created["task_id"].as_str().unwrap().to_string();

    let (_, listed) = send(&app, "GET", "/v1/tasks?mode=browser&status=queued", None).await;
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["tasks"][0]["id"], id.as_str());

    let (_, stats) = send(&app, "GET", "/v1/stats", None).await;
    let browser = stats["queues"]
        .as_array()
        .unwrap()
        .iter()
        .find(|q| q["mode"] == "browser")
        .unwrap()
        .clone();
    assert_eq!(browser["ready"], 1);

    let (status, cancelled) = send(&app, "POST", &format!("/v1/tasks/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["history"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, "POST", &format!("/v1/tasks/{id}/retry"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn pinned_schema_version_must_exist() {
    let (app, _container) = setup_test_app().await;
    send(&app, "POST", "/v1/schemas", Some(listing_schema("listing"))).await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/tasks",
        Some(json!({
            "source_id": "shop",
            "schema_id": "listing",
            "schema_version": 9,
            "target_url": "https://shop.test/list"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}
