//! The HTTP boundary end to end, driven through the router without a socket.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use identirust::server::router;
use identirust::Identirust;

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn identify_flow_over_http() {
    let app = router(Arc::new(Identirust::new()));

    let (status, body) = call(
        &app,
        "POST",
        "/identify",
        Some(json!({"email": "lorraine@hillvalley.edu", "phoneNumber": "123456"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["contact"]["primaryContactId"], 1);

    let (status, body) = call(
        &app,
        "POST",
        "/identify",
        Some(json!({"email": "mcfly@hillvalley.edu", "phoneNumber": 123456})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"contact": {
            "primaryContactId": 1,
            "emails": ["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"],
            "phoneNumbers": ["123456"],
            "secondaryContactIds": [2]
        }})
    );

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "contacts": 2}));
}

#[tokio::test]
async fn merge_over_http() {
    let app = router(Arc::new(Identirust::new()));

    call(&app, "POST", "/identify", Some(json!({"email": "george@hillvalley.edu", "phoneNumber": "919191"}))).await;
    call(&app, "POST", "/identify", Some(json!({"email": "biffsucks@hillvalley.edu", "phoneNumber": "717171"}))).await;

    let (status, body) = call(
        &app,
        "POST",
        "/identify",
        Some(json!({"email": "george@hillvalley.edu", "phoneNumber": "717171"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"contact": {
            "primaryContactId": 1,
            "emails": ["george@hillvalley.edu", "biffsucks@hillvalley.edu"],
            "phoneNumbers": ["919191", "717171"],
            "secondaryContactIds": [2]
        }})
    );
}

#[tokio::test]
async fn rejected_requests_use_the_error_envelope() {
    let identirust = Arc::new(Identirust::new());
    let app = router(Arc::clone(&identirust));

    for payload in [
        json!({}),
        json!({"email": null, "phoneNumber": null}),
        json!({"email": "", "phoneNumber": "  "}),
        json!({"email": "doc.brown"}),
        json!({"phoneNumber": "12"}),
        json!({"phoneNumber": [1, 2, 3]}),
    ] {
        let (status, body) = call(&app, "POST", "/identify", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{payload}");
        assert_eq!(body["error"]["code"], "INVALID_INPUT", "{payload}");
        assert!(body["error"]["message"].is_string());
    }
    assert_eq!(identirust.contact_count(), 0);
}
