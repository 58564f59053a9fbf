//! # HTTP Boundary
//!
//! `POST /identify` and `GET /health` over axum. Reconciliation takes blocking
//! locks and does synchronous storage I/O, so each call runs on tokio's
//! blocking pool.

use crate::error::ReconcileError;
use crate::model::{IdentifyResponse, Observation};
use crate::validation::validate_observation;
use crate::Identirust;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Body of `POST /identify`. `phoneNumber` may arrive as a string or a number.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<PhoneValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PhoneValue {
    Text(String),
    Number(u64),
}

impl From<PhoneValue> for String {
    fn from(value: PhoneValue) -> Self {
        match value {
            PhoneValue::Text(text) => text,
            PhoneValue::Number(number) => number.to_string(),
        }
    }
}

impl From<IdentifyRequest> for Observation {
    fn from(request: IdentifyRequest) -> Self {
        Observation::new(request.email, request.phone_number.map(String::from))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub contacts: usize,
}

/// Error codes carried in the JSON error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    StorageFailure,
    InvariantViolation,
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::StorageFailure
            | ErrorCode::InvariantViolation
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a ApiError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ErrorBody { error: &self })).into_response()
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::InvalidInput(message) => {
                ApiError::new(ErrorCode::InvalidInput, message)
            }
            ReconcileError::StorageFailure(source) => {
                let detail = format!("{source:#}");
                error!(error = %detail, "identify failed in storage");
                ApiError::new(ErrorCode::StorageFailure, "storage operation failed")
            }
            ReconcileError::InvariantViolation(message) => {
                ApiError::new(ErrorCode::InvariantViolation, message)
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(ErrorCode::InvalidInput, rejection.body_text())
    }
}

/// Build the router over a shared reconciler.
pub fn router(identirust: Arc<Identirust>) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/health", get(health))
        .with_state(identirust)
}

async fn identify(
    State(identirust): State<Arc<Identirust>>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ApiError> {
    let Json(request) = payload?;
    let observation = Observation::from(request);
    if let Err(err) = validate_observation(&observation) {
        debug!(%observation, error = %err, "rejected identify request");
        return Err(err.into());
    }

    let response = tokio::task::spawn_blocking(move || identirust.identify(&observation))
        .await
        .map_err(|err| {
            error!(error = %err, "identify task failed");
            ApiError::new(ErrorCode::InternalError, "identify task failed")
        })??;
    Ok(Json(response))
}

async fn health(State(identirust): State<Arc<Identirust>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        contacts: identirust.contact_count(),
    })
}

/// Serve until ctrl-c.
pub async fn serve(identirust: Arc<Identirust>, listen: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "identirust listening");
    axum::serve(listener, router(identirust))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("identirust stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn post_identify(app: Router, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/identify")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn phone_accepts_string_or_number() {
        let request: IdentifyRequest =
            serde_json::from_value(json!({"email": null, "phoneNumber": 123456})).unwrap();
        assert_eq!(Observation::from(request), Observation::phone("123456"));

        let request: IdentifyRequest =
            serde_json::from_value(json!({"phoneNumber": "123456"})).unwrap();
        assert_eq!(Observation::from(request), Observation::phone("123456"));
    }

    #[test]
    fn error_codes_map_to_status() {
        assert_eq!(ErrorCode::InvalidInput.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::StorageFailure.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let err = ApiError::from(ReconcileError::invariant("two primaries"));
        assert_eq!(err.code, ErrorCode::InvariantViolation);
    }

    #[tokio::test]
    async fn identify_returns_consolidated_contact() {
        let app = router(Arc::new(Identirust::new()));
        let (status, body) = post_identify(
            app,
            json!({"email": "lorraine@hillvalley.edu", "phoneNumber": "123456"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"contact": {
                "primaryContactId": 1,
                "emails": ["lorraine@hillvalley.edu"],
                "phoneNumbers": ["123456"],
                "secondaryContactIds": []
            }})
        );
    }

    #[tokio::test]
    async fn empty_body_is_bad_request() {
        let app = router(Arc::new(Identirust::new()));
        let (status, body) = post_identify(app, json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn malformed_values_are_bad_request() {
        let identirust = Arc::new(Identirust::new());
        let (status, _) = post_identify(
            router(Arc::clone(&identirust)),
            json!({"email": "not-an-email"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) =
            post_identify(router(Arc::clone(&identirust)), json!({"phoneNumber": true})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(identirust.contact_count(), 0);
    }

    #[tokio::test]
    async fn health_reports_contact_count() {
        let identirust = Arc::new(Identirust::new());
        identirust
            .identify(&Observation::email("doc@hillvalley.edu"))
            .unwrap();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = router(identirust).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health.contacts, 1);
        assert_eq!(health.status, "ok");
    }
}
