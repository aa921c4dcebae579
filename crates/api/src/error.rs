//! API error types with HTTP response mapping.

use admission::AdmissionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::ErrorKind;
use inventory::InventoryError;
use issuer::IssuerError;
use saga::SagaError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request from the client.
    BadRequest(String),
    Inventory(InventoryError),
    Saga(SagaError),
    Issuer(IssuerError),
    Admission(AdmissionError),
}

impl ApiError {
    fn classify(&self) -> (ErrorKind, bool) {
        match self {
            ApiError::BadRequest(_) => (ErrorKind::Invariant, false),
            ApiError::Inventory(e) => (e.kind(), e.is_retryable()),
            ApiError::Saga(e) => (e.kind(), e.is_retryable()),
            ApiError::Issuer(e) => (e.kind(), false),
            ApiError::Admission(e) => (e.kind(), false),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Inventory(e) => e.to_string(),
            ApiError::Saga(e) => e.to_string(),
            ApiError::Issuer(e) => e.to_string(),
            ApiError::Admission(e) => e.to_string(),
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        if matches!(self, ApiError::BadRequest(_)) {
            return StatusCode::BAD_REQUEST;
        }
        let (kind, retryable) = self.classify();
        status_for(kind, retryable)
    }
}

/// Maps an error class onto an HTTP status.
pub fn status_for(kind: ErrorKind, retryable: bool) -> StatusCode {
    match kind {
        ErrorKind::Capacity if retryable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Capacity | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Adapter => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::Invariant => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (kind, _) = self.classify();
        let message = self.message();
        metrics::counter!("api_errors_total", "kind" => kind.as_str()).increment(1);
        if kind == ErrorKind::Internal {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message, "kind": kind });
        (status, axum::Json(body)).into_response()
    }
}

impl From<InventoryError> for ApiError {
    fn from(err: InventoryError) -> Self {
        ApiError::Inventory(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<IssuerError> for ApiError {
    fn from(err: IssuerError) -> Self {
        ApiError::Issuer(err)
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        ApiError::Admission(err)
    }
}

/// Failures while wiring external back-ends at startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Counter store connection failed: {0}")]
    CounterStore(#[from] IssuerError),
}
