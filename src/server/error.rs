//! Error types for the REST API server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::ReplayError;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Symbol not known to the catalog
    SymbolNotFound(String),
    /// Invalid parameter in request
    InvalidParameter(String),
    /// Backing store for a symbol could not be opened
    StoreUnavailable(String),
    /// Internal server error
    InternalError(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::SymbolNotFound(symbol) => write!(f, "Symbol not found: {}", symbol),
            ApiError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            ApiError::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            ApiError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            ApiError::SymbolNotFound(symbol) => (
                StatusCode::NOT_FOUND,
                "SymbolNotFound",
                format!("Symbol '{}' is not in the catalog", symbol),
            ),
            ApiError::InvalidParameter(msg) => (
                StatusCode::BAD_REQUEST,
                "InvalidParameter",
                msg.clone(),
            ),
            ApiError::StoreUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "StoreUnavailable",
                msg.clone(),
            ),
            ApiError::InternalError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalError",
                msg.clone(),
            ),
        };

        let body = Json(json!({
            "error": error_type,
            "message": message,
        }));

        (status, body).into_response()
    }
}

impl From<ReplayError> for ApiError {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::SymbolNotFound(symbol) => ApiError::SymbolNotFound(symbol),
            ReplayError::StoreUnavailable { .. } => ApiError::StoreUnavailable(err.to_string()),
            ReplayError::InvalidConfig(msg) => ApiError::InvalidParameter(msg),
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::InternalError(format!("Replay task failed: {}", err))
    }
}
