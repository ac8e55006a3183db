use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Signal store timed out after {0}ms")]
    StoreTimeout(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Illegal run transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Run failed: {0}")]
    RunFailed(String),

    #[error("Insufficient training data: {got} rows, need {need}")]
    InsufficientTrainingData { got: usize, need: usize },

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Database(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::StoreTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            AppError::IllegalTransition { .. } => (StatusCode::CONFLICT, self.to_string()),
            AppError::RunFailed(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::InsufficientTrainingData { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
