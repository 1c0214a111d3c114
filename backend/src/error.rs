use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid {field}: {message}")]
    InvalidArgument { field: String, message: String },
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Message(String),
}

impl AppError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidState(_) => "invalid_state",
            AppError::InvalidArgument { .. } => "invalid_argument",
            AppError::Unauthorized => "unauthorized",
            AppError::Db(_) | AppError::Message(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::InvalidArgument { field, message } => json!({
                "error": self.kind(),
                "field": field,
                "message": message,
            }),
            AppError::Db(_) | AppError::Message(_) => {
                tracing::error!(?self);
                json!({ "error": self.kind(), "message": "internal server error" })
            }
            _ => json!({ "error": self.kind(), "message": self.to_string() }),
        };
        if matches!(self, AppError::Unauthorized) {
            return (status, [(header::WWW_AUTHENTICATE, "Bearer")], Json(body)).into_response();
        }
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// True when the database rejected a write because of a unique constraint.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        // 23505 is Postgres `unique_violation`; 2067 and 1555 are SQLite's
        // extended codes for UNIQUE and PRIMARY KEY constraint failures.
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("23505") | Some("2067") | Some("1555")
        ),
        _ => false,
    }
}

/// True when a concurrent transaction won the write.
pub fn is_write_conflict(error: &sqlx::Error) -> bool {
    match error {
        // 40001 and 40P01 are Postgres serialization failure and deadlock. 5 is SQLite
        // BUSY; 261, 517 and 773 are its RECOVERY, SNAPSHOT and TIMEOUT extended codes.
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01") | Some("5") | Some("261") | Some("517") | Some("773")
        ),
        _ => false,
    }
}
