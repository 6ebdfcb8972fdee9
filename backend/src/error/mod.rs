use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{message}")]
    RateLimited {
        message: String,
        reset_at: DateTime<Utc>,
    },
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Expired(String),
    #[error("internal error: {0}")]
    InternalServerError(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(vec![message.into()])
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Expired(_) => "EXPIRED",
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Builds the transport-neutral body a controller can serialize.
    pub fn to_response(&self) -> ErrorResponse {
        let (error, details) = match self {
            AppError::Validation(errors) => (
                "Validation failed".to_string(),
                Some(serde_json::json!({ "errors": errors })),
            ),
            AppError::RateLimited { message, reset_at } => (
                message.clone(),
                Some(serde_json::json!({ "reset_at": reset_at })),
            ),
            AppError::InternalServerError(err) => {
                tracing::error!("Internal server error: {:?}", err);
                ("Internal server error".to_string(), None)
            }
            AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::Unauthorized(msg)
            | AppError::Expired(msg) => (msg.clone(), None),
        };

        ErrorResponse {
            error,
            code: self.code().to_string(),
            details,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("Resource not found".to_string()),
            _ => AppError::InternalServerError(err.into()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let code = e.code.as_ref();
                    format!("{}: {}", field, code)
                })
            })
            .collect();
        messages.sort();
        AppError::Validation(messages)
    }
}

impl From<bb8::RunError<bb8_redis::redis::RedisError>> for AppError {
    fn from(err: bb8::RunError<bb8_redis::redis::RedisError>) -> Self {
        AppError::InternalServerError(anyhow::anyhow!("redis pool error: {}", err))
    }
}

impl From<bb8_redis::redis::RedisError> for AppError {
    fn from(err: bb8_redis::redis::RedisError) -> Self {
        AppError::InternalServerError(err.into())
    }
}
