//! API Error Handling
//!
//! Maps service errors onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::service::task_service::TaskError;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    DatabaseError(sqlx::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound(_) => ApiError::NotFound(err.to_string()),
            TaskError::AlreadyExists(_) | TaskError::LeaseLost { .. } => {
                ApiError::Conflict(err.to_string())
            }
            TaskError::ValidationError(msg) => ApiError::BadRequest(msg),
            TaskError::DatabaseError(db) => ApiError::DatabaseError(db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_errors_map_to_status_codes() {
        let cases = [
            (TaskError::NotFound("T1".into()), StatusCode::NOT_FOUND),
            (TaskError::AlreadyExists("T1".into()), StatusCode::CONFLICT),
            (
                TaskError::LeaseLost {
                    task_id: "T1".into(),
                    node_id: "n1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                TaskError::ValidationError("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
