//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use expose_control::AllowListError;
use thiserror::Error;

use crate::models::ErrorResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.to_string(),
            code: Some(self.code().to_string()),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AllowListError> for ApiError {
    fn from(err: AllowListError) -> Self {
        match err {
            AllowListError::InvalidToken(_) => ApiError::BadRequest("Invalid token".to_string()),
            AllowListError::MissingPort => ApiError::BadRequest("Port is required".to_string()),
            AllowListError::PortNotFound(_) => {
                ApiError::BadRequest("Port no longer exists".to_string())
            }
            AllowListError::Forbidden => ApiError::Forbidden("Forbidden".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list_error_mapping() {
        let cases = [
            (
                AllowListError::InvalidToken("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (AllowListError::MissingPort, StatusCode::BAD_REQUEST),
            (AllowListError::PortNotFound(4456), StatusCode::BAD_REQUEST),
            (AllowListError::Forbidden, StatusCode::FORBIDDEN),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_port_not_found_message() {
        let err = ApiError::from(AllowListError::PortNotFound(4456));
        assert_eq!(err.to_string(), "Port no longer exists");
    }
}
