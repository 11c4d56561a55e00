use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use tollgate_core::{AuthError, RouteError};
use tollgate_protocol::openai::ErrorResponse;

/// Caller-visible failure in the OpenAI error envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse::new(code, kind, message),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "invalid_request_error",
            message,
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        &self.body.error.code
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        let status = match &err {
            RouteError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RouteError::NotFound(_) => StatusCode::NOT_FOUND,
            RouteError::AllProvidersExhausted { .. } if err.is_deadline() => {
                StatusCode::GATEWAY_TIMEOUT
            }
            RouteError::AllProvidersExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RouteError::Internal(detail) => {
                error!(error = %detail, "request failed internally");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.code(), err.kind(), err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "authentication_error",
            err.to_string(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_maps_to_503_or_504() {
        let err = ApiError::from(RouteError::AllProvidersExhausted {
            summary: "p1 (upstream_unavailable)".to_string(),
            deadline_exceeded: false,
        });
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "all_providers_exhausted");

        let err = ApiError::from(RouteError::AllProvidersExhausted {
            summary: "p1 (deadline_exceeded)".to_string(),
            deadline_exceeded: true,
        });
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn internal_detail_is_not_exposed() {
        let err = ApiError::from(RouteError::Internal("db error: disk full".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body.error.message, "internal error");
    }
}
