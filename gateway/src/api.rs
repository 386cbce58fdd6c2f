use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use copilot_core::{ActionError, ErrorKind, RunError};
use serde::Serialize;
use tracing::error;

/// Errors the chat endpoint reports to its caller.
#[derive(Debug)]
pub enum ApiError {
    /// The body was not a chat request.
    Rejected { status: StatusCode, message: String },
    /// The run failed after it started.
    Run(RunError),
    /// The per-request action registry could not be built.
    Registry(ActionError),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'static str,
    message: &'a str,
}

impl ApiError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "BAD_REQUEST",
            Self::Run(e) => match e.kind {
                ErrorKind::Validation => "INVALID_ACTION_CALL",
                ErrorKind::Upstream => "UPSTREAM_FAILURE",
                ErrorKind::Internal => "INTERNAL_SERVER_ERROR",
            },
            Self::Registry(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Rejected { status, .. } => *status,
            Self::Run(e) => match e.kind {
                ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { message, .. } => write!(f, "{}", message),
            Self::Run(e) => write!(f, "{}", e.message),
            Self::Registry(e) => write!(f, "Failed to build action registry: {}", e),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        Self::Run(e)
    }
}

impl From<ActionError> for ApiError {
    fn from(e: ActionError) -> Self {
        Self::Registry(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Registry(e) = &self {
            error!("Registry construction failed: {}", e);
        }
        let message = self.to_string();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.error_code(),
                message: &message,
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_errors_map_to_statuses() {
        let cases = [
            (ErrorKind::Validation, StatusCode::UNPROCESSABLE_ENTITY),
            (ErrorKind::Upstream, StatusCode::BAD_GATEWAY),
            (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (kind, status) in cases {
            let err = ApiError::from(RunError {
                kind,
                message: "nope".to_string(),
            });
            assert_eq!(err.status_code(), status);
            assert_eq!(err.to_string(), "nope");
        }
    }

    #[test]
    fn registry_errors_are_internal() {
        let err = ApiError::from(ActionError::Duplicate("sayHello".to_string()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_code(), "INTERNAL_SERVER_ERROR");
    }
}
