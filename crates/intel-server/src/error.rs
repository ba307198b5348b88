use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use intel_core::error::IntelError;

/// Carries an explicit 400 for request validation that has no `IntelError`
/// counterpart.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<BadRequestError>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        match self.0.downcast_ref::<IntelError>() {
            Some(IntelError::UnknownModule(_)) => StatusCode::BAD_REQUEST,
            Some(IntelError::EntityNotFound(_)) => StatusCode::NOT_FOUND,
            Some(IntelError::RunConflict(_)) => StatusCode::CONFLICT,
            Some(
                IntelError::ModuleTimeout { .. }
                | IntelError::ModuleExecution { .. }
                | IntelError::Store(_)
                | IntelError::MissingExecutor(_)
                | IntelError::Config(_)
                | IntelError::Io(_)
                | IntelError::Yaml(_)
                | IntelError::Json(_),
            )
            | None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
