use axum::{http::StatusCode, response::IntoResponse};

use crate::domain::UnknownTrafficKind;
use crate::errors::RegistrationError;

/// Errors returned by metadata service handlers.
///
/// Bodies are plain text; workers log them verbatim.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => msg,
        };
        (status, format!("{}\n", message)).into_response()
    }
}

impl From<RegistrationError> for ApiError {
    fn from(err: RegistrationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<UnknownTrafficKind> for ApiError {
    fn from(err: UnknownTrafficKind) -> Self {
        ApiError::NotFound(err.to_string())
    }
}
