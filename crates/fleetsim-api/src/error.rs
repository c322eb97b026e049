//! Error types for the control surface.
//!
//! [`ApiError`] unifies all failure modes into a single enum that can be
//! converted into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use fleetsim_core::SimError;

/// Errors that can occur in the control surface.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request body failed validation.
    #[error("invalid request: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// A request parameter could not be used.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// The simulator rejected the operation.
    #[error(transparent)]
    Simulation(#[from] SimError),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Simulation(e) if e.is_config() => StatusCode::BAD_REQUEST,
            Self::Simulation(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_client_errors() {
        let response = ApiError::from(SimError::UnknownEnvironment("stage".to_owned())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError::from(SimError::Connect("refused".to_owned())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
