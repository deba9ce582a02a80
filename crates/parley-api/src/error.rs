use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use parley_core::ChatError;
use parley_types::api::ErrorResponse;

/// Error returned by every handler, rendered as `{ "error", "code" }`.
#[derive(Debug)]
pub enum ApiError {
    Chat(ChatError),
    InvalidCredentials,
    Internal(anyhow::Error),
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self::Chat(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Chat(ChatError::Unauthenticated) | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::Chat(ChatError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Chat(ChatError::BadInput(_)) => StatusCode::BAD_REQUEST,
            Self::Chat(ChatError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Chat(ChatError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, code) = match &self {
            Self::Chat(ChatError::Unavailable(e)) => {
                error!("Store unavailable: {:#}", e);
                ("Service temporarily unavailable".to_string(), "UNAVAILABLE")
            }
            Self::Chat(e) => (e.to_string(), e.code()),
            Self::InvalidCredentials => ("Invalid username or password".to_string(), "UNAUTHENTICATED"),
            Self::Internal(e) => {
                error!("Internal error: {:#}", e);
                ("Internal server error".to_string(), "INTERNAL_SERVER_ERROR")
            }
        };

        (
            status,
            Json(ErrorResponse {
                error,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}
