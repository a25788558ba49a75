//! Unified server error type with the OpenAI wire shape.
//!
//! Every handler returns `Result<T, ServerError>`; the [`IntoResponse`]
//! impl renders `{"error":{"message","type","code","param"}}` with the
//! right status. Internal errors are logged with full detail but clients
//! only see the message the handler chose to expose.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The caller sent an invalid or malformed request.
    #[error("bad request: {message}")]
    BadRequest {
        message: String,
        code: &'static str,
        param: Option<String>,
    },

    /// A bounded queue refused the request.
    #[error("overloaded: {message}")]
    Overloaded { message: String },

    /// The endpoint exists but is not served.
    #[error("not implemented: {message}")]
    NotImplemented { message: String },

    /// An unclassified internal failure (engine error, lost session).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ServerError {
    pub fn bad_request(message: impl Into<String>, code: &'static str) -> Self {
        Self::BadRequest {
            message: message.into(),
            code,
            param: None,
        }
    }

    pub fn bad_param(
        message: impl Into<String>,
        code: &'static str,
        param: impl Into<String>,
    ) -> Self {
        Self::BadRequest {
            message: message.into(),
            code,
            param: Some(param.into()),
        }
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::Overloaded {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ServerError::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServerError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            ServerError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ServerError::BadRequest { .. } => "invalid_request_error",
            ServerError::Overloaded { .. } => "rate_limit_error",
            ServerError::NotImplemented { .. } => "not_implemented",
            ServerError::Internal { .. } => "internal_error",
        }
    }

    /// The OpenAI-style error body, shared with the pre-stream rejection
    /// path.
    pub fn body(&self) -> serde_json::Value {
        let (message, code, param) = match self {
            ServerError::BadRequest {
                message,
                code,
                param,
            } => (message.clone(), Some(*code), param.clone()),
            ServerError::Overloaded { message } => (message.clone(), Some("queue_full"), None),
            ServerError::NotImplemented { message } => (message.clone(), None, None),
            ServerError::Internal { message } => {
                error!(message = %message, "internal server error");
                (message.clone(), None, None)
            }
        };
        json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "code": code,
                "param": param,
            }
        })
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::internal(e.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overload_maps_to_rate_limit_shape() {
        let err = ServerError::overloaded("model queue full: m (capacity 2)");
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = err.body();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["code"], "queue_full");
    }

    #[test]
    fn bad_request_carries_code_and_param() {
        let err = ServerError::bad_param("max_tokens must be positive", "invalid_max_tokens", "max_tokens");
        let body = err.body();
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], "invalid_max_tokens");
        assert_eq!(body["error"]["param"], "max_tokens");
    }
}
