//! Uniform JSON error bodies.
//!
//! Clients only ever see `{"error": "<short message>"}`; correlating detail
//! stays in the structured logs keyed by request ID.

use crate::error::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

/// Map an engine error onto the client-facing status and message.
pub fn engine_error_response(err: &Error) -> Response {
    match err {
        Error::Validation(message) => error_response(StatusCode::BAD_REQUEST, message),
        Error::RateLimit => {
            error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded")
        }
        _ => error_response(StatusCode::BAD_GATEWAY, "Failed to proxy request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_400_with_their_message() {
        let err = Error::validation("request URI must not contain a scheme");
        let response = engine_error_response(&err);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn other_engine_errors_map_to_502() {
        let err = Error::internal("wiring");
        let response = engine_error_response(&err);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_body_serializes_to_single_field() {
        let body = serde_json::to_string(&ErrorBody::new("nope")).unwrap();
        assert_eq!(body, r#"{"error":"nope"}"#);
    }
}
