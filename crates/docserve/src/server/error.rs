//! Error responses of the HTTP layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::tools::ToolError;

/// A failed request. Rendered as
/// `{ "ok": false, "error": { "code": "<code>", "message": "<message>" } }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

#[derive(Serialize)]
struct Envelope<'a> {
    ok: bool,
    error: Detail<'a>,
}

#[derive(Serialize)]
struct Detail<'a> {
    code: &'a str,
    message: &'a str,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("unknown tool: {name}"))
    }

    pub fn invalid_arguments(error: serde_json::Error) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            format!("invalid JSON arguments: {error}"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = Envelope {
            ok: false,
            error: Detail {
                code: &self.code,
                message: &self.message,
            },
        };
        (self.status, Json(envelope)).into_response()
    }
}

/// Tool failures keep the tool's own code, or fall back to `tool_error`.
impl From<ToolError> for ApiError {
    fn from(error: ToolError) -> Self {
        let code = error.code.unwrap_or_else(|| "tool_error".to_string());
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, code, error.message)
    }
}
