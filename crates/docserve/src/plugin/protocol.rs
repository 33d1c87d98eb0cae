//! Message vocabulary exchanged between the supervisor and the plugin worker.
//!
//! Every message is one JSON object per line carrying a `t` tag and a
//! caller-generated `id` that the responder echoes verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tools::ToolError;

/// Id used when a failing request carried no readable id.
pub const SENTINEL_ID: &str = "unknown";

/// Fresh correlation id for an outgoing request.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Request sent from the supervisor to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum WorkerRequest {
    #[serde(rename = "hello")]
    Hello { id: String },
    #[serde(rename = "load")]
    Load {
        id: String,
        specs: Vec<String>,
        /// Per-invocation handler timeout enforced by the worker.
        #[serde(
            rename = "invokeTimeoutMs",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        invoke_timeout_ms: Option<u64>,
        /// Opaque value handed to module factories.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
    #[serde(rename = "manifest:get")]
    ManifestGet { id: String },
    #[serde(rename = "invoke")]
    Invoke {
        id: String,
        #[serde(rename = "toolId")]
        tool_id: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(rename = "shutdown")]
    Shutdown { id: String },
}

/// Serializable projection of a tool realized inside the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Worker-local handle; unique even when names collide.
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// Module specifier that produced the tool.
    pub source: String,
}

/// Error as it crosses the channel. Only `message` is guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl SerializedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            code: None,
        }
    }
}

impl From<ToolError> for SerializedError {
    fn from(error: ToolError) -> Self {
        Self {
            message: error.message,
            stack: error.stack,
            code: error.code,
        }
    }
}

impl From<SerializedError> for ToolError {
    fn from(error: SerializedError) -> Self {
        Self {
            message: error.message,
            stack: error.stack,
            code: error.code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAck {
    pub id: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestResult {
    pub id: String,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResult {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl InvokeResult {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: SerializedError) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    /// Unwraps into the handler outcome as seen by a local caller.
    pub fn into_outcome(self) -> Result<Value, ToolError> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .map(ToolError::from)
                .unwrap_or_else(|| ToolError::new("remote tool failed without an error")))
        }
    }
}

/// Response sent from the worker to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum WorkerResponse {
    #[serde(rename = "hello:ack")]
    HelloAck { id: String },
    #[serde(rename = "load:ack")]
    LoadAck(LoadAck),
    #[serde(rename = "manifest:result")]
    ManifestResult(ManifestResult),
    #[serde(rename = "invoke:result")]
    InvokeResult(InvokeResult),
    #[serde(rename = "shutdown:ack")]
    ShutdownAck { id: String },
}

/// Response matchers used with [`MessageChannel::await_response`].
///
/// Each matcher validates the full shape of a candidate message and returns
/// the typed response only when tag, id and required fields all check out.
/// Look-alikes with missing or mistyped fields are skipped.
///
/// [`MessageChannel::await_response`]: super::channel::MessageChannel::await_response
pub mod matchers {
    use serde::de::DeserializeOwned;
    use serde_json::Value;

    use super::{InvokeResult, LoadAck, ManifestResult};

    fn has_tag(message: &Value, tag: &str) -> bool {
        message.get("t").and_then(Value::as_str) == Some(tag)
    }

    fn has_id(message: &Value, id: &str) -> bool {
        message.get("id").and_then(Value::as_str) == Some(id)
    }

    fn parse<T: DeserializeOwned>(message: &Value) -> Option<T> {
        serde_json::from_value(message.clone()).ok()
    }

    /// Any `hello:ack` with a string id. Yields the echoed id.
    pub fn hello_ack() -> impl Fn(&Value) -> Option<String> + Send + 'static {
        |message| {
            if !has_tag(message, "hello:ack") {
                return None;
            }
            message.get("id").and_then(Value::as_str).map(str::to_string)
        }
    }

    pub fn load_ack(id: &str) -> impl Fn(&Value) -> Option<LoadAck> + Send + 'static {
        let id = id.to_string();
        move |message| {
            if !has_tag(message, "load:ack") || !has_id(message, &id) {
                return None;
            }
            parse(message)
        }
    }

    pub fn manifest_result(id: &str) -> impl Fn(&Value) -> Option<ManifestResult> + Send + 'static {
        let id = id.to_string();
        move |message| {
            if !has_tag(message, "manifest:result") || !has_id(message, &id) {
                return None;
            }
            parse(message)
        }
    }

    pub fn invoke_result(id: &str) -> impl Fn(&Value) -> Option<InvokeResult> + Send + 'static {
        let id = id.to_string();
        move |message| {
            if !has_tag(message, "invoke:result") || !has_id(message, &id) {
                return None;
            }
            let result: InvokeResult = parse(message)?;
            if !result.ok && result.error.is_none() {
                return None;
            }
            Some(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_wire_tags_and_field_names() {
        let request = WorkerRequest::Invoke {
            id: "7".to_string(),
            tool_id: "tool-1".to_string(),
            args: json!({"q": "button"}),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"t": "invoke", "id": "7", "toolId": "tool-1", "args": {"q": "button"}})
        );

        let request = WorkerRequest::Load {
            id: "2".to_string(),
            specs: vec!["./plugin".to_string()],
            invoke_timeout_ms: Some(500),
            options: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"t": "load", "id": "2", "specs": ["./plugin"], "invokeTimeoutMs": 500})
        );

        let parsed: WorkerRequest = serde_json::from_value(json!({"t": "manifest:get", "id": "3"})).unwrap();
        assert_eq!(parsed, WorkerRequest::ManifestGet { id: "3".to_string() });
    }

    #[test]
    fn responses_use_wire_tags() {
        let response = WorkerResponse::LoadAck(LoadAck {
            id: "9".to_string(),
            warnings: vec![],
            errors: vec!["missing".to_string()],
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({"t": "load:ack", "id": "9", "warnings": [], "errors": ["missing"]})
        );

        let descriptor = ToolDescriptor {
            id: "tool-1".to_string(),
            name: "echo".to_string(),
            description: "Echo".to_string(),
            input_schema: json!({"type": "object"}),
            source: "./echo".to_string(),
        };
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["inputSchema"], json!({"type": "object"}));
    }

    #[test]
    fn hello_matcher_requires_tag_and_string_id() {
        let matcher = matchers::hello_ack();
        assert_eq!(matcher(&json!({"t": "hello:ack", "id": "a"})), Some("a".to_string()));
        assert_eq!(matcher(&json!({"t": "hello:ack", "id": 1})), None);
        assert_eq!(matcher(&json!({"t": "load:ack", "id": "a"})), None);
    }

    #[test]
    fn load_matcher_ignores_malformed_look_alikes() {
        let matcher = matchers::load_ack("x");
        assert!(matcher(&json!({"t": "load:ack", "id": "x", "warnings": []})).is_none());
        assert!(matcher(&json!({"t": "load:ack", "id": "x", "warnings": "no", "errors": []})).is_none());
        assert!(matcher(&json!({"t": "load:ack", "id": "y", "warnings": [], "errors": []})).is_none());
        let ack = matcher(&json!({"t": "load:ack", "id": "x", "warnings": ["w"], "errors": []})).unwrap();
        assert_eq!(ack.warnings, vec!["w".to_string()]);
    }

    #[test]
    fn manifest_matcher_validates_descriptors() {
        let matcher = matchers::manifest_result("m");
        assert!(matcher(&json!({"t": "manifest:result", "id": "m", "tools": [{"id": "t"}]})).is_none());
        let result = matcher(&json!({
            "t": "manifest:result",
            "id": "m",
            "tools": [{"id": "t1", "name": "n", "description": "d", "inputSchema": {}, "source": "s"}]
        }))
        .unwrap();
        assert_eq!(result.tools.len(), 1);
    }

    #[test]
    fn invoke_matcher_requires_error_on_failure() {
        let matcher = matchers::invoke_result("i");
        assert!(matcher(&json!({"t": "invoke:result", "id": "i", "ok": false})).is_none());
        assert!(matcher(&json!({"t": "invoke:result", "id": "i", "ok": "yes"})).is_none());
        let result = matcher(&json!({"t": "invoke:result", "id": "i", "ok": true, "result": 3})).unwrap();
        assert_eq!(result.into_outcome().unwrap(), json!(3));
    }

    #[test]
    fn failure_outcome_preserves_remote_error_fields() {
        let result = InvokeResult::failure(
            "i",
            SerializedError {
                message: "boom".to_string(),
                stack: Some("at handler".to_string()),
                code: Some("E_BOOM".to_string()),
            },
        );
        let error = result.into_outcome().unwrap_err();
        assert_eq!(error.to_string(), "boom");
        assert_eq!(error.stack.as_deref(), Some("at handler"));
        assert_eq!(error.code.as_deref(), Some("E_BOOM"));
    }
}
