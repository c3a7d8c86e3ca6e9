//! Request/response envelopes and the stable error taxonomy

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::PROTOCOL_TAG;

/// Caller-chosen correlation id, echoed verbatim in the response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
}

impl RequestId {
    /// Read an id out of a raw JSON value (numbers and strings only)
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self::Number(n.clone())),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// Request sent by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Protocol tag (always [`PROTOCOL_TAG`])
    pub protocol: String,
    /// Correlation id
    pub id: RequestId,
    /// Tool name or reserved method
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Value,
}

impl RequestEnvelope {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            protocol: PROTOCOL_TAG.into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Response sent by the server
///
/// `id` is `None` (serialized as `null`) only when the request id could not
/// be read from the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub protocol: String,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

/// Exactly one of `result` or `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    Result(Value),
    Error(RpcError),
}

impl ResponseEnvelope {
    /// Create a success response
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            protocol: PROTOCOL_TAG.into(),
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    /// Create an error response
    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            protocol: PROTOCOL_TAG.into(),
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Split into the caller-facing result
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(err) => Err(err),
        }
    }
}

/// Stable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed JSON or unreadable frame
    ParseError,
    /// Envelope missing id/method or otherwise not a request
    InvalidRequest,
    /// No tool registered under the method name
    MethodNotFound,
    /// Params violate the tool's input schema
    InvalidParams,
    /// Handler failed unexpectedly
    InternalError,
    /// Bridge or application failure (see `data.reason`)
    ServerError,
}

impl ErrorCode {
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(Self::ParseError),
            -32600 => Some(Self::InvalidRequest),
            -32601 => Some(Self::MethodNotFound),
            -32602 => Some(Self::InvalidParams),
            -32603 => Some(Self::InternalError),
            -32000 => Some(Self::ServerError),
            _ => None,
        }
    }
}

/// Wire error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: Value) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::with_data(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
            json!({ "method": method }),
        )
    }

    /// Schema violations, each `{path, message}`
    pub fn invalid_params(violations: Vec<Value>) -> Self {
        let summary = violations
            .iter()
            .filter_map(|v| v["message"].as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Self::with_data(
            ErrorCode::InvalidParams,
            format!("Invalid params: {}", summary),
            json!({ "violations": violations }),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Bridge failure with a machine-readable reason discriminator
    pub fn server_error(reason: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::with_data(
            ErrorCode::ServerError,
            format!("{}: {}", reason, detail),
            json!({ "reason": reason, "detail": detail }),
        )
    }

    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    /// `data.reason` of a `ServerError`
    pub fn reason(&self) -> Option<&str> {
        self.data.as_ref()?.get("reason")?.as_str()
    }

    /// `data.violations` of an `InvalidParams` error
    pub fn violations(&self) -> &[Value] {
        self.data
            .as_ref()
            .and_then(|d| d.get("violations"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialize() {
        let json = r#"{"protocol":"tether/1","id":7,"method":"get_dom","params":{}}"#;
        let request: RequestEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(request.id, RequestId::from(7));
        assert_eq!(request.method, "get_dom");
    }

    #[test]
    fn test_request_without_params() {
        let json = r#"{"protocol":"tether/1","id":"abc","method":"tools/list"}"#;
        let request: RequestEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(request.id, RequestId::from("abc"));
        assert!(request.params.is_null());
    }

    #[test]
    fn test_success_has_result_only() {
        let response = ResponseEnvelope::success(RequestId::from(1), json!({"ok": true}));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["protocol"], PROTOCOL_TAG);
        assert_eq!(value["id"], 1);
        assert_eq!(value["result"]["ok"], true);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_error_has_error_only_and_null_id() {
        let response = ResponseEnvelope::error(None, RpcError::parse_error("bad json"));
        let value = serde_json::to_value(&response).unwrap();
        assert!(value["id"].is_null());
        assert_eq!(value["error"]["code"], -32700);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_null_result_round_trips_as_result() {
        let response = ResponseEnvelope::success(RequestId::from("x"), Value::Null);
        let text = serde_json::to_string(&response).unwrap();
        let decoded: ResponseEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded.payload, ResponsePayload::Result(Value::Null));
    }

    #[test]
    fn test_id_echoed_verbatim() {
        for raw in [json!(42), json!("req-1"), json!(-3), json!(1.5)] {
            let id = RequestId::from_value(&raw).unwrap();
            let response = ResponseEnvelope::success(id, Value::Null);
            let value = serde_json::to_value(&response).unwrap();
            assert_eq!(value["id"], raw);
        }
    }

    #[test]
    fn test_id_rejects_non_scalar() {
        assert!(RequestId::from_value(&json!(null)).is_none());
        assert!(RequestId::from_value(&json!({"a": 1})).is_none());
        assert!(RequestId::from_value(&json!([1])).is_none());
    }

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::InvalidRequest.code(), -32600);
        assert_eq!(ErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(ErrorCode::InvalidParams.code(), -32602);
        assert_eq!(ErrorCode::InternalError.code(), -32603);
        assert_eq!(ErrorCode::ServerError.code(), -32000);
        assert_eq!(ErrorCode::from_code(-32000), Some(ErrorCode::ServerError));
        assert_eq!(ErrorCode::from_code(1), None);
    }

    #[test]
    fn test_server_error_reason() {
        let err = RpcError::server_error("element_not_found", "selector=#save");
        assert_eq!(err.kind(), Some(ErrorCode::ServerError));
        assert_eq!(err.reason(), Some("element_not_found"));
        assert_eq!(err.message, "element_not_found: selector=#save");
        assert!(err.to_string().contains("element_not_found: selector=#save"));
    }

    #[test]
    fn test_invalid_params_violations() {
        let err = RpcError::invalid_params(vec![
            json!({"path": "", "message": "\"text\" is a required property"}),
        ]);
        assert_eq!(err.kind(), Some(ErrorCode::InvalidParams));
        assert_eq!(err.violations().len(), 1);
        assert!(err.message.contains("required"));
    }
}
