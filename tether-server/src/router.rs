//! Protocol router: frame -> envelope -> tool -> response
//!
//! Every failure path ends in a [`ResponseEnvelope`]; nothing raised here
//! crosses the connection boundary. Routing is split in two so the
//! connection can take its serialization permit in dispatch order:
//! [`Router::prepare`] does all synchronous checks, [`Router::execute`] runs
//! the handler while the caller holds the permit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use tether_protocol::{
    methods, Frame, FrameError, RequestId, ResponseEnvelope, RpcError, PROTOCOL_TAG,
};

use crate::bridge::{Access, CallPermit, CommandBridge};
use crate::registry::{RegisteredTool, ToolRegistry};

/// A well-formed request envelope
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

/// A validated tool call waiting for its permit
pub struct PreparedCall {
    id: RequestId,
    tool: Arc<RegisteredTool>,
    params: Value,
}

impl PreparedCall {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn access(&self) -> Access {
        self.tool.access()
    }

    pub fn tool_name(&self) -> &str {
        self.tool.name()
    }
}

/// Outcome of routing one request
pub enum Dispatch {
    /// Answered without touching the application
    Respond(ResponseEnvelope),
    /// Needs a permit, then [`Router::execute`]
    Call(PreparedCall),
}

pub struct Router {
    registry: Arc<ToolRegistry>,
    bridge: Arc<CommandBridge>,
}

impl Router {
    pub fn new(registry: Arc<ToolRegistry>, bridge: Arc<CommandBridge>) -> Self {
        Self { registry, bridge }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<CommandBridge> {
        &self.bridge
    }

    /// Parse a frame into a request envelope
    ///
    /// On failure the error response carries the request id when it could be
    /// read, `null` otherwise.
    pub fn parse(&self, frame: Frame) -> Result<Request, ResponseEnvelope> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Invalid(err) => {
                let message = match err {
                    FrameError::TooLarge { size, max } => {
                        format!("frame of {} bytes exceeds limit of {} bytes", size, max)
                    }
                    FrameError::InvalidUtf8 => err.to_string(),
                };
                return Err(ResponseEnvelope::error(None, RpcError::parse_error(message)));
            }
        };

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ResponseEnvelope::error(None, RpcError::parse_error(e.to_string()))
        })?;

        let Value::Object(mut envelope) = value else {
            return Err(ResponseEnvelope::error(
                None,
                RpcError::invalid_request("request must be a JSON object"),
            ));
        };

        let id = envelope
            .get("id")
            .and_then(RequestId::from_value)
            .ok_or_else(|| {
                ResponseEnvelope::error(
                    None,
                    RpcError::invalid_request("id must be a string or a number"),
                )
            })?;

        let reject = |message: String| {
            ResponseEnvelope::error(Some(id.clone()), RpcError::invalid_request(message))
        };

        match envelope.get("protocol").and_then(Value::as_str) {
            Some(PROTOCOL_TAG) => {}
            Some(other) => {
                return Err(reject(format!(
                    "unsupported protocol {:?}, expected {:?}",
                    other, PROTOCOL_TAG
                )))
            }
            None => return Err(reject(format!("protocol must be {:?}", PROTOCOL_TAG))),
        }

        let method = match envelope.get("method").and_then(Value::as_str) {
            Some(method) if !method.is_empty() => method.to_string(),
            _ => return Err(reject("method must be a non-empty string".into())),
        };

        let params = match envelope.remove("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(params @ Value::Object(_)) => params,
            Some(_) => {
                return Err(ResponseEnvelope::error(
                    Some(id),
                    RpcError::invalid_params(vec![json!({
                        "path": "",
                        "message": "params must be an object",
                    })]),
                ))
            }
        };

        Ok(Request { id, method, params })
    }

    /// Resolve a request against the reserved methods and the registry
    pub fn route(&self, request: Request) -> Dispatch {
        let Request { id, method, params } = request;
        debug!(id = %id, method = %method, "Routing request");

        match method.as_str() {
            methods::PING => Dispatch::Respond(ResponseEnvelope::success(id, json!("pong"))),
            methods::TOOLS_LIST => match serde_json::to_value(self.registry.list()) {
                Ok(tools) => Dispatch::Respond(ResponseEnvelope::success(id, tools)),
                Err(e) => Dispatch::Respond(ResponseEnvelope::error(
                    Some(id),
                    RpcError::internal(e.to_string()),
                )),
            },
            methods::TOOLS_CALL => {
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return invalid(id, "/name", "name must be a string");
                };
                let name = name.to_string();
                let arguments = match params.get("arguments") {
                    None | Some(Value::Null) => Value::Object(Map::new()),
                    Some(args @ Value::Object(_)) => args.clone(),
                    Some(_) => return invalid(id, "/arguments", "arguments must be an object"),
                };
                self.tool_call(id, &name, arguments)
            }
            _ => self.tool_call(id, &method, params),
        }
    }

    fn tool_call(&self, id: RequestId, name: &str, params: Value) -> Dispatch {
        let Some(tool) = self.registry.get(name) else {
            return Dispatch::Respond(ResponseEnvelope::error(
                Some(id),
                RpcError::method_not_found(name),
            ));
        };

        if let Err(violations) = tool.validate(&params) {
            debug!(id = %id, tool = name, count = violations.len(), "Params rejected");
            return Dispatch::Respond(ResponseEnvelope::error(
                Some(id),
                RpcError::invalid_params(violations),
            ));
        }

        Dispatch::Call(PreparedCall { id, tool, params })
    }

    /// Parse and route in one step
    pub fn prepare(&self, frame: Frame) -> Dispatch {
        match self.parse(frame) {
            Ok(request) => self.route(request),
            Err(response) => Dispatch::Respond(response),
        }
    }

    /// Run a prepared call under a permit the caller keeps
    ///
    /// The caller releases the permit once the response is queued, so
    /// answers leave in the order the permits were granted. A panicking
    /// handler is answered with `InternalError`.
    pub async fn execute(&self, call: PreparedCall, _permit: &CallPermit) -> ResponseEnvelope {
        let PreparedCall { id, tool, params } = call;
        let handler = tool.handler();
        let bridge = Arc::clone(&self.bridge);
        let started = Instant::now();

        let outcome = AssertUnwindSafe(async move { handler(bridge, params).await })
            .catch_unwind()
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(result)) => {
                debug!(id = %id, tool = tool.name(), elapsed_ms, "Tool call succeeded");
                ResponseEnvelope::success(id, result)
            }
            Ok(Err(err)) => {
                let err: RpcError = err.into();
                debug!(id = %id, tool = tool.name(), elapsed_ms, error = %err, "Tool call failed");
                ResponseEnvelope::error(Some(id), err)
            }
            Err(_) => {
                error!(id = %id, tool = tool.name(), "Tool handler panicked");
                ResponseEnvelope::error(
                    Some(id),
                    RpcError::internal(format!("tool handler {} panicked", tool.name())),
                )
            }
        }
    }

    /// Route a frame and, if needed, run it to completion
    pub async fn handle(&self, frame: Frame) -> ResponseEnvelope {
        match self.prepare(frame) {
            Dispatch::Respond(response) => response,
            Dispatch::Call(call) => {
                let permit = self.bridge.admit(call.access()).await;
                self.execute(call, &permit).await
            }
        }
    }
}

fn invalid(id: RequestId, path: &str, message: &str) -> Dispatch {
    Dispatch::Respond(ResponseEnvelope::error(
        Some(id),
        RpcError::invalid_params(vec![json!({"path": path, "message": message})]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::mock::MockApplication;
    use crate::bridge::BridgeSettings;
    use crate::registry::{ToolDefinition, ToolError};
    use std::time::Duration;
    use tempfile::tempdir;
    use tether_protocol::{ErrorCode, ResponsePayload};

    fn router_with(app: Arc<MockApplication>, registry: ToolRegistry) -> (Router, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let settings = BridgeSettings {
            call_timeout: Duration::from_millis(500),
            element_wait_timeout: Duration::from_millis(200),
            element_poll_interval: Duration::from_millis(20),
            results_dir: dir.path().to_path_buf(),
        };
        let bridge = Arc::new(CommandBridge::new(app, settings));
        (Router::new(Arc::new(registry), bridge), dir)
    }

    async fn router() -> (Router, Arc<MockApplication>, tempfile::TempDir) {
        let app = Arc::new(MockApplication::running().await);
        let (router, dir) = router_with(Arc::clone(&app), ToolRegistry::with_builtins().unwrap());
        (router, app, dir)
    }

    fn text(value: Value) -> Frame {
        Frame::Text(value.to_string())
    }

    fn request(id: Value, method: &str, params: Value) -> Frame {
        text(json!({"protocol": PROTOCOL_TAG, "id": id, "method": method, "params": params}))
    }

    fn error_of(response: &ResponseEnvelope) -> &RpcError {
        match &response.payload {
            ResponsePayload::Error(err) => err,
            ResponsePayload::Result(v) => panic!("expected error, got result {}", v),
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_parse_error() {
        let (router, _app, _dir) = router().await;
        let response = router.handle(Frame::Text("{not json".into())).await;
        assert_eq!(response.id, None);
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::ParseError));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_parse_error() {
        let (router, _app, _dir) = router().await;
        let response = router
            .handle(Frame::Invalid(FrameError::TooLarge { size: 100, max: 10 }))
            .await;
        assert_eq!(response.id, None);
        let err = error_of(&response);
        assert_eq!(err.kind(), Some(ErrorCode::ParseError));
        assert!(err.message.contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_envelope_shape_errors() {
        let (router, _app, _dir) = router().await;

        let response = router.handle(text(json!([1, 2]))).await;
        assert_eq!(response.id, None);
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::InvalidRequest));

        let response = router
            .handle(text(json!({"protocol": PROTOCOL_TAG, "method": "ping"})))
            .await;
        assert_eq!(response.id, None);
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::InvalidRequest));

        let response = router
            .handle(text(json!({"protocol": PROTOCOL_TAG, "id": 4})))
            .await;
        assert_eq!(response.id, Some(RequestId::from(4)));
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::InvalidRequest));
    }

    #[tokio::test]
    async fn test_wrong_protocol_tag_echoes_id() {
        let (router, _app, _dir) = router().await;
        let response = router
            .handle(text(json!({"protocol": "other/2", "id": "a", "method": "ping"})))
            .await;
        assert_eq!(response.id, Some(RequestId::from("a")));
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::InvalidRequest));
    }

    #[tokio::test]
    async fn test_ping_and_ids_echoed_verbatim() {
        let (router, _app, _dir) = router().await;
        for id in [json!(7), json!("req-7"), json!(1.5)] {
            let response = router.handle(request(id.clone(), "ping", Value::Null)).await;
            assert_eq!(serde_json::to_value(&response.id).unwrap(), id);
            assert_eq!(response.into_result().unwrap(), json!("pong"));
        }
    }

    #[tokio::test]
    async fn test_tools_list() {
        let (router, _app, _dir) = router().await;
        let response = router.handle(request(json!(1), "tools/list", json!({}))).await;
        let tools = response.into_result().unwrap();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"take_screenshot"));
        assert!(tools[0].get("inputSchema").is_some());
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (router, _app, _dir) = router().await;
        let response = router.handle(request(json!(1), "reboot", json!({}))).await;
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::MethodNotFound));
    }

    #[tokio::test]
    async fn test_invalid_params_has_no_side_effects() {
        let (router, app, _dir) = router().await;

        let response = router.handle(request(json!(1), "text_input", json!({}))).await;
        let err = error_of(&response);
        assert_eq!(err.kind(), Some(ErrorCode::InvalidParams));
        assert!(!err.violations().is_empty());
        assert_eq!(app.call_count(), 0);

        let response = router.handle(request(json!(2), "text_input", json!([1]))).await;
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::InvalidParams));
        assert_eq!(app.call_count(), 0);

        let response = router
            .handle(request(json!(3), "text_input", json!({"text": "hello"})))
            .await;
        assert!(!response.is_error());
        assert_eq!(app.call_count(), 1);
    }

    #[tokio::test]
    async fn test_tools_call_indirection() {
        let (router, _app, _dir) = router().await;
        let response = router
            .handle(request(
                json!(1),
                "tools/call",
                json!({"name": "get_dom", "arguments": {}}),
            ))
            .await;
        assert!(response.into_result().unwrap().as_str().unwrap().contains("<html>"));

        let response = router
            .handle(request(json!(2), "tools/call", json!({"arguments": {}})))
            .await;
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::InvalidParams));

        let response = router
            .handle(request(json!(3), "tools/call", json!({"name": "nope"})))
            .await;
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::MethodNotFound));
    }

    #[tokio::test]
    async fn test_bridge_errors_are_server_errors() {
        let (router, _app, _dir) = router().await;
        let response = router
            .handle(request(
                json!(1),
                "send_text_to_element",
                json!({"selector": "#save", "action": "click"}),
            ))
            .await;
        let err = error_of(&response);
        assert_eq!(err.kind(), Some(ErrorCode::ServerError));
        assert_eq!(err.reason(), Some("element_not_found"));
        assert_eq!(err.message, "element_not_found: selector=#save");
    }

    #[tokio::test]
    async fn test_panicking_handler_is_internal_error() {
        let app = Arc::new(MockApplication::running().await);
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new(
                "explode",
                "always panics",
                json!({"type": "object"}),
                Access::Mutating,
                |_, _| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok::<Value, ToolError>(Value::Null)
                },
            ))
            .unwrap();
        let (router, _dir) = router_with(app, registry);

        let response = router.handle(request(json!(9), "explode", json!({}))).await;
        assert_eq!(response.id, Some(RequestId::from(9)));
        assert_eq!(error_of(&response).kind(), Some(ErrorCode::InternalError));

        // The permit was released despite the panic
        let permit = tokio::time::timeout(
            Duration::from_millis(100),
            router.bridge().admit(Access::Mutating),
        )
        .await;
        assert!(permit.is_ok());
    }
}
