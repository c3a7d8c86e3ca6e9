//! Command bridge: executes validated tool calls against the live application
//!
//! The bridge owns the per-call timeout, element polling and the single
//! serialization point in front of the application. Mutating calls hold the
//! write side of a FIFO read/write lock for their whole execution; read-only
//! calls share the read side and therefore queue behind any mutation that was
//! admitted before them.

pub mod screenshot;
pub mod scripts;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use tether_protocol::types::{
    ElementPositionParams, LocalStorageParams, MouseMovementParams, SendTextToElementParams,
    StorageAction, TakeScreenshotParams, TextInputParams,
};
use tether_protocol::{ElementAction, ElementPosition, RpcError, ScreenshotResult, ToolCall};

use crate::app::{AppError, Application};
use crate::config::BridgeConfig;

/// App command that returns the active view as base64 PNG data
pub const CAPTURE_SCREENSHOT_COMMAND: &str = "capture_screenshot";

/// Bridge failures, answered as `ServerError` with a `reason` discriminator
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{operation} did not complete within {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("{0}")]
    AppUnreachable(String),

    #[error("selector={selector}")]
    ElementNotFound { selector: String },

    #[error("{0}")]
    ScriptFailed(String),

    #[error("{command}: {message}")]
    CommandFailed { command: String, message: String },

    #[error("{path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Malformed application reply; answered as `InternalError`
    #[error("{0}")]
    Internal(String),
}

impl BridgeError {
    /// Wire `reason` discriminator
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::AppUnreachable(_) => "app_unreachable",
            Self::ElementNotFound { .. } => "element_not_found",
            Self::ScriptFailed(_) => "script_error",
            Self::CommandFailed { .. } => "command_failed",
            Self::InvalidPath { .. } => "invalid_path",
            Self::Io(_) => "io_error",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<AppError> for BridgeError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Unreachable(msg) => Self::AppUnreachable(msg),
            AppError::CommandFailed { command, message } => Self::CommandFailed { command, message },
            AppError::ScriptFailed(msg) => Self::ScriptFailed(msg),
            AppError::Protocol(msg) => Self::Internal(msg),
        }
    }
}

impl From<BridgeError> for RpcError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Internal(msg) => RpcError::internal(msg),
            other => RpcError::server_error(other.reason(), other.to_string()),
        }
    }
}

/// Access class of a tool, driving the serialization policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    Mutating,
}

/// Owned guard on the serialization lock, held for a call's whole execution
pub enum CallPermit {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

impl CallPermit {
    pub fn access(&self) -> Access {
        match self {
            Self::Shared(_) => Access::ReadOnly,
            Self::Exclusive(_) => Access::Mutating,
        }
    }
}

/// Timing and output settings
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub call_timeout: Duration,
    pub element_wait_timeout: Duration,
    pub element_poll_interval: Duration,
    pub results_dir: PathBuf,
}

impl From<&BridgeConfig> for BridgeSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            element_wait_timeout: config.element_wait_timeout(),
            element_poll_interval: config.element_poll_interval(),
            results_dir: config.resolved_results_dir(),
        }
    }
}

/// The one serialization point in front of the live application
pub struct CommandBridge {
    app: Arc<dyn Application>,
    lock: Arc<RwLock<()>>,
    settings: BridgeSettings,
}

impl CommandBridge {
    pub fn new(app: Arc<dyn Application>, settings: BridgeSettings) -> Self {
        Self {
            app,
            lock: Arc::new(RwLock::new(())),
            settings,
        }
    }

    pub fn application(&self) -> &Arc<dyn Application> {
        &self.app
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Wait for this call's turn
    ///
    /// The lock is fair: permits are granted in the order `admit` was called,
    /// so a read-only call admitted after a mutating one waits for it.
    pub async fn admit(&self, access: Access) -> CallPermit {
        match access {
            Access::ReadOnly => CallPermit::Shared(Arc::clone(&self.lock).read_owned().await),
            Access::Mutating => CallPermit::Exclusive(Arc::clone(&self.lock).write_owned().await),
        }
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T, BridgeError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        let after = self.settings.call_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(operation, timeout_ms = after.as_millis() as u64, "Application call timed out");
                Err(BridgeError::Timeout {
                    operation: operation.to_string(),
                    after,
                })
            }
        }
    }

    /// Invoke a named application command under the per-call timeout
    pub async fn invoke(&self, command: &str, args: Value) -> Result<Value, BridgeError> {
        self.timed(command, self.app.invoke(command, args)).await
    }

    /// Evaluate a script under the per-call timeout
    pub async fn evaluate(&self, operation: &str, script: &str) -> Result<Value, BridgeError> {
        self.timed(operation, self.app.evaluate(script)).await
    }

    pub async fn element_exists(&self, selector: &str) -> Result<bool, BridgeError> {
        let value = self
            .evaluate("element_exists", &scripts::element_exists(selector))
            .await?;
        value
            .as_bool()
            .ok_or_else(|| BridgeError::Internal(format!("element check returned {}", value)))
    }

    /// Poll for the selector until the element wait deadline
    pub async fn wait_for_element(&self, selector: &str) -> Result<(), BridgeError> {
        let deadline = Instant::now() + self.settings.element_wait_timeout;
        loop {
            if self.element_exists(selector).await? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(selector, "Element did not appear before deadline");
                return Err(BridgeError::ElementNotFound {
                    selector: selector.to_string(),
                });
            }
            let pause = self.settings.element_poll_interval.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// Run a validated built-in tool call
    pub async fn dispatch(&self, call: ToolCall) -> Result<Value, BridgeError> {
        match call {
            ToolCall::TakeScreenshot(p) => to_value(self.take_screenshot(p).await?),
            ToolCall::GetDom => self.get_dom().await.map(Value::String),
            ToolCall::ExecuteJs(p) => self.evaluate("execute_js", &p.code).await,
            ToolCall::TextInput(p) => self.text_input(p).await,
            ToolCall::SendTextToElement(p) => self.send_text_to_element(p).await,
            ToolCall::InvokeCommand(p) => {
                let args = if p.args.is_null() { json!({}) } else { p.args };
                self.invoke(&p.command, args).await
            }
            ToolCall::GetElementPosition(p) => to_value(self.get_element_position(p).await?),
            ToolCall::MouseMovement(p) => self.mouse_movement(p).await,
            ToolCall::ManageLocalStorage(p) => self.manage_local_storage(p).await,
        }
    }

    pub async fn get_dom(&self) -> Result<String, BridgeError> {
        let value = self.evaluate("get_dom", &scripts::get_dom()).await?;
        match value {
            Value::String(html) => Ok(html),
            other => Err(BridgeError::Internal(format!(
                "get_dom returned {} instead of a string",
                type_name(&other)
            ))),
        }
    }

    pub async fn text_input(&self, params: TextInputParams) -> Result<Value, BridgeError> {
        let script = scripts::text_input(
            params.selector.as_deref(),
            &params.text,
            params.clear_field_first,
        );
        let value = self.evaluate("text_input", &script).await?;
        check_present(value, params.selector.as_deref().unwrap_or(":focus"))
    }

    pub async fn send_text_to_element(
        &self,
        params: SendTextToElementParams,
    ) -> Result<Value, BridgeError> {
        if params.action == ElementAction::Type && params.text.is_none() {
            return Err(BridgeError::ScriptFailed(
                "action \"type\" requires text".into(),
            ));
        }
        if params.wait_for_element {
            self.wait_for_element(&params.selector).await?;
        }
        let script =
            scripts::element_action(&params.selector, params.action, params.text.as_deref());
        let value = self.evaluate("send_text_to_element", &script).await?;
        check_present(value, &params.selector)
    }

    pub async fn get_element_position(
        &self,
        params: ElementPositionParams,
    ) -> Result<ElementPosition, BridgeError> {
        if params.wait_for_element {
            self.wait_for_element(&params.selector).await?;
        }
        let value = self
            .evaluate(
                "get_element_position",
                &scripts::element_position(&params.selector),
            )
            .await?;
        let value = check_present(value, &params.selector)?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::Internal(format!("bad element position: {}", e)))
    }

    pub async fn mouse_movement(&self, params: MouseMovementParams) -> Result<Value, BridgeError> {
        let script = scripts::mouse_movement(params.x, params.y, params.click, params.button);
        self.evaluate("mouse_movement", &script).await
    }

    pub async fn manage_local_storage(
        &self,
        params: LocalStorageParams,
    ) -> Result<Value, BridgeError> {
        let needs_key = matches!(
            params.action,
            StorageAction::Get | StorageAction::Set | StorageAction::Remove
        );
        if needs_key && params.key.is_none() {
            return Err(BridgeError::ScriptFailed("local storage key is required".into()));
        }
        let script = scripts::local_storage(
            params.action,
            params.key.as_deref(),
            params.value.as_deref(),
        );
        self.evaluate("manage_local_storage", &script).await
    }

    /// Capture the active view and write it under the results directory
    ///
    /// The returned path is absolute. An existing file is never overwritten;
    /// a numbered variant is used instead and reported.
    pub async fn take_screenshot(
        &self,
        params: TakeScreenshotParams,
    ) -> Result<ScreenshotResult, BridgeError> {
        let target = screenshot::resolve_target(&self.settings.results_dir, &params.filename)?;
        let payload = self
            .invoke(CAPTURE_SCREENSHOT_COMMAND, capture_args(&params))
            .await?;
        let bytes = screenshot::decode_payload(&payload)?;
        let path = screenshot::write_unique(&target, &bytes).await?;

        debug!(path = %path.display(), bytes = bytes.len(), "Screenshot written");
        Ok(ScreenshotResult {
            path: path.to_string_lossy().into_owned(),
            bytes: bytes.len() as u64,
            data: params
                .encoded
                .then(|| base64::engine::general_purpose::STANDARD.encode(&bytes)),
        })
    }
}

/// Window selection forwarded to the capture command
fn capture_args(params: &TakeScreenshotParams) -> Value {
    let mut args = serde_json::Map::new();
    if let Some(label) = &params.window_label {
        args.insert("window_label".into(), json!(label));
    }
    if let Some(name) = &params.application_name {
        args.insert("application_name".into(), json!(name));
    }
    Value::Object(args)
}

/// Turn a `{"missing": true}` script reply into `ElementNotFound`
fn check_present(value: Value, selector: &str) -> Result<Value, BridgeError> {
    if value.get("missing").and_then(Value::as_bool) == Some(true) {
        return Err(BridgeError::ElementNotFound {
            selector: selector.to_string(),
        });
    }
    Ok(value)
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|e| BridgeError::Internal(e.to_string()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
