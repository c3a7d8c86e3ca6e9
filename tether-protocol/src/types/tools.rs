//! Parameter types for the built-in tools
//!
//! Params arrive as arbitrary JSON and are validated against each tool's
//! schema by the registry. Only then are they parsed into [`ToolCall`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TAKE_SCREENSHOT: &str = "take_screenshot";
pub const GET_DOM: &str = "get_dom";
pub const EXECUTE_JS: &str = "execute_js";
pub const TEXT_INPUT: &str = "text_input";
pub const SEND_TEXT_TO_ELEMENT: &str = "send_text_to_element";
pub const INVOKE_COMMAND: &str = "invoke_command";
pub const GET_ELEMENT_POSITION: &str = "get_element_position";
pub const MOUSE_MOVEMENT: &str = "mouse_movement";
pub const MANAGE_LOCAL_STORAGE: &str = "manage_local_storage";

/// Every built-in tool name
pub const BUILTIN_TOOLS: &[&str] = &[
    TAKE_SCREENSHOT,
    GET_DOM,
    EXECUTE_JS,
    TEXT_INPUT,
    SEND_TEXT_TO_ELEMENT,
    INVOKE_COMMAND,
    GET_ELEMENT_POSITION,
    MOUSE_MOVEMENT,
    MANAGE_LOCAL_STORAGE,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeScreenshotParams {
    /// File name relative to the results directory
    pub filename: String,
    /// Also return the image as base64
    #[serde(default)]
    pub encoded: bool,
    /// Window to capture; the host picks its main window when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_label: Option<String>,
    /// Application name used by the host to find the window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteJsParams {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextInputParams {
    pub text: String,
    /// Target element; the focused element when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub clear_field_first: bool,
}

/// What to do with an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementAction {
    Click,
    Focus,
    Type,
}

impl ElementAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Focus => "focus",
            Self::Type => "type",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTextToElementParams {
    pub selector: String,
    pub action: ElementAction,
    /// Poll for the selector before acting
    #[serde(default)]
    pub wait_for_element: bool,
    /// Required when `action` is `type`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeCommandParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementPositionParams {
    pub selector: String,
    #[serde(default)]
    pub wait_for_element: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

impl MouseButton {
    /// DOM `MouseEvent.button` index
    pub fn index(self) -> u8 {
        match self {
            Self::Left => 0,
            Self::Middle => 1,
            Self::Right => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseMovementParams {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub click: bool,
    #[serde(default)]
    pub button: MouseButton,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageAction {
    Get,
    Set,
    Remove,
    Clear,
    Keys,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageParams {
    pub action: StorageAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Failure turning validated params into a [`ToolCall`]
#[derive(Debug, thiserror::Error)]
pub enum ToolCallError {
    #[error("not a built-in tool: {0}")]
    UnknownTool(String),

    #[error("invalid params for {tool}: {source}")]
    InvalidParams {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A built-in tool invocation, keyed by tool name
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    TakeScreenshot(TakeScreenshotParams),
    GetDom,
    ExecuteJs(ExecuteJsParams),
    TextInput(TextInputParams),
    SendTextToElement(SendTextToElementParams),
    InvokeCommand(InvokeCommandParams),
    GetElementPosition(ElementPositionParams),
    MouseMovement(MouseMovementParams),
    ManageLocalStorage(LocalStorageParams),
}

impl ToolCall {
    /// Parse params for the named built-in tool
    pub fn parse(name: &str, params: Value) -> Result<Self, ToolCallError> {
        fn typed<T: serde::de::DeserializeOwned>(
            name: &str,
            params: Value,
        ) -> Result<T, ToolCallError> {
            serde_json::from_value(params).map_err(|source| ToolCallError::InvalidParams {
                tool: name.to_string(),
                source,
            })
        }

        let call = match name {
            TAKE_SCREENSHOT => Self::TakeScreenshot(typed(name, params)?),
            GET_DOM => Self::GetDom,
            EXECUTE_JS => Self::ExecuteJs(typed(name, params)?),
            TEXT_INPUT => Self::TextInput(typed(name, params)?),
            SEND_TEXT_TO_ELEMENT => Self::SendTextToElement(typed(name, params)?),
            INVOKE_COMMAND => Self::InvokeCommand(typed(name, params)?),
            GET_ELEMENT_POSITION => Self::GetElementPosition(typed(name, params)?),
            MOUSE_MOVEMENT => Self::MouseMovement(typed(name, params)?),
            MANAGE_LOCAL_STORAGE => Self::ManageLocalStorage(typed(name, params)?),
            other => return Err(ToolCallError::UnknownTool(other.to_string())),
        };
        Ok(call)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TakeScreenshot(_) => TAKE_SCREENSHOT,
            Self::GetDom => GET_DOM,
            Self::ExecuteJs(_) => EXECUTE_JS,
            Self::TextInput(_) => TEXT_INPUT,
            Self::SendTextToElement(_) => SEND_TEXT_TO_ELEMENT,
            Self::InvokeCommand(_) => INVOKE_COMMAND,
            Self::GetElementPosition(_) => GET_ELEMENT_POSITION,
            Self::MouseMovement(_) => MOUSE_MOVEMENT,
            Self::ManageLocalStorage(_) => MANAGE_LOCAL_STORAGE,
        }
    }

    /// Whether the call may change application state
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::TakeScreenshot(_) | Self::GetDom | Self::GetElementPosition(_)
        )
    }

    /// Split into the wire method name and params object
    pub fn into_parts(self) -> (&'static str, Value) {
        let name = self.name();
        let params = match self {
            Self::TakeScreenshot(p) => serde_json::to_value(p),
            Self::GetDom => Ok(Value::Object(Default::default())),
            Self::ExecuteJs(p) => serde_json::to_value(p),
            Self::TextInput(p) => serde_json::to_value(p),
            Self::SendTextToElement(p) => serde_json::to_value(p),
            Self::InvokeCommand(p) => serde_json::to_value(p),
            Self::GetElementPosition(p) => serde_json::to_value(p),
            Self::MouseMovement(p) => serde_json::to_value(p),
            Self::ManageLocalStorage(p) => serde_json::to_value(p),
        };
        // Plain structs with string keys always serialize
        (name, params.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_text_input_defaults() {
        let call = ToolCall::parse(TEXT_INPUT, json!({"text": "hello"})).unwrap();
        match call {
            ToolCall::TextInput(p) => {
                assert_eq!(p.text, "hello");
                assert!(p.selector.is_none());
                assert!(!p.clear_field_first);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_parse_send_text_action() {
        let call = ToolCall::parse(
            SEND_TEXT_TO_ELEMENT,
            json!({"selector": "#name", "action": "type", "text": "Ada", "wait_for_element": true}),
        )
        .unwrap();
        let ToolCall::SendTextToElement(p) = call else {
            panic!("wrong variant");
        };
        assert_eq!(p.action, ElementAction::Type);
        assert!(p.wait_for_element);
        assert_eq!(p.text.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_parse_get_dom_ignores_params() {
        assert_eq!(ToolCall::parse(GET_DOM, json!({})).unwrap(), ToolCall::GetDom);
    }

    #[test]
    fn test_parse_unknown_tool() {
        assert!(matches!(
            ToolCall::parse("launch_rockets", json!({})),
            Err(ToolCallError::UnknownTool(_))
        ));
    }

    #[test]
    fn test_parse_type_mismatch() {
        let err = ToolCall::parse(MOUSE_MOVEMENT, json!({"x": "left", "y": 1})).unwrap_err();
        assert!(matches!(err, ToolCallError::InvalidParams { .. }));
    }

    #[test]
    fn test_access_classes() {
        let read_only = [
            ToolCall::GetDom,
            ToolCall::TakeScreenshot(TakeScreenshotParams {
                filename: "x.png".into(),
                ..Default::default()
            }),
            ToolCall::GetElementPosition(ElementPositionParams {
                selector: "#a".into(),
                wait_for_element: false,
            }),
        ];
        for call in &read_only {
            assert!(!call.is_mutating(), "{} should be read-only", call.name());
        }

        let script = ToolCall::ExecuteJs(ExecuteJsParams {
            code: "1 + 1".into(),
        });
        assert!(script.is_mutating());
    }

    #[test]
    fn test_into_parts_matches_parse() {
        let call = ToolCall::MouseMovement(MouseMovementParams {
            x: 5.0,
            y: 6.0,
            click: true,
            button: MouseButton::Right,
        });
        let (name, params) = call.clone().into_parts();
        assert_eq!(name, MOUSE_MOVEMENT);
        assert_eq!(params["button"], "right");
        assert_eq!(ToolCall::parse(name, params).unwrap(), call);
    }

    #[test]
    fn test_builtin_names_unique() {
        let mut names = BUILTIN_TOOLS.to_vec();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), BUILTIN_TOOLS.len());
    }
}
