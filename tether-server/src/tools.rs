//! Built-in tool catalog
//!
//! Each tool pairs a JSON Schema input contract with a handler that parses
//! the validated params into a [`ToolCall`] and hands it to the bridge.

use std::sync::Arc;

use serde_json::{json, Value};

use tether_protocol::types::{
    EXECUTE_JS, GET_DOM, GET_ELEMENT_POSITION, INVOKE_COMMAND, MANAGE_LOCAL_STORAGE,
    MOUSE_MOVEMENT, SEND_TEXT_TO_ELEMENT, TAKE_SCREENSHOT, TEXT_INPUT,
};
use tether_protocol::ToolCall;

use crate::bridge::{Access, CommandBridge};
use crate::registry::{ToolDefinition, ToolError};

fn builtin(name: &'static str, description: &str, schema: Value, access: Access) -> ToolDefinition {
    ToolDefinition::new(
        name,
        description,
        schema,
        access,
        move |bridge: Arc<CommandBridge>, params: Value| async move {
            let call = ToolCall::parse(name, params)?;
            let value = bridge.dispatch(call).await?;
            Ok::<Value, ToolError>(value)
        },
    )
}

/// All built-in tools
pub fn builtin_tools() -> Vec<ToolDefinition> {
    vec![
        builtin(
            TAKE_SCREENSHOT,
            "Capture the application window and save it as a PNG under the results directory. \
             Returns the absolute path written; an existing file is never overwritten.",
            json!({
                "type": "object",
                "properties": {
                    "filename": {
                        "type": "string",
                        "minLength": 1,
                        "description": "File name relative to the results directory"
                    },
                    "encoded": {
                        "type": "boolean",
                        "description": "Also return the image as base64",
                        "default": false
                    },
                    "window_label": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Window to capture (defaults to the main window)"
                    },
                    "application_name": {
                        "type": "string",
                        "description": "Application name used to locate the window"
                    }
                },
                "required": ["filename"],
                "additionalProperties": false
            }),
            Access::ReadOnly,
        ),
        builtin(
            GET_DOM,
            "Return the outer HTML of the active view's document.",
            json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
            Access::ReadOnly,
        ),
        builtin(
            EXECUTE_JS,
            "Evaluate JavaScript in the active view and return the resulting value.",
            json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Script to evaluate"
                    }
                },
                "required": ["code"],
                "additionalProperties": false
            }),
            Access::Mutating,
        ),
        builtin(
            TEXT_INPUT,
            "Type text into an element, or into the focused element when no selector is given.",
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string", "description": "Text to type"},
                    "selector": {"type": "string", "minLength": 1, "description": "CSS selector of the target"},
                    "clear_field_first": {
                        "type": "boolean",
                        "description": "Clear the field before typing",
                        "default": false
                    }
                },
                "required": ["text"],
                "additionalProperties": false
            }),
            Access::Mutating,
        ),
        builtin(
            SEND_TEXT_TO_ELEMENT,
            "Click, focus or type into the element matching a selector, optionally waiting for it to appear.",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "minLength": 1},
                    "action": {"type": "string", "enum": ["click", "focus", "type"]},
                    "text": {"type": "string"},
                    "wait_for_element": {"type": "boolean", "default": false}
                },
                "required": ["selector", "action"],
                "if": {"properties": {"action": {"const": "type"}}, "required": ["action"]},
                "then": {"required": ["text"]},
                "additionalProperties": false
            }),
            Access::Mutating,
        ),
        builtin(
            INVOKE_COMMAND,
            "Invoke a named application command with JSON arguments and return its result.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "minLength": 1},
                    "args": {"type": "object"}
                },
                "required": ["command"],
                "additionalProperties": false
            }),
            Access::Mutating,
        ),
        builtin(
            GET_ELEMENT_POSITION,
            "Return the bounding box of the element matching a selector.",
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string", "minLength": 1},
                    "wait_for_element": {"type": "boolean", "default": false}
                },
                "required": ["selector"],
                "additionalProperties": false
            }),
            Access::ReadOnly,
        ),
        builtin(
            MOUSE_MOVEMENT,
            "Move the pointer to view coordinates and optionally click.",
            json!({
                "type": "object",
                "properties": {
                    "x": {"type": "number"},
                    "y": {"type": "number"},
                    "click": {"type": "boolean", "default": false},
                    "button": {"type": "string", "enum": ["left", "middle", "right"], "default": "left"}
                },
                "required": ["x", "y"],
                "additionalProperties": false
            }),
            Access::Mutating,
        ),
        builtin(
            MANAGE_LOCAL_STORAGE,
            "Read or modify the active view's localStorage.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["get", "set", "remove", "clear", "keys"]},
                    "key": {"type": "string"},
                    "value": {"type": "string"}
                },
                "required": ["action"],
                "allOf": [
                    {
                        "if": {"properties": {"action": {"enum": ["get", "remove"]}}, "required": ["action"]},
                        "then": {"required": ["key"]}
                    },
                    {
                        "if": {"properties": {"action": {"const": "set"}}, "required": ["action"]},
                        "then": {"required": ["key", "value"]}
                    }
                ],
                "additionalProperties": false
            }),
            Access::Mutating,
        ),
    ]
}
