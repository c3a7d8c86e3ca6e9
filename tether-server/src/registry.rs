//! Tool registry: name -> schema + handler
//!
//! Schemas are compiled when a tool is registered, so a duplicate name or a
//! broken schema fails server startup rather than the first call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use tether_protocol::{methods, RpcError, ToolCallError, ToolInfo};

use crate::bridge::{Access, BridgeError, CommandBridge};

/// Error returned by a tool handler
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Params(#[from] ToolCallError),

    #[error("{0}")]
    Internal(String),
}

impl From<ToolError> for RpcError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Bridge(e) => e.into(),
            ToolError::Params(e) => RpcError::invalid_params(vec![json!({
                "path": "",
                "message": e.to_string(),
            })]),
            ToolError::Internal(msg) => RpcError::internal(msg),
        }
    }
}

pub type ToolFuture = BoxFuture<'static, Result<Value, ToolError>>;

/// Handler invoked with the bridge and already-validated params
pub type ToolHandler = Arc<dyn Fn(Arc<CommandBridge>, Value) -> ToolFuture + Send + Sync>;

/// Registry errors, raised at load time
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool {0} is already registered")]
    Duplicate(String),

    #[error("tool name {0} is reserved")]
    Reserved(String),

    #[error("tool name must not be empty")]
    EmptyName,

    #[error("invalid input schema for {name}: {message}")]
    InvalidSchema { name: String, message: String },
}

/// A tool as declared by its author
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub access: Access,
    pub handler: ToolHandler,
}

impl ToolDefinition {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        access: Access,
        handler: F,
    ) -> Self
    where
        F: Fn(Arc<CommandBridge>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            access,
            handler: Arc::new(move |bridge: Arc<CommandBridge>, params: Value| -> ToolFuture {
                Box::pin(handler(bridge, params))
            }),
        }
    }

    pub fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

/// A registered tool with its compiled schema
pub struct RegisteredTool {
    definition: ToolDefinition,
    validator: jsonschema::Validator,
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn access(&self) -> Access {
        self.definition.access
    }

    pub fn handler(&self) -> ToolHandler {
        Arc::clone(&self.definition.handler)
    }

    /// Check params against the schema, collecting every violation
    ///
    /// Each violation is `{path, message}` with `path` a JSON pointer into
    /// the params (`""` for the root).
    pub fn validate(&self, params: &Value) -> Result<(), Vec<Value>> {
        let violations: Vec<Value> = self
            .validator
            .iter_errors(params)
            .map(|error| {
                json!({
                    "path": error.instance_path().to_string(),
                    "message": error.to_string(),
                })
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Catalog of tools exposed over the socket
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<RegisteredTool>>,
}

impl ToolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in tool catalog
    pub fn with_builtins() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for definition in crate::tools::builtin_tools() {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    /// Add a tool, compiling its schema
    pub fn register(&mut self, definition: ToolDefinition) -> Result<(), RegistryError> {
        let name = definition.name.clone();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if methods::is_reserved(&name) {
            return Err(RegistryError::Reserved(name));
        }
        if self.tools.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        if definition.input_schema.get("type") != Some(&json!("object")) {
            return Err(RegistryError::InvalidSchema {
                name,
                message: "schema root must be {\"type\": \"object\"}".into(),
            });
        }

        let validator = jsonschema::options()
            .build(&definition.input_schema)
            .map_err(|e| RegistryError::InvalidSchema {
                name: name.clone(),
                message: e.to_string(),
            })?;

        self.tools.insert(
            name,
            Arc::new(RegisteredTool {
                definition,
                validator,
            }),
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools.get(name).cloned()
    }

    /// Discovery listing, sorted by name
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|tool| tool.definition.info())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str, schema: Value) -> ToolDefinition {
        ToolDefinition::new(name, "test tool", schema, Access::ReadOnly, |_, _| async {
            Ok(Value::Null)
        })
    }

    fn object_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"},
                "count": {"type": "integer", "minimum": 0}
            },
            "required": ["text"]
        })
    }

    #[test]
    fn test_register_and_list_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(noop("zeta", object_schema())).unwrap();
        registry.register(noop("alpha", object_schema())).unwrap();

        let names: Vec<_> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(noop("echo", object_schema())).unwrap();
        assert!(matches!(
            registry.register(noop("echo", object_schema())),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[test]
    fn test_reserved_and_empty_names_rejected() {
        let mut registry = ToolRegistry::new();
        assert!(matches!(
            registry.register(noop("tools/list", object_schema())),
            Err(RegistryError::Reserved(_))
        ));
        assert!(matches!(
            registry.register(noop(" ", object_schema())),
            Err(RegistryError::EmptyName)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let mut registry = ToolRegistry::new();
        let broken = json!({
            "type": "object",
            "properties": {"a": {"type": "not-a-type"}}
        });
        assert!(matches!(
            registry.register(noop("broken", broken)),
            Err(RegistryError::InvalidSchema { .. })
        ));

        let not_object = json!({"type": "string"});
        assert!(matches!(
            registry.register(noop("scalar", not_object)),
            Err(RegistryError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn test_validate_collects_violations() {
        let mut registry = ToolRegistry::new();
        registry.register(noop("typed", object_schema())).unwrap();
        let tool = registry.get("typed").unwrap();

        assert!(tool.validate(&json!({"text": "hi"})).is_ok());

        let violations = tool.validate(&json!({"count": -1})).unwrap_err();
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| v["path"] == "/count"));
        assert!(violations.iter().any(|v| v["path"] == ""));
    }

    #[test]
    fn test_builtins_load() {
        let registry = ToolRegistry::with_builtins().unwrap();
        for name in tether_protocol::types::BUILTIN_TOOLS {
            assert!(registry.get(name).is_some(), "missing builtin {}", name);
        }
        assert_eq!(registry.len(), tether_protocol::types::BUILTIN_TOOLS.len());
    }

    #[test]
    fn test_tool_error_mapping() {
        let rpc: RpcError = ToolError::Internal("oops".into()).into();
        assert_eq!(rpc.kind(), Some(tether_protocol::ErrorCode::InternalError));
    }
}
