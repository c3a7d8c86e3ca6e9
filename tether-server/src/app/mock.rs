//! Scripted in-memory application for tests
//!
//! Understands the scripts the bridge generates by their `// tether:<kind>`
//! header and the `const selector = ...;` line, and keeps a log of call
//! start/end events so tests can assert on serialization order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;

use super::{AppError, Application};

/// A call boundary observed by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Start(String),
    End(String),
}

pub struct MockApplication {
    running: AtomicBool,
    killed: watch::Sender<bool>,
    events: Mutex<Vec<MockEvent>>,
    /// Calls that reached the application (including failed ones)
    calls: AtomicUsize,
    /// Per-label artificial latency
    stalls: Mutex<HashMap<String, Duration>>,
    /// Command name -> failure message
    failures: Mutex<HashMap<String, String>>,
    /// Commands invoked, with their arguments
    invocations: Mutex<Vec<(String, Value)>>,
    elements: Mutex<HashSet<String>>,
    storage: Mutex<HashMap<String, String>>,
    dom: Mutex<String>,
    screenshot: Mutex<Vec<u8>>,
}

impl MockApplication {
    pub fn new() -> Self {
        let (killed, _) = watch::channel(false);
        Self {
            running: AtomicBool::new(false),
            killed,
            events: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            stalls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            elements: Mutex::new(HashSet::new()),
            storage: Mutex::new(HashMap::new()),
            dom: Mutex::new("<html><body><main id=\"app\"></main></body></html>".into()),
            screenshot: Mutex::new(b"\x89PNG\r\n\x1a\nmock-image".to_vec()),
        }
    }

    /// Started mock, the common case in tests
    pub async fn running() -> Self {
        let app = Self::new();
        let _ = app.start().await;
        app
    }

    /// Delay every call with this label (`invoke` command name or script kind)
    pub fn stall(&self, label: &str, delay: Duration) {
        self.stalls.lock().insert(label.to_string(), delay);
    }

    pub fn fail_command(&self, command: &str, message: &str) {
        self.failures
            .lock()
            .insert(command.to_string(), message.to_string());
    }

    pub fn add_element(&self, selector: &str) {
        self.elements.lock().insert(selector.to_string());
    }

    pub fn set_dom(&self, html: &str) {
        *self.dom.lock() = html.to_string();
    }

    /// Simulate a crash: in-flight and later calls fail as unreachable
    pub fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.killed.send_replace(true);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Labels in the order their calls started
    pub fn started(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MockEvent::Start(label) => Some(label.clone()),
                MockEvent::End(_) => None,
            })
            .collect()
    }

    async fn enter(&self, label: &str) -> Result<(), AppError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AppError::unreachable("mock application is not running"));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(MockEvent::Start(label.to_string()));

        let delay = self.stalls.lock().get(label).copied();
        if let Some(delay) = delay {
            let mut killed = self.killed.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = killed.wait_for(|k| *k) => {
                    return Err(AppError::unreachable("mock application was killed"));
                }
            }
        }

        if !self.running.load(Ordering::SeqCst) {
            return Err(AppError::unreachable("mock application was killed"));
        }
        Ok(())
    }

    fn leave(&self, label: &str) {
        self.events.lock().push(MockEvent::End(label.to_string()));
    }

    fn run_script(&self, kind: &str, selector: Option<String>, script: &str) -> Result<Value, AppError> {
        let present = |sel: &Option<String>| match sel {
            Some(s) => self.elements.lock().contains(s),
            None => true,
        };

        match kind {
            "get_dom" => Ok(Value::String(self.dom.lock().clone())),
            "element_exists" => Ok(Value::Bool(present(&selector))),
            "text_input" if present(&selector) => {
                let text = string_const(script, "text").unwrap_or_default();
                Ok(json!({"typed": text.chars().count()}))
            }
            "element_action" if present(&selector) => {
                let action = string_const(script, "action").unwrap_or_default();
                Ok(json!({"action": action, "selector": selector}))
            }
            "element_position" if present(&selector) => {
                Ok(json!({"x": 10.0, "y": 20.0, "width": 100.0, "height": 30.0}))
            }
            "mouse_movement" => Ok(json!({"moved": true})),
            "local_storage" => {
                let action = string_const(script, "action").unwrap_or_default();
                let key = string_const(script, "key");
                let mut storage = self.storage.lock();
                Ok(match action.as_str() {
                    "get" => json!({"value": key.and_then(|k| storage.get(&k).cloned())}),
                    "set" => {
                        let value = string_const(script, "value").unwrap_or_default();
                        storage.insert(key.unwrap_or_default(), value);
                        json!({"ok": true})
                    }
                    "remove" => {
                        storage.remove(&key.unwrap_or_default());
                        json!({"ok": true})
                    }
                    "clear" => {
                        storage.clear();
                        json!({"ok": true})
                    }
                    _ => {
                        let mut keys: Vec<_> = storage.keys().cloned().collect();
                        keys.sort();
                        json!({"keys": keys})
                    }
                })
            }
            "text_input" | "element_action" | "element_position" => Ok(json!({"missing": true})),
            // Raw user code
            _ if script.contains("throw") => Err(AppError::ScriptFailed("Error: thrown".into())),
            _ => Ok(json!({"evaluated": script})),
        }
    }
}

/// Script kind from the `// tether:<kind>` header
fn script_kind(script: &str) -> &str {
    script
        .lines()
        .next()
        .and_then(|l| l.trim().strip_prefix("// tether:"))
        .unwrap_or("user")
}

/// Value of a `const <name> = <json string>;` line
fn string_const(script: &str, name: &str) -> Option<String> {
    let prefix = format!("const {} = ", name);
    script.lines().find_map(|line| {
        let literal = line.trim().strip_prefix(&prefix)?.strip_suffix(';')?;
        serde_json::from_str::<Option<String>>(literal).ok().flatten()
    })
}

#[async_trait]
impl Application for MockApplication {
    async fn start(&self) -> Result<(), AppError> {
        self.killed.send_replace(false);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke(&self, command: &str, args: Value) -> Result<Value, AppError> {
        self.enter(command).await?;
        self.invocations
            .lock()
            .push((command.to_string(), args.clone()));
        let failure = self.failures.lock().get(command).cloned();
        let result = match failure {
            Some(message) => Err(AppError::CommandFailed {
                command: command.to_string(),
                message,
            }),
            None if command == "capture_screenshot" => {
                let data = base64::engine::general_purpose::STANDARD.encode(&*self.screenshot.lock());
                Ok(Value::String(format!("data:image/png;base64,{}", data)))
            }
            None => Ok(json!({"command": command, "args": args})),
        };
        self.leave(command);
        result
    }

    async fn evaluate(&self, script: &str) -> Result<Value, AppError> {
        let kind = script_kind(script).to_string();
        self.enter(&kind).await?;
        let selector = string_const(script, "selector");
        let result = self.run_script(&kind, selector, script);
        self.leave(&kind);
        result
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
