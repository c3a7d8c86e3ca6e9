//! Host-process application adapter
//!
//! The host is a child process speaking newline-delimited JSON on
//! stdin/stdout:
//!
//! ```text
//! -> {"op":"invoke","id":1,"command":"capture_screenshot","args":{}}
//! -> {"op":"eval","id":2,"script":"document.title"}
//! <- {"id":1,"ok":"iVBORw0KGgo..."}
//! <- {"id":2,"error":"ReferenceError: foo is not defined"}
//! ```
//!
//! Replies may arrive in any order. When the host's stdout closes every
//! pending call fails with `Unreachable`, as does every later call.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use tether_protocol::MAX_FRAME_SIZE;

use super::{AppError, Application};
use crate::config::ApplicationConfig;

/// How to launch the host process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build from the `[application]` config section, if a command is set
    pub fn from_config(config: &ApplicationConfig) -> Option<Self> {
        let program = config.command.clone()?;
        Some(Self {
            program,
            args: config.args.clone(),
            env: config.env.clone(),
        })
    }
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum HostRequest<'a> {
    Invoke {
        id: u64,
        command: &'a str,
        args: &'a Value,
    },
    Eval {
        id: u64,
        script: &'a str,
    },
}

type Reply = Result<Value, String>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Removes a pending entry when the waiting call goes away (timeout, cancel)
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// [`Application`] backed by a child process
pub struct ProcessApplication {
    command: HostCommand,
    next_id: AtomicU64,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    process: tokio::sync::Mutex<Option<(Child, JoinHandle<()>)>>,
}

impl ProcessApplication {
    pub fn new(command: HostCommand) -> Self {
        Self {
            command,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            alive: Arc::new(AtomicBool::new(false)),
            stdin: tokio::sync::Mutex::new(None),
            process: tokio::sync::Mutex::new(None),
        }
    }

    pub fn command(&self) -> &HostCommand {
        &self.command
    }

    async fn round_trip(&self, id: u64, line: String) -> Result<Reply, AppError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(AppError::unreachable("host process is not running"));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // The reader may have drained the map between the check and the insert
        if !self.alive.load(Ordering::SeqCst) {
            return Err(AppError::unreachable("host process exited"));
        }

        {
            let mut stdin = self.stdin.lock().await;
            let writer = stdin
                .as_mut()
                .ok_or_else(|| AppError::unreachable("host process is not running"))?;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(|e| AppError::unreachable(format!("write to host failed: {}", e)))?;
            writer
                .flush()
                .await
                .map_err(|e| AppError::unreachable(format!("write to host failed: {}", e)))?;
        }

        rx.await
            .map_err(|_| AppError::unreachable("host process exited"))
    }

    fn encode(request: &HostRequest<'_>) -> Result<String, AppError> {
        let mut line =
            serde_json::to_string(request).map_err(|e| AppError::Protocol(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

#[async_trait]
impl Application for ProcessApplication {
    async fn start(&self) -> Result<(), AppError> {
        let mut process = self.process.lock().await;
        if process.is_some() && self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Reap a previous instance that died on its own
        if let Some((mut child, reader)) = process.take() {
            let _ = child.kill().await;
            reader.abort();
        }

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(&self.command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::unreachable(format!(
                    "failed to launch {}: {}",
                    self.command.program, e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::unreachable("host stdout unavailable"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::unreachable("host stdin unavailable"))?;

        self.alive.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_replies(
            stdout,
            Arc::clone(&self.pending),
            Arc::clone(&self.alive),
        ));
        *self.stdin.lock().await = Some(stdin);

        info!(
            program = %self.command.program,
            pid = ?child.id(),
            "Host process started"
        );
        *process = Some((child, reader));
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        let mut process = self.process.lock().await;
        self.alive.store(false, Ordering::SeqCst);
        self.stdin.lock().await.take();

        if let Some((mut child, reader)) = process.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill host process: {}", e);
            }
            reader.abort();
            info!(program = %self.command.program, "Host process stopped");
        }

        self.pending.lock().clear();
        Ok(())
    }

    async fn invoke(&self, command: &str, args: Value) -> Result<Value, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = Self::encode(&HostRequest::Invoke {
            id,
            command,
            args: &args,
        })?;

        debug!(id, command, "Invoking host command");
        self.round_trip(id, line)
            .await?
            .map_err(|message| AppError::CommandFailed {
                command: command.to_string(),
                message,
            })
    }

    async fn evaluate(&self, script: &str) -> Result<Value, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = Self::encode(&HostRequest::Eval { id, script })?;

        debug!(id, len = script.len(), "Evaluating script in host");
        self.round_trip(id, line)
            .await?
            .map_err(AppError::ScriptFailed)
    }

    fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Route host replies to their waiting calls until stdout closes
async fn read_replies(stdout: ChildStdout, pending: PendingMap, alive: Arc<AtomicBool>) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_SIZE));

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read from host process: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_reply(&line) {
            Ok((id, reply)) => match pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => debug!(id, "Dropping host reply with no waiting call"),
            },
            Err(e) => warn!("Ignoring malformed host output: {}", e),
        }
    }

    alive.store(false, Ordering::SeqCst);
    pending.lock().clear();
    info!("Host process closed its output");
}

fn parse_reply(line: &str) -> Result<(u64, Reply), String> {
    let value: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| "reply has no numeric id".to_string())?;

    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        let message = err
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Ok((id, Err(message)));
    }

    Ok((id, Ok(value.get("ok").cloned().unwrap_or(Value::Null))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Host that answers every request with `ok` set to the given JSON
    fn echo_host(ok: &str) -> HostCommand {
        let script = format!(
            r#"while read -r line; do id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/'); printf '{{"id":%s,"ok":{}}}\n' "$id"; done"#,
            ok
        );
        HostCommand::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_request_wire_format() {
        let args = json!({"a": 1});
        let line = ProcessApplication::encode(&HostRequest::Invoke {
            id: 3,
            command: "save",
            args: &args,
        })
        .unwrap();
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value, json!({"op": "invoke", "id": 3, "command": "save", "args": {"a": 1}}));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply(r#"{"id":1,"ok":"x"}"#).unwrap(), (1, Ok(json!("x"))));
        assert_eq!(parse_reply(r#"{"id":2}"#).unwrap(), (2, Ok(Value::Null)));
        assert_eq!(
            parse_reply(r#"{"id":3,"error":"boom"}"#).unwrap(),
            (3, Err("boom".to_string()))
        );
        assert_eq!(
            parse_reply(r#"{"id":4,"ok":1,"error":null}"#).unwrap(),
            (4, Ok(json!(1)))
        );
        assert!(parse_reply(r#"{"ok":1}"#).is_err());
        assert!(parse_reply("garbage").is_err());
    }

    #[test]
    fn test_host_command_from_config() {
        let mut config = ApplicationConfig::default();
        assert!(HostCommand::from_config(&config).is_none());

        config.command = Some("/usr/bin/host".into());
        config.args = vec!["--e2e".into()];
        let command = HostCommand::from_config(&config).unwrap();
        assert_eq!(command.program, "/usr/bin/host");
        assert_eq!(command.args, vec!["--e2e".to_string()]);
    }

    #[tokio::test]
    async fn test_call_before_start_is_unreachable() {
        let app = ProcessApplication::new(echo_host("1"));
        let result = app.invoke("anything", json!({})).await;
        assert!(matches!(result, Err(AppError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_launch_failure_is_unreachable() {
        let app = ProcessApplication::new(HostCommand::new("/nonexistent/tether-host"));
        assert!(matches!(app.start().await, Err(AppError::Unreachable(_))));
        assert!(!app.is_running());
    }

    #[tokio::test]
    async fn test_invoke_and_evaluate_round_trip() {
        let app = ProcessApplication::new(echo_host(r#""pong""#));
        app.start().await.unwrap();
        assert!(app.is_running());

        assert_eq!(app.invoke("ping", json!({})).await.unwrap(), json!("pong"));
        assert_eq!(app.evaluate("1 + 1").await.unwrap(), json!("pong"));

        app.stop().await.unwrap();
        assert!(!app.is_running());
    }

    #[tokio::test]
    async fn test_error_reply_maps_by_operation() {
        let script = r#"while read -r line; do id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/'); printf '{"id":%s,"error":"boom"}\n' "$id"; done"#;
        let app = ProcessApplication::new(HostCommand::new("sh").arg("-c").arg(script));
        app.start().await.unwrap();

        match app.invoke("save", json!({})).await {
            Err(AppError::CommandFailed { command, message }) => {
                assert_eq!(command, "save");
                assert_eq!(message, "boom");
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
        assert_eq!(
            app.evaluate("throw 1").await,
            Err(AppError::ScriptFailed("boom".into()))
        );

        app.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_host_exit_fails_pending_and_later_calls() {
        // Reads one request and exits without answering
        let app = ProcessApplication::new(HostCommand::new("sh").arg("-c").arg("read -r line; exit 0"));
        app.start().await.unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            app.evaluate("document.title"),
        )
        .await
        .expect("call must not hang after host exit");
        assert!(matches!(result, Err(AppError::Unreachable(_))));

        // Give the reader a moment to observe EOF if the write raced it
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(matches!(
            app.invoke("save", json!({})).await,
            Err(AppError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop_idempotent() {
        let app = ProcessApplication::new(echo_host("true"));
        app.start().await.unwrap();
        app.start().await.unwrap();
        app.stop().await.unwrap();
        app.stop().await.unwrap();
        assert!(matches!(
            app.invoke("x", json!({})).await,
            Err(AppError::Unreachable(_))
        ));
    }
}
