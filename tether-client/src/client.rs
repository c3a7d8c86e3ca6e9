//! Bridge client connection

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use tether_protocol::types::{
    ExecuteJsParams, InvokeCommandParams, SendTextToElementParams, TakeScreenshotParams,
    TextInputParams, EXECUTE_JS, GET_DOM, INVOKE_COMMAND, SEND_TEXT_TO_ELEMENT, TAKE_SCREENSHOT,
    TEXT_INPUT,
};
use tether_protocol::{
    methods, ClientCodec, ElementAction, RequestEnvelope, RequestId, ResponseEnvelope,
    ScreenshotResult, ToolInfo,
};

use crate::error::ClientError;

/// Per-call timeout unless overridden
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ResponseEnvelope>>>>;
type Writer = Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, ClientCodec>>>;

/// Shared handles on one live connection
#[derive(Clone)]
struct Link {
    writer: Writer,
    pending: Pending,
    alive: Arc<AtomicBool>,
}

struct Session {
    link: Link,
    reader: JoinHandle<()>,
}

/// Drops a pending entry when its caller stops waiting
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Fails every waiter once the reader task ends, including by abort
struct ReaderExit {
    pending: Pending,
    alive: Arc<AtomicBool>,
}

impl Drop for ReaderExit {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with ConnectionLost
        self.pending.lock().clear();
    }
}

/// Client for a tether bridge socket
///
/// `invoke` takes `&self`, so one client can be shared across tasks behind
/// an `Arc`.
pub struct BridgeClient {
    path: PathBuf,
    next_id: AtomicU64,
    call_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl BridgeClient {
    /// Connect to the bridge listening at `path`
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref().to_path_buf();
        let session = open(&path).await?;
        Ok(Self {
            path,
            next_id: AtomicU64::new(1),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            session: Mutex::new(Some(session)),
        })
    }

    /// Connect to the default socket for an application name
    pub async fn connect_app(app_name: &str) -> Result<Self, ClientError> {
        Self::connect(tether_utils::default_socket_path(app_name)).await
    }

    /// Set the timeout used by [`invoke`](Self::invoke)
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Whether the connection's reader is still running
    pub fn is_connected(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.link.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Close the connection; pending calls fail with `ConnectionLost`
    pub async fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.reader.abort();
            let mut writer = session.link.writer.lock().await;
            if let Err(e) = writer.close().await {
                debug!(error = %e, "Error closing connection");
            }
            debug!(path = %self.path.display(), "Disconnected");
        }
    }

    /// Drop the current connection and connect again to the same path
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.disconnect().await;
        let session = open(&self.path).await?;
        *self.session.lock() = Some(session);
        debug!(path = %self.path.display(), "Reconnected");
        Ok(())
    }

    fn link(&self) -> Result<Link, ClientError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.link.clone())
            .ok_or(ClientError::NotConnected)
    }

    /// Call a method with the default timeout
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.invoke_with_timeout(method, params, self.call_timeout)
            .await
    }

    /// Call a method, racing its response against `timeout`
    ///
    /// A response arriving after the timeout is discarded.
    pub async fn invoke_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let link = self.link()?;
        if !link.alive.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionLost);
        }

        let id = RequestId::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        link.pending.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &link.pending,
            id: id.clone(),
        };

        // The reader may have exited between the check and the insert
        if !link.alive.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionLost);
        }

        // The write counts against the deadline too: a server that stopped
        // reading must not stall the caller past it.
        let request = RequestEnvelope::new(id, method, params);
        let exchange = async {
            link.writer.lock().await.send(request).await?;
            rx.await.map_err(|_| ClientError::ConnectionLost)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(response) => Ok(response?.into_result()?),
            Err(_) => Err(ClientError::Timeout {
                method: method.to_string(),
                after: timeout,
            }),
        }
    }

    async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<T, ClientError> {
        let params = serde_json::to_value(params).map_err(|e| ClientError::Codec(e.into()))?;
        let result = self.invoke(method, params).await?;
        serde_json::from_value(result).map_err(|e| ClientError::Codec(e.into()))
    }

    /// Discovery listing
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, ClientError> {
        self.call(methods::TOOLS_LIST, json!({})).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.invoke(methods::PING, json!({})).await.map(|_| ())
    }

    pub async fn take_screenshot(
        &self,
        filename: &str,
        encoded: bool,
    ) -> Result<ScreenshotResult, ClientError> {
        let params = TakeScreenshotParams {
            filename: filename.to_string(),
            encoded,
            ..Default::default()
        };
        self.call(TAKE_SCREENSHOT, params).await
    }

    pub async fn get_dom(&self) -> Result<String, ClientError> {
        self.call(GET_DOM, json!({})).await
    }

    pub async fn execute_js(&self, code: &str) -> Result<Value, ClientError> {
        let params = ExecuteJsParams {
            code: code.to_string(),
        };
        self.call(EXECUTE_JS, params).await
    }

    pub async fn text_input(
        &self,
        text: &str,
        selector: Option<&str>,
        clear_field_first: bool,
    ) -> Result<Value, ClientError> {
        let params = TextInputParams {
            text: text.to_string(),
            selector: selector.map(str::to_string),
            clear_field_first,
        };
        self.call(TEXT_INPUT, params).await
    }

    pub async fn send_text_to_element(
        &self,
        selector: &str,
        action: ElementAction,
        text: Option<&str>,
        wait_for_element: bool,
    ) -> Result<Value, ClientError> {
        let params = SendTextToElementParams {
            selector: selector.to_string(),
            action,
            wait_for_element,
            text: text.map(str::to_string),
        };
        self.call(SEND_TEXT_TO_ELEMENT, params).await
    }

    pub async fn invoke_command(&self, command: &str, args: Value) -> Result<Value, ClientError> {
        let params = InvokeCommandParams {
            command: command.to_string(),
            args,
        };
        self.call(INVOKE_COMMAND, params).await
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.reader.abort();
        }
    }
}

async fn open(path: &Path) -> Result<Session, ClientError> {
    if !path.exists() {
        return Err(ClientError::ServerNotRunning {
            path: path.to_path_buf(),
        });
    }

    let stream = UnixStream::connect(path)
        .await
        .map_err(ClientError::Connect)?;
    let (read, write) = stream.into_split();

    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let alive = Arc::new(AtomicBool::new(true));
    let exit = ReaderExit {
        pending: Arc::clone(&pending),
        alive: Arc::clone(&alive),
    };
    let reader = tokio::spawn(read_responses(read, exit));

    debug!(path = %path.display(), "Connected");
    Ok(Session {
        link: Link {
            writer: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                write,
                ClientCodec::new(),
            ))),
            pending,
            alive,
        },
        reader,
    })
}

/// Route responses to their waiters until the stream ends
async fn read_responses(read: OwnedReadHalf, exit: ReaderExit) {
    let mut frames = FramedRead::new(read, ClientCodec::new());

    loop {
        match frames.next().await {
            Some(Ok(response)) => {
                let Some(id) = response.id.clone() else {
                    warn!(response = ?response, "Uncorrelated response from server");
                    continue;
                };
                let waiter = exit.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = %id, "Discarding response nobody is waiting for"),
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read response, closing connection");
                break;
            }
            None => {
                debug!("Server closed connection");
                break;
            }
        }
    }
    drop(exit);
}
