//! Unix socket lifecycle: bind, accept, remove

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionSettings};
use crate::router::Router;

/// How long to wait when probing an existing socket file
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// First accept retry delay
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot bind {}: {reason}", .path.display())]
    Bind { path: PathBuf, reason: String },

    #[error("accept failed {failures} times in a row: {source}")]
    AcceptFailed {
        failures: u32,
        #[source]
        source: io::Error,
    },
}

/// Bind the listening socket
///
/// A leftover socket file nobody answers on is removed and the bind retried
/// once. A live listener, or a path that is not a socket, is a bind error.
pub async fn bind(path: &Path) -> Result<UnixListener, TransportError> {
    let bind_error = |reason: String| TransportError::Bind {
        path: path.to_path_buf(),
        reason,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| bind_error(format!("cannot create parent directory: {}", e)))?;
        }
    }

    match UnixListener::bind(path) {
        Ok(listener) => return Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
        Err(e) => return Err(bind_error(e.to_string())),
    }

    let metadata = std::fs::symlink_metadata(path).map_err(|e| bind_error(e.to_string()))?;
    if !metadata.file_type().is_socket() {
        return Err(bind_error("path exists and is not a socket".into()));
    }

    match tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await {
        Ok(Ok(_)) => return Err(bind_error("another server is listening".into())),
        Ok(Err(e)) => debug!(path = %path.display(), error = %e, "Existing socket refused connection"),
        Err(_) => debug!(path = %path.display(), "Existing socket did not answer"),
    }

    warn!(path = %path.display(), "Removing stale socket file");
    std::fs::remove_file(path).map_err(|e| bind_error(format!("cannot remove stale socket: {}", e)))?;
    UnixListener::bind(path).map_err(|e| bind_error(e.to_string()))
}

/// Removes the socket file when dropped
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Socket file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove socket file"),
        }
    }
}

/// Capped exponential backoff for consecutive accept failures
#[derive(Debug)]
pub struct AcceptBackoff {
    current: Duration,
    max: Duration,
    failures: u32,
    max_failures: u32,
}

impl AcceptBackoff {
    pub fn new(max: Duration, max_failures: u32) -> Self {
        Self {
            current: INITIAL_BACKOFF.min(max),
            max,
            failures: 0,
            max_failures,
        }
    }

    /// Record a failure; `None` once the failure budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.max_failures {
            return None;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.current = INITIAL_BACKOFF.min(self.max);
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Accept clients until shutdown or repeated accept failure
///
/// On exit every connection is told to close and given the shutdown grace
/// period to flush before being aborted.
pub async fn accept_loop(
    listener: UnixListener,
    router: Arc<Router>,
    config: TransportConfig,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    let settings = ConnectionSettings::from(&config);
    let mut backoff = AcceptBackoff::new(config.accept_backoff_max(), config.accept_max_failures);
    let mut connections = JoinSet::new();

    let outcome = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    backoff.reset();
                    let connection = Connection::new(Arc::clone(&router), settings);
                    debug!(connection = %connection.id(), "Accepted client");
                    connections.spawn(connection.run(stream, shutdown_tx.subscribe()));
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(error = %e, failures = backoff.failures(), "Accept failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(error = %e, failures = backoff.failures(), "Accept failed too many times");
                        break Err(TransportError::AcceptFailed {
                            failures: backoff.failures(),
                            source: e,
                        });
                    }
                },
            },
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping accept loop");
                break Ok(());
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Connection task failed");
                }
            }
        }
    };

    drop(listener);
    let _ = shutdown_tx.send(());

    let grace = config.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            grace_ms = grace.as_millis() as u64,
            "Connections still open after grace period, aborting"
        );
        connections.abort_all();
    }

    outcome
}
