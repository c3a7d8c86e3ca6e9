//! Server instance lifecycle
//!
//! A [`ServerInstance`] owns everything process-wide: the socket file, the
//! accept loop, the bridge and its serialization lock. Nothing lives in
//! globals, so tests can run several instances on separate temp paths.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::{AppError, Application};
use crate::bridge::{BridgeSettings, CommandBridge};
use crate::config::AppConfig;
use crate::registry::{RegistryError, ToolRegistry};
use crate::router::Router;
use crate::transport::{self, SocketGuard, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Application(#[from] AppError),

    #[error("accept loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

type AcceptTask = JoinHandle<Result<(), TransportError>>;

/// A running bridge server bound to one socket path
pub struct ServerInstance {
    path: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Mutex<Option<AcceptTask>>,
    socket: parking_lot::Mutex<Option<SocketGuard>>,
    bridge: Arc<CommandBridge>,
    stopped: AtomicBool,
}

impl ServerInstance {
    /// Start with the built-in tool catalog
    pub async fn start(config: &AppConfig, app: Arc<dyn Application>) -> Result<Self, ServerError> {
        let registry = ToolRegistry::with_builtins()?;
        Self::start_with_registry(config, app, registry).await
    }

    /// Start the application, bind the socket and begin accepting clients
    pub async fn start_with_registry(
        config: &AppConfig,
        app: Arc<dyn Application>,
        registry: ToolRegistry,
    ) -> Result<Self, ServerError> {
        let path = config.server.resolved_socket_path();

        app.start().await?;

        let listener = match transport::bind(&path).await {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(stop_err) = app.stop().await {
                    warn!(error = %stop_err, "Failed to stop application after bind failure");
                }
                return Err(e.into());
            }
        };
        let socket = SocketGuard::new(&path);

        let tools = registry.len();
        let bridge = Arc::new(CommandBridge::new(app, BridgeSettings::from(&config.bridge)));
        let router = Arc::new(Router::new(Arc::new(registry), Arc::clone(&bridge)));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let accept_task = tokio::spawn(transport::accept_loop(
            listener,
            router,
            config.transport.clone(),
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        info!(
            path = %path.display(),
            tools,
            results_dir = %bridge.settings().results_dir.display(),
            "Server listening"
        );

        Ok(Self {
            path,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
            socket: parking_lot::Mutex::new(Some(socket)),
            bridge,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bridge(&self) -> &Arc<CommandBridge> {
        &self.bridge
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolve when the accept loop ends, with its outcome
    ///
    /// Returns immediately once the loop has already been reaped.
    pub async fn wait(&self) -> Result<(), ServerError> {
        let mut task = self.accept_task.lock().await;
        let Some(handle) = task.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        *task = None;
        joined?.map_err(ServerError::from)
    }

    /// Stop accepting, close connections, remove the socket, stop the app
    ///
    /// Idempotent: later calls return `Ok(())` without doing anything.
    pub async fn stop(&self) -> Result<(), ServerError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(path = %self.path.display(), "Stopping server");

        let _ = self.shutdown_tx.send(());
        let handle = self.accept_task.lock().await.take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Accept loop ended with an error"),
                Err(e) => warn!(error = %e, "Accept loop task failed"),
            }
        }

        self.socket.lock().take();
        self.bridge.application().stop().await?;

        info!("Server stopped");
        Ok(())
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        if let Ok(mut task) = self.accept_task.try_lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        // The socket guard removes the file as the struct is dropped
    }
}
