//! tether-server binary

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::codec::Framed;
use tracing::{error, info};

use tether_protocol::{methods, ClientCodec, CodecError, RequestEnvelope, ResponseEnvelope};
use tether_server::{AppConfig, ConfigLoader, HostCommand, ProcessApplication, ServerInstance};
use tether_utils::{LogConfig, Result, TetherError};

/// How long `--check` waits for the discovery round-trip
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(about = "Automation bridge for a running desktop application")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the XDG config location)
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path, overriding the one derived from the app name
    #[arg(long, env = "TETHER_SOCKET")]
    socket: Option<PathBuf>,

    /// Application name used for the default socket path
    #[arg(long, env = "TETHER_APP_NAME")]
    app_name: Option<String>,

    /// Directory screenshots are written under
    #[arg(long, env = "TETHER_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    /// Check that a server is live at the socket, then exit 0 or 1
    #[arg(long)]
    check: bool,

    /// Host application command, after `--`
    #[arg(last = true)]
    host: Vec<String>,
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from_path(path)?,
        None => ConfigLoader::load()?,
    };

    if let Some(app_name) = &args.app_name {
        config.server.app_name = app_name.clone();
    }
    if let Some(socket) = &args.socket {
        config.server.socket_path = Some(socket.clone());
    }
    if let Some(results_dir) = &args.results_dir {
        config.bridge.results_dir = Some(results_dir.clone());
    }
    if let Some((program, rest)) = args.host.split_first() {
        config.application.command = Some(program.clone());
        config.application.args = rest.to_vec();
    }

    ConfigLoader::validate(&config)?;
    Ok(config)
}

/// Send one discovery request and read its response
async fn probe(path: &Path) -> std::result::Result<ResponseEnvelope, CodecError> {
    let stream = UnixStream::connect(path).await?;
    let mut framed = Framed::new(stream, ClientCodec::new());
    framed
        .send(RequestEnvelope::new(1u64, methods::TOOLS_LIST, json!({})))
        .await?;
    match framed.next().await {
        Some(response) => response,
        None => Err(CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        ))),
    }
}

/// Operator liveness check: socket file exists and discovery succeeds
async fn check(path: &Path) -> bool {
    if !path.exists() {
        println!("not running: {} does not exist", path.display());
        return false;
    }

    match tokio::time::timeout(CHECK_TIMEOUT, probe(path)).await {
        Ok(Ok(response)) => match response.into_result() {
            Ok(tools) => {
                let count = tools.as_array().map(Vec::len).unwrap_or(0);
                println!("ok: {} tools at {}", count, path.display());
                true
            }
            Err(e) => {
                println!("unhealthy: discovery failed: {}", e);
                false
            }
        },
        Ok(Err(e)) => {
            println!("not running: {}", e);
            false
        }
        Err(_) => {
            println!(
                "unhealthy: no discovery response within {}s",
                CHECK_TIMEOUT.as_secs()
            );
            false
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let host = HostCommand::from_config(&config.application).ok_or_else(|| {
        TetherError::config("no host application command: pass it after `--` or set [application].command")
    })?;
    info!(program = %host.program, "Starting tether server");

    let app = Arc::new(ProcessApplication::new(host));
    let server = ServerInstance::start(&config, app)
        .await
        .map_err(|e| TetherError::application(e.to_string()))?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let outcome = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            Ok(())
        }
        result = server.wait() => {
            result.map_err(|e| TetherError::internal(e.to_string()))
        }
    };

    if let Err(e) = server.stop().await {
        error!(error = %e, "Error during shutdown");
    }
    outcome
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tether-server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.check {
        let path = config.server.resolved_socket_path();
        return if check(&path).await {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    if let Err(e) = tether_utils::init_logging_with_config(LogConfig::server()) {
        eprintln!("tether-server: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => {
            info!("tether server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "tether server failed");
            ExitCode::FAILURE
        }
    }
}
