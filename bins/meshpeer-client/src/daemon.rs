//! Daemon mode for background operation

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use meshpeer_core::{MeshEngine, StatusReport};

use crate::client::MeshPeerClient;
use crate::config::ClientConfig;

/// Socket path for IPC
#[cfg(unix)]
const SOCKET_PATH: &str = "/tmp/meshpeer.sock";
#[cfg(windows)]
const SOCKET_PATH: &str = r"\\.\pipe\meshpeer";

/// IPC commands
#[derive(Debug, Clone, Serialize, Deserialize)]
enum IpcCommand {
    Status,
    Stop,
}

/// IPC responses
#[derive(Debug, Clone, Serialize, Deserialize)]
enum IpcResponse {
    Status(StatusReport),
    Ok,
    Error(String),
}

/// Run the client as a daemon
pub async fn run_daemon(config: ClientConfig) -> Result<()> {
    info!("Starting MeshPeer daemon...");

    let client = MeshPeerClient::new(config).await?;
    client.start().await?;

    let shutdown = Arc::new(Notify::new());
    let ipc_handle = tokio::spawn(run_ipc_server(client.engine(), shutdown.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = shutdown.notified() => info!("Stop requested over IPC"),
    }

    info!("Daemon shutting down...");
    client.stop().await?;
    ipc_handle.abort();

    #[cfg(unix)]
    let _ = std::fs::remove_file(SOCKET_PATH);

    Ok(())
}

/// Run the IPC server for receiving commands
#[allow(unused_variables)]
async fn run_ipc_server(engine: Arc<MeshEngine>, shutdown: Arc<Notify>) -> Result<()> {
    #[cfg(unix)]
    let _ = std::fs::remove_file(SOCKET_PATH);

    #[cfg(unix)]
    let listener = UnixListener::bind(SOCKET_PATH)?;

    info!("IPC server listening on {}", SOCKET_PATH);

    #[cfg(unix)]
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let engine = engine.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_ipc_connection(stream, engine, shutdown).await {
                        debug!("IPC connection ended: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("IPC accept error: {}", e);
            }
        }
    }

    #[cfg(windows)]
    {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[cfg(unix)]
async fn handle_ipc_connection(
    mut stream: UnixStream,
    engine: Arc<MeshEngine>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await?;

    if n == 0 {
        return Ok(());
    }

    let response = match serde_json::from_slice::<IpcCommand>(&buf[..n]) {
        Ok(command) => {
            debug!("IPC command: {:?}", command);
            match command {
                IpcCommand::Status => IpcResponse::Status(engine.status().await),
                IpcCommand::Stop => {
                    shutdown.notify_one();
                    IpcResponse::Ok
                }
            }
        }
        Err(e) => IpcResponse::Error(format!("bad command: {}", e)),
    };

    let response_bytes = serde_json::to_vec(&response)?;
    stream.write_all(&response_bytes).await?;
    stream.shutdown().await?;

    Ok(())
}

/// Send a command to the daemon
async fn send_command(command: IpcCommand) -> Result<IpcResponse> {
    #[cfg(unix)]
    {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = UnixStream::connect(SOCKET_PATH).await?;

        let command_bytes = serde_json::to_vec(&command)?;
        stream.write_all(&command_bytes).await?;

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;

        let response: IpcResponse = serde_json::from_slice(&buf)?;
        Ok(response)
    }

    #[cfg(windows)]
    {
        let _ = command;
        anyhow::bail!("Windows IPC not yet implemented")
    }
}

/// Get daemon status
pub async fn get_status() -> Result<StatusReport> {
    match send_command(IpcCommand::Status).await? {
        IpcResponse::Status(status) => Ok(status),
        IpcResponse::Error(e) => anyhow::bail!(e),
        _ => anyhow::bail!("Unexpected response"),
    }
}

/// Send stop signal to daemon
pub async fn send_stop_signal() -> Result<()> {
    match send_command(IpcCommand::Stop).await? {
        IpcResponse::Ok => Ok(()),
        IpcResponse::Error(e) => anyhow::bail!(e),
        _ => anyhow::bail!("Unexpected response"),
    }
}
