use anyhow::{Context, Result};
use common::{Command, Response, WallpaperError, WallpaperSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::geometry::ScreenGeometry;
use crate::lifecycle::{LifecycleCommand, LifecycleHandle};

pub async fn start(
    socket_path: PathBuf,
    lifecycle: LifecycleHandle,
    exit: Arc<AtomicBool>,
) -> Result<()> {
    // Remove old socket if it exists
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("Failed to remove stale socket {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    log::info!("IPC server listening on: {}", socket_path.display());

    loop {
        if exit.load(Ordering::Acquire) {
            break;
        }

        // Accept connections with timeout
        let accept_result =
            tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;

        match accept_result {
            Ok(Ok((stream, _addr))) => {
                let lifecycle = lifecycle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, lifecycle).await {
                        log::error!("Error handling client: {}", e);
                    }
                });
            }
            Ok(Err(e)) => {
                log::error!("Error accepting connection: {}", e);
            }
            Err(_) => {
                // Timeout, continue loop to check exit condition
                continue;
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    log::info!("IPC server stopped");
    Ok(())
}

async fn handle_client(stream: UnixStream, lifecycle: LifecycleHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Command>(&line) {
            Ok(command) => handle_command(command, &lifecycle).await,
            Err(e) => {
                log::warn!("Invalid command: {}", e);
                Response::Error(WallpaperError::Ipc(format!("Invalid command: {}", e)))
            }
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

/// Translate a wire command into a lifecycle request.
///
/// Returns the response directly when the command can be answered (or
/// rejected) without the engine.
pub fn to_lifecycle(command: Command) -> Result<LifecycleCommand, Response> {
    let request = match command {
        Command::Ping => return Err(Response::Pong),
        Command::SurfaceAcquired { width, height } => {
            LifecycleCommand::SurfaceAcquired(ScreenGeometry::new(width, height), None)
        }
        Command::SurfaceResized { width, height } => {
            LifecycleCommand::SurfaceResized(ScreenGeometry::new(width, height))
        }
        Command::VisibilityChanged { visible } => LifecycleCommand::Visibility(visible),
        Command::OffsetsChanged { x, y } => LifecycleCommand::Offsets { x, y },
        Command::SurfaceReleased => LifecycleCommand::SurfaceReleased,
        Command::Apply { name, path } => {
            validate_video_path(&path).map_err(Response::Error)?;
            LifecycleCommand::Apply(WallpaperSource::external(name, path))
        }
        Command::Query => LifecycleCommand::Query,
        Command::Snapshot { path } => {
            if !Path::new(&path).is_absolute() {
                return Err(Response::Error(WallpaperError::Ipc(format!(
                    "Snapshot path must be absolute: {}",
                    path
                ))));
            }
            LifecycleCommand::Snapshot(PathBuf::from(path))
        }
        Command::Kill => LifecycleCommand::Shutdown,
    };
    Ok(request)
}

async fn handle_command(command: Command, lifecycle: &LifecycleHandle) -> Response {
    log::debug!("Handling command: {:?}", command);

    match to_lifecycle(command) {
        Ok(LifecycleCommand::Shutdown) => {
            log::info!("Received kill command");
            lifecycle.request(LifecycleCommand::Shutdown).await
        }
        Ok(request) => lifecycle.request(request).await,
        Err(response) => response,
    }
}

fn validate_video_path(path: &str) -> Result<(), WallpaperError> {
    let path = Path::new(path);
    if !path.is_absolute() {
        return Err(WallpaperError::Ipc(format!(
            "Wallpaper path must be absolute: {}",
            path.display()
        )));
    }
    if !path.exists() {
        return Err(WallpaperError::NotFound(format!(
            "Wallpaper file not found: {}",
            path.display()
        )));
    }
    Ok(())
}
