//! Threads that drive the controller.
//!
//! The lifecycle thread owns the [`RenderSurfaceController`] and handles one
//! [`LifecycleCommand`] at a time, servicing source events in between. The
//! render thread runs the [`DrawLoop`] at the configured frame rate.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use common::{Response, WallpaperError, WallpaperSource};
use tokio::sync::oneshot;

use crate::controller::{DrawLoop, RenderSurfaceController, SharedRenderState};
use crate::geometry::ScreenGeometry;
use crate::render::HostSurface;

/// How often source events are serviced when no command arrives
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Requests forwarded from the IPC server to the lifecycle thread
#[derive(Debug)]
pub enum LifecycleCommand {
    /// IPC hosts send no native surface and get offscreen rendering
    SurfaceAcquired(ScreenGeometry, Option<HostSurface>),
    SurfaceResized(ScreenGeometry),
    Visibility(bool),
    Offsets { x: f32, y: f32 },
    SurfaceReleased,
    Apply(WallpaperSource),
    Query,
    Snapshot(PathBuf),
    /// Release the surface and stop the thread
    Shutdown,
}

pub(crate) type Request = (LifecycleCommand, oneshot::Sender<Response>);

/// Sending side of the lifecycle thread
#[derive(Clone)]
pub struct LifecycleHandle {
    tx: mpsc::Sender<Request>,
}

impl LifecycleHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<Request>) -> Self {
        Self { tx }
    }

    fn send(&self, command: LifecycleCommand) -> Result<oneshot::Receiver<Response>, Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .map_err(|_| Response::Error(WallpaperError::Ipc("engine has stopped".to_string())))?;
        Ok(reply_rx)
    }

    /// Send a command and wait for its response.
    pub async fn request(&self, command: LifecycleCommand) -> Response {
        match self.send(command) {
            Ok(reply_rx) => reply_rx.await.unwrap_or_else(|_| dropped()),
            Err(response) => response,
        }
    }

    /// Like [`request`](Self::request), for threads outside the runtime.
    pub fn request_blocking(&self, command: LifecycleCommand) -> Response {
        match self.send(command) {
            Ok(reply_rx) => reply_rx.blocking_recv().unwrap_or_else(|_| dropped()),
            Err(response) => response,
        }
    }
}

fn dropped() -> Response {
    Response::Error(WallpaperError::Ipc("engine dropped the request".to_string()))
}

/// Spawn the lifecycle thread. It sets `exit` when it stops.
pub fn spawn_lifecycle(
    mut controller: RenderSurfaceController,
    exit: Arc<AtomicBool>,
) -> Result<(LifecycleHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<Request>();

    let handle = thread::Builder::new()
        .name("vidwall-lifecycle".into())
        .spawn(move || {
            loop {
                match rx.recv_timeout(EVENT_POLL_INTERVAL) {
                    Ok((LifecycleCommand::Shutdown, reply)) => {
                        controller.on_surface_released();
                        let _ = reply.send(Response::Ok);
                        break;
                    }
                    Ok((command, reply)) => {
                        let response = dispatch(&mut controller, command);
                        let _ = reply.send(response);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        controller.on_surface_released();
                        break;
                    }
                }

                if let Some(e) = controller.pump_events() {
                    log::error!("Wallpaper playback stopped: {e}");
                }
            }

            exit.store(true, Ordering::Release);
            log::info!("Lifecycle thread stopped");
        })
        .context("Failed to spawn lifecycle thread")?;

    Ok((LifecycleHandle { tx }, handle))
}

/// Apply one command to the controller.
pub fn dispatch(controller: &mut RenderSurfaceController, command: LifecycleCommand) -> Response {
    let result = match command {
        LifecycleCommand::SurfaceAcquired(screen, host) => {
            controller.on_surface_acquired(screen, host)
        }
        LifecycleCommand::SurfaceResized(screen) => controller.on_screen_resized(screen),
        LifecycleCommand::Visibility(visible) => {
            controller.on_visible(visible);
            Ok(())
        }
        LifecycleCommand::Offsets { x, y } => {
            controller.on_offset_changed(x, y);
            Ok(())
        }
        LifecycleCommand::SurfaceReleased => {
            controller.on_surface_released();
            Ok(())
        }
        LifecycleCommand::Apply(source) => controller.apply(source),
        LifecycleCommand::Query => return Response::Status(controller.status()),
        LifecycleCommand::Snapshot(path) => controller
            .snapshot()
            .and_then(|snapshot| snapshot.save_png(&path)),
        LifecycleCommand::Shutdown => {
            controller.on_surface_released();
            Ok(())
        }
    };

    match result {
        Ok(()) => Response::Ok,
        Err(e) => Response::Error(e.into()),
    }
}

/// Spawn the render thread, ticking every `interval` until `exit` is set.
pub fn spawn_render(
    shared: Arc<SharedRenderState>,
    interval: Duration,
    exit: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("vidwall-render".into())
        .spawn(move || {
            let mut draw_loop = DrawLoop::new(shared);
            log::info!(
                "Render thread started ({:.1} fps)",
                1.0 / interval.as_secs_f64()
            );

            while !exit.load(Ordering::Acquire) {
                let started = Instant::now();
                draw_loop.tick();
                if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                    thread::sleep(remaining);
                }
            }

            log::info!("Render thread stopped");
        })
        .context("Failed to spawn render thread")
}
