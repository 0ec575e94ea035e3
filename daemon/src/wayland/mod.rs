//! Wayland compositor integration
//!
//! Maps one wlr-layer-shell background surface and forwards its lifecycle to
//! the engine. The renderer presents straight into that surface.
//! - outputs: layer surface creation and release
//! - event_handlers: Wayland protocol event handlers

mod event_handlers;
mod outputs;

use anyhow::{Context, Result};
use smithay_client_toolkit::{
    compositor::CompositorState,
    output::OutputState,
    registry::RegistryState,
    shell::wlr_layer::{LayerShell, LayerSurface},
};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wayland_client::{Connection, EventQueue, globals::registry_queue_init, protocol::wl_output};

use crate::host::SurfaceTracker;
use crate::lifecycle::LifecycleHandle;

/// How long the host waits for compositor events before checking `exit`
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Host state driven by the Wayland event queue
pub(crate) struct WallpaperHost {
    registry_state: RegistryState,
    compositor_state: CompositorState,
    layer_shell: LayerShell,
    output_state: OutputState,
    connection: Connection,
    lifecycle: LifecycleHandle,
    tracker: SurfaceTracker,
    layer: Option<LayerSurface>,
    output: Option<wl_output::WlOutput>,
}

/// Connect to the compositor and run the host on its own thread.
///
/// Returns `Ok(None)` when there is no compositor or it lacks layer shell
/// support; the engine then only receives surfaces over IPC.
pub fn spawn_host(
    lifecycle: LifecycleHandle,
    exit: Arc<AtomicBool>,
) -> Result<Option<JoinHandle<()>>> {
    let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

    let handle = thread::Builder::new()
        .name("vidwall-wayland".into())
        .spawn(move || {
            let (mut host, mut event_queue) = match connect(lifecycle) {
                Ok(connected) => {
                    let _ = ready_tx.send(Ok(()));
                    connected
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = run(&mut host, &mut event_queue, &exit) {
                log::error!("Wayland host stopped: {:#}", e);
            }
            host.release_layer();
            log::info!("Wayland host stopped");
        })
        .context("Failed to spawn Wayland host thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Some(handle)),
        Ok(Err(e)) => {
            log::warn!("No layer shell surface ({:#}), waiting for IPC surfaces", e);
            let _ = handle.join();
            Ok(None)
        }
        Err(_) => {
            let _ = handle.join();
            anyhow::bail!("Wayland host thread exited during setup")
        }
    }
}

fn connect(lifecycle: LifecycleHandle) -> Result<(WallpaperHost, EventQueue<WallpaperHost>)> {
    log::info!("Connecting to Wayland compositor...");
    let connection = Connection::connect_to_env().context("Cannot connect to the compositor")?;
    let (globals, mut event_queue) = registry_queue_init(&connection)?;
    let qh = event_queue.handle();

    let mut host = WallpaperHost {
        registry_state: RegistryState::new(&globals),
        compositor_state: CompositorState::bind(&globals, &qh)
            .context("wl_compositor not available")?,
        layer_shell: LayerShell::bind(&globals, &qh).context("wlr-layer-shell not available")?,
        output_state: OutputState::new(&globals, &qh),
        connection,
        lifecycle,
        tracker: SurfaceTracker::new(),
        layer: None,
        output: None,
    };

    // new_output creates the layer surface during this roundtrip.
    event_queue.roundtrip(&mut host)?;
    log::info!(
        "Connected to Wayland compositor, {} output(s)",
        host.output_state.outputs().count()
    );

    Ok((host, event_queue))
}

fn run(
    host: &mut WallpaperHost,
    event_queue: &mut EventQueue<WallpaperHost>,
    exit: &AtomicBool,
) -> Result<()> {
    while !exit.load(Ordering::Acquire) {
        event_queue.dispatch_pending(host)?;
        event_queue.flush()?;

        // Events already queued are handled on the next pass.
        let Some(guard) = event_queue.prepare_read() else {
            continue;
        };
        if wait_readable(guard.connection_fd(), POLL_TIMEOUT)? {
            guard.read()?;
        }
    }
    Ok(())
}

/// Wait until `fd` has data or `timeout` passes.
fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: `pollfd` is a single valid entry that outlives the call.
    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ready > 0)
}
