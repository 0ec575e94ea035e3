mod bridge;
mod config;
mod controller;
mod crop;
mod error;
mod geometry;
mod gpu;
#[cfg_attr(not(feature = "wayland"), allow(dead_code))]
mod host;
mod ipc_server;
mod lifecycle;
mod macros;
mod render;
mod store;
mod video;
#[cfg(feature = "wayland")]
mod wayland;

use anyhow::Result;
use common::WallpaperSource;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::controller::{RenderSurfaceController, SharedRenderState};
use crate::lifecycle::LifecycleCommand;
use crate::store::JsonSelectionStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging depends on the config, so errors are reported once it is up.
    let loaded = config::Config::load();
    let log_level = loaded
        .as_ref()
        .map(|cfg| cfg.general.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("Starting vidwall daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            log::warn!("Failed to load config: {:#}. Using defaults.", e);
            if let Ok(path) = config::Config::default_config_path() {
                log::info!("Config is read from {}", path.display());
            }
            config::Config::default()
        }
    };

    log::info!("  Playback settings:");
    log::info!(
        "    - Audio: {}",
        if config.playback.muted {
            "muted".to_string()
        } else {
            format!("volume {:.2}", config.playback.volume)
        }
    );
    log::info!("    - Max fps: {}", config.playback.max_fps);
    log::info!(
        "    - Parallax: {}",
        if config.playback.parallax_enabled() {
            "yes"
        } else {
            "no"
        }
    );
    log::info!(
        "    - Layer shell: {}",
        if config.general.layer_shell {
            "yes"
        } else {
            "no (IPC surfaces only)"
        }
    );
    log::info!(
        "  Default wallpaper: {}",
        config.source.default_wallpaper.display()
    );

    let state_file = config.source.state_file_path()?;
    log::info!("  Selection file: {}", state_file.display());
    let store = Arc::new(JsonSelectionStore::open(state_file));

    let default_source = WallpaperSource::bundled(
        "Default",
        config.source.default_wallpaper.to_string_lossy(),
    );

    #[cfg(not(feature = "gpu"))]
    log::warn!("GPU rendering not compiled (build with --features gpu to enable)");
    #[cfg(not(feature = "video"))]
    log::warn!("Video decoding not compiled (build with --features video to enable)");
    #[cfg(not(feature = "wayland"))]
    log::warn!("Wayland host not compiled (build with --features wayland to enable)");

    let shared = SharedRenderState::new();
    let controller = RenderSurfaceController::new(
        config.playback.clone(),
        default_source,
        store,
        Arc::new(video::GstSourceFactory::new(config.playback.clone())),
        Arc::new(gpu::WgpuBackendFactory::new(config.gpu.clone())),
        Arc::clone(&shared),
    );

    let exit = Arc::new(AtomicBool::new(false));
    let (lifecycle, lifecycle_thread) =
        lifecycle::spawn_lifecycle(controller, Arc::clone(&exit))?;
    let render_thread = lifecycle::spawn_render(
        shared,
        config.playback.frame_interval(),
        Arc::clone(&exit),
    )?;

    #[cfg(feature = "wayland")]
    let host_thread = if config.general.layer_shell {
        wayland::spawn_host(lifecycle.clone(), Arc::clone(&exit))?
    } else {
        None
    };

    // Start IPC server
    let ipc_lifecycle = lifecycle.clone();
    let ipc_exit = Arc::clone(&exit);
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server::start(common::get_socket_path(), ipc_lifecycle, ipc_exit).await
        {
            log::error!("IPC server error: {:#}", e);
        }
    });

    // Set up signal handlers
    let signal_lifecycle = lifecycle.clone();
    let signal_exit = Arc::clone(&exit);
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Failed to set up signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
            }
        }

        // Release the surface before anything is torn down.
        signal_lifecycle.request(LifecycleCommand::Shutdown).await;
        signal_exit.store(true, Ordering::Release);
    });

    if let Err(e) = ipc_handle.await {
        log::error!("IPC server task failed: {}", e);
    }

    // The IPC server can also stop on a bind error; make sure the engine follows.
    if !exit.load(Ordering::Acquire) {
        lifecycle.request(LifecycleCommand::Shutdown).await;
        exit.store(true, Ordering::Release);
    }
    drop(lifecycle);

    #[allow(unused_mut)]
    let mut threads = vec![("lifecycle", lifecycle_thread), ("render", render_thread)];
    #[cfg(feature = "wayland")]
    threads.extend(host_thread.map(|handle| ("wayland", handle)));

    for (name, handle) in threads {
        if handle.join().is_err() {
            log::error!("The {} thread panicked", name);
        }
    }

    log::info!("Daemon shutting down");
    Ok(())
}
