use common::Response;
use smithay_client_toolkit::shell::{
    WaylandSurface,
    wlr_layer::{Anchor, KeyboardInteractivity, Layer, LayerSurface},
};
use std::ffi::c_void;
use std::ptr::NonNull;
use wayland_client::{Proxy, QueueHandle, protocol::wl_output};

use super::WallpaperHost;
use crate::lifecycle::LifecycleCommand;
use crate::render::HostSurface;

impl WallpaperHost {
    /// Map the wallpaper on `output`. Only one output is covered.
    pub(super) fn create_layer_surface(
        &mut self,
        output: wl_output::WlOutput,
        qh: &QueueHandle<Self>,
    ) {
        if self.layer.is_some() {
            log::debug!("Wallpaper already mapped, ignoring extra output");
            return;
        }

        let surface = self.compositor_state.create_surface(qh);
        let layer_surface = self.layer_shell.create_layer_surface(
            qh,
            surface,
            Layer::Background,
            Some("vidwall"),
            Some(&output),
        );

        layer_surface.set_anchor(Anchor::all());
        layer_surface.set_exclusive_zone(-1);
        layer_surface.set_keyboard_interactivity(KeyboardInteractivity::None);
        layer_surface.commit();

        log::info!("Created layer surface");
        self.layer = Some(layer_surface);
        self.output = Some(output);
    }

    /// Native handles the renderer presents to.
    pub(super) fn host_surface(&self, layer: &LayerSurface) -> Option<HostSurface> {
        let display = self.connection.backend().display_ptr() as *mut c_void;
        let surface = layer.wl_surface().id().as_ptr() as *mut c_void;
        Some(HostSurface {
            display: NonNull::new(display)?,
            surface: NonNull::new(surface)?,
        })
    }

    /// Tell the engine to let go of the surface, then destroy it. The engine
    /// answers only after its GPU surface is gone.
    pub(super) fn release_layer(&mut self) {
        if let Some(command) = self.tracker.closed() {
            self.send(command);
        }
        if self.layer.take().is_some() {
            log::info!("Destroyed layer surface");
        }
        self.output = None;
    }

    pub(super) fn send(&self, command: LifecycleCommand) {
        let name = format!("{command:?}");
        if let Response::Error(e) = self.lifecycle.request_blocking(command) {
            log::warn!("Engine rejected {}: {}", name, e);
        }
    }
}
