use smithay_client_toolkit::{
    compositor::CompositorHandler,
    delegate_compositor, delegate_layer, delegate_output, delegate_registry,
    output::{OutputHandler, OutputState},
    registry::ProvidesRegistryState,
    registry_handlers,
    shell::{
        WaylandSurface,
        wlr_layer::{LayerShellHandler, LayerSurface, LayerSurfaceConfigure},
    },
};
use wayland_client::{
    Connection, QueueHandle,
    protocol::{wl_output, wl_surface},
};

use super::WallpaperHost;

impl CompositorHandler for WallpaperHost {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_factor: i32,
    ) {
        // Rendered at logical size
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
        // The render thread paces itself
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for WallpaperHost {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        log::info!("New output detected");
        self.create_layer_surface(output, qh);
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        if let Some(info) = self.output_state.info(&output) {
            log::debug!(
                "Output updated: {:?} - {}x{} @ {}",
                info.name,
                info.logical_size.map(|(w, _)| w).unwrap_or(0),
                info.logical_size.map(|(_, h)| h).unwrap_or(0),
                info.scale_factor,
            );
        }
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        log::info!("Output destroyed");
        if self.output.as_ref() != Some(&output) {
            return;
        }
        self.release_layer();

        // Move to another output if one is left.
        let next = self.output_state.outputs().find(|o| *o != output);
        if let Some(next) = next {
            self.create_layer_surface(next, qh);
        }
    }
}

impl LayerShellHandler for WallpaperHost {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _layer: &LayerSurface) {
        log::info!("Layer surface closed");
        self.release_layer();
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        if self.layer.as_ref() != Some(layer) {
            return;
        }
        let (width, height) = configure.new_size;
        log::info!("Layer surface configured: {}x{}", width, height);

        let Some(host) = self.host_surface(layer) else {
            log::error!("Layer surface has no native handle");
            return;
        };
        for command in self.tracker.configure(width, height, host) {
            self.send(command);
        }
        layer.wl_surface().commit();
    }
}

impl ProvidesRegistryState for WallpaperHost {
    fn registry(&mut self) -> &mut smithay_client_toolkit::registry::RegistryState {
        &mut self.registry_state
    }

    registry_handlers![OutputState];
}

delegate_compositor!(WallpaperHost);
delegate_output!(WallpaperHost);
delegate_layer!(WallpaperHost);
delegate_registry!(WallpaperHost);
