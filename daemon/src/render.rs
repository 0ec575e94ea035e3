//! Render backend interface.
//!
//! One implementation is picked at engine creation from the capability probe.
//! Backends are driven from the render thread only, except for construction
//! and [`RenderBackend::release`], which happen on the lifecycle thread while
//! the render thread is not using the backend.

use std::ffi::c_void;
use std::path::Path;
use std::ptr::NonNull;

use crate::bridge::ExternalTexture;
use crate::error::EngineError;
use crate::geometry::ScreenGeometry;

/// Capability tier chosen by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererTier {
    /// Modern API (Vulkan, Metal, DX12)
    Primary,
    /// GL or other downlevel adapter
    Compat,
}

/// Native Wayland surface the backend presents to.
///
/// Created by the host layer, which keeps the `wl_display` and `wl_surface`
/// alive until its `SurfaceReleased` request has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSurface {
    pub display: NonNull<c_void>,
    pub surface: NonNull<c_void>,
}

// SAFETY: the pointers are only dereferenced by the graphics driver, which
// accepts Wayland objects from any thread. The host outlives every use (see
// above).
unsafe impl Send for HostSurface {}

/// Reject sizes the GPU cannot allocate a 2D texture for.
pub fn check_texture_size(
    what: &str,
    width: u32,
    height: u32,
    max: u32,
) -> Result<(), EngineError> {
    if width > max || height > max {
        return Err(EngineError::InvalidGeometry(format!(
            "{what} is {width}x{height}, the GPU allows at most {max}x{max}"
        )));
    }
    Ok(())
}

/// Pixels read back from the render target.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 rows
    pub data: Vec<u8>,
}

impl Snapshot {
    /// Encode as PNG at `path`.
    pub fn save_png(&self, path: &Path) -> Result<(), EngineError> {
        let expected = self.width as usize * self.height as usize * 4;
        if self.data.len() != expected {
            return Err(EngineError::InvalidGeometry(format!(
                "snapshot of {}x{} has {} bytes, expected {}",
                self.width,
                self.height,
                self.data.len(),
                expected
            )));
        }

        image::save_buffer_with_format(
            path,
            &self.data,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )
        .map_err(|e| EngineError::Io(format!("Failed to write {}: {e}", path.display())))
    }
}

/// Draws the textured quad.
pub trait RenderBackend: Send {
    fn tier(&self) -> RendererTier;

    /// Largest texture width or height the device accepts.
    fn max_texture_size(&self) -> u32;

    /// Whether draws reach a host surface rather than an offscreen target.
    fn presents(&self) -> bool;

    /// Allocate a fresh external texture. Any previous texture from this
    /// backend stops being drawn.
    fn create_external_texture(&mut self) -> Box<dyn ExternalTexture>;

    /// Reallocate the render target (or reconfigure the surface) for a new
    /// screen size.
    fn resize(&mut self, screen: ScreenGeometry) -> Result<(), EngineError>;

    /// Upload the model matrix used by the next draws.
    fn set_transform(&mut self, matrix: [f32; 16]);

    /// Draw the current texture with the current transform and present it.
    /// With no latched image the target is cleared to black.
    fn draw(&mut self) -> Result<(), EngineError>;

    /// Render the current frame offscreen and read it back.
    fn snapshot(&mut self) -> Result<Snapshot, EngineError>;

    /// Release all GPU resources. Safe to call repeatedly.
    fn release(&mut self);
}

/// Creates backends, running the capability probe each time.
pub trait BackendFactory: Send + Sync {
    /// Without a host surface the backend draws offscreen.
    fn create(
        &self,
        screen: ScreenGeometry,
        host: Option<HostSurface>,
    ) -> Result<Box<dyn RenderBackend>, EngineError>;
}
