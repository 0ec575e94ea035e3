/// GPU rendering module using wgpu
///
/// Draws the decoded video on a unit quad transformed by the crop matrix.
/// Frames are presented to the host's layer surface, or rendered into an
/// offscreen target of the same size when running headless.
///
/// Architecture:
/// - `context`: capability probe and wgpu device/queue management
/// - `renderer`: [`RenderBackend`](crate::render::RenderBackend) implementation
/// - `quad_pipeline`: Quad pipeline and bind group layouts
/// - `texture`: External texture that latches decoded frames
#[cfg(feature = "gpu")]
pub mod context;
#[cfg(feature = "gpu")]
pub mod quad_pipeline;
#[cfg(feature = "gpu")]
pub mod renderer;
#[cfg(feature = "gpu")]
pub mod texture;

#[cfg(feature = "gpu")]
pub use context::GpuContext;
#[cfg(feature = "gpu")]
pub use renderer::WgpuBackendFactory;

#[cfg(not(feature = "gpu"))]
pub use factory_stub::WgpuBackendFactory;

#[cfg(not(feature = "gpu"))]
mod factory_stub {
    use crate::config::GpuSettings;
    use crate::error::EngineError;
    use crate::geometry::ScreenGeometry;
    use crate::render::{BackendFactory, HostSurface, RenderBackend};

    /// Stub factory when the gpu feature is disabled
    pub struct WgpuBackendFactory;

    impl WgpuBackendFactory {
        pub fn new(_settings: GpuSettings) -> Self {
            Self
        }
    }

    impl BackendFactory for WgpuBackendFactory {
        fn create(
            &self,
            _screen: ScreenGeometry,
            _host: Option<HostSurface>,
        ) -> Result<Box<dyn RenderBackend>, EngineError> {
            Err(EngineError::ContextUnsupported(
                "GPU support not compiled in".into(),
            ))
        }
    }
}
