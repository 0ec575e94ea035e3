/// GPU context management - capability probe, host surface and wgpu device/queue initialization
use crate::config::GpuSettings;
use crate::error::EngineError;
use crate::render::{HostSurface, RendererTier, check_texture_size};

use wgpu::rwh::{RawDisplayHandle, RawWindowHandle, WaylandDisplayHandle, WaylandWindowHandle};

/// GPU context containing device, queue, and adapter info
pub struct GpuContext {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: wgpu::AdapterInfo,
    pub limits: wgpu::Limits,
    pub tier: RendererTier,
}

/// Pick a tier from the adapter, or refuse it.
///
/// Vulkan, Metal and DX12 adapters that are fully WebGPU compliant get the
/// primary tier. GL and other downlevel adapters get the compat tier.
pub fn classify_adapter(
    backend: wgpu::Backend,
    webgpu_compliant: bool,
    max_texture_size: u32,
    min_texture_size: u32,
) -> Result<RendererTier, EngineError> {
    if max_texture_size < min_texture_size {
        return Err(EngineError::ContextUnsupported(format!(
            "max texture size {max_texture_size} is below the required {min_texture_size}"
        )));
    }

    match backend {
        wgpu::Backend::Vulkan | wgpu::Backend::Metal | wgpu::Backend::Dx12 if webgpu_compliant => {
            Ok(RendererTier::Primary)
        }
        wgpu::Backend::Noop => Err(EngineError::ContextUnsupported(
            "no usable GPU backend".into(),
        )),
        _ => Ok(RendererTier::Compat),
    }
}

fn power_preference(settings: &GpuSettings) -> wgpu::PowerPreference {
    match settings.power_preference.as_str() {
        "high-performance" => wgpu::PowerPreference::HighPerformance,
        _ => wgpu::PowerPreference::LowPower,
    }
}

/// Wrap the host's Wayland surface for presentation.
fn create_host_surface(
    instance: &wgpu::Instance,
    host: HostSurface,
) -> Result<wgpu::Surface<'static>, EngineError> {
    let raw_display_handle = RawDisplayHandle::Wayland(WaylandDisplayHandle::new(host.display));
    let raw_window_handle = RawWindowHandle::Wayland(WaylandWindowHandle::new(host.surface));

    // SAFETY: the host keeps the display and surface alive until the backend
    // that owns this wgpu surface has been released.
    unsafe {
        instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
            raw_display_handle,
            raw_window_handle,
        })
    }
    .map_err(|e| EngineError::ContextUnsupported(format!("cannot present to host surface: {e}")))
}

impl GpuContext {
    /// Create a new GPU context, plus a presentable surface when the host
    /// provides one.
    ///
    /// Fails with `ContextUnsupported` when no adapter is found, the adapter
    /// is below the configured capability floor, or it cannot present to the
    /// host surface.
    pub async fn new(
        settings: &GpuSettings,
        host: Option<HostSurface>,
    ) -> Result<(Self, Option<wgpu::Surface<'static>>), EngineError> {
        log::info!("Initializing GPU context...");

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = host
            .map(|host| create_host_surface(&instance, host))
            .transpose()?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: power_preference(settings),
                compatible_surface: surface.as_ref(),
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| EngineError::ContextUnsupported(format!("no GPU adapter: {e}")))?;

        let adapter_info = adapter.get_info();
        let adapter_limits = adapter.limits();
        let tier = classify_adapter(
            adapter_info.backend,
            adapter.get_downlevel_capabilities().is_webgpu_compliant(),
            adapter_limits.max_texture_dimension_2d,
            settings.min_texture_size,
        )?;

        log::info!(
            "Selected GPU adapter: {} ({:?}, {:?} tier)",
            adapter_info.name,
            adapter_info.backend,
            tier
        );

        let required_limits = match tier {
            RendererTier::Primary => wgpu::Limits::default(),
            RendererTier::Compat => wgpu::Limits::downlevel_defaults(),
        }
        .using_resolution(adapter_limits);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("vidwall GPU Device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::ContextUnsupported(format!("device request failed: {e}")))?;

        let limits = device.limits();
        log::info!(
            "GPU context initialized, max texture size {}x{}",
            limits.max_texture_dimension_2d,
            limits.max_texture_dimension_2d
        );

        Ok((
            Self {
                adapter,
                device,
                queue,
                adapter_info,
                limits,
                tier,
            },
            surface,
        ))
    }

    /// Reject textures larger than the device allows. wgpu treats an
    /// oversized texture as a validation error, which is fatal.
    pub fn check_size(&self, what: &str, width: u32, height: u32) -> Result<(), EngineError> {
        check_texture_size(what, width, height, self.limits.max_texture_dimension_2d)
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter_info.name)
            .field("backend", &self.adapter_info.backend)
            .field("tier", &self.tier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modern_backends_get_primary_tier() {
        let tier = classify_adapter(wgpu::Backend::Vulkan, true, 8192, 2048).unwrap();
        assert_eq!(tier, RendererTier::Primary);
    }

    #[test]
    fn test_downlevel_adapters_get_compat_tier() {
        let tier = classify_adapter(wgpu::Backend::Gl, false, 4096, 2048).unwrap();
        assert_eq!(tier, RendererTier::Compat);
        let tier = classify_adapter(wgpu::Backend::Vulkan, false, 4096, 2048).unwrap();
        assert_eq!(tier, RendererTier::Compat);
    }

    #[test]
    fn test_small_textures_are_unsupported() {
        let err = classify_adapter(wgpu::Backend::Gl, false, 1024, 2048).unwrap_err();
        assert!(matches!(err, EngineError::ContextUnsupported(_)));
    }
}
