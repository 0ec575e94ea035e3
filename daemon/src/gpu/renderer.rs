use crate::bridge::ExternalTexture;
use crate::config::GpuSettings;
use crate::error::EngineError;
use crate::geometry::ScreenGeometry;
use crate::gpu::GpuContext;
use crate::gpu::quad_pipeline::{QuadLayouts, create_quad_pipeline};
use crate::gpu::texture::{GpuExternalTexture, TextureBinding, TextureCell};
use crate::render::{BackendFactory, HostSurface, RenderBackend, RendererTier, Snapshot};

use std::sync::{Arc, Mutex};
use wgpu::util::DeviceExt;

/// Format of the offscreen render target
const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Surface formats the quad can present to, best first. All are four bytes
/// per texel so snapshots can read them back.
const SURFACE_FORMATS: [wgpu::TextureFormat; 4] = [
    wgpu::TextureFormat::Bgra8UnormSrgb,
    wgpu::TextureFormat::Rgba8UnormSrgb,
    wgpu::TextureFormat::Bgra8Unorm,
    wgpu::TextureFormat::Rgba8Unorm,
];

/// Model matrix uniform, laid out like the `Transform` struct in quad.wgsl
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct TransformUniform {
    model: [f32; 16],
}

/// Texture the quad can be rendered into and read back from
struct RenderTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl RenderTarget {
    fn new(device: &wgpu::Device, format: wgpu::TextureFormat, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Wallpaper Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            texture,
            view,
            width,
            height,
        }
    }
}

/// Where drawn frames go
enum Presenter {
    /// The host's layer surface; every draw presents
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
    /// No host surface (headless); frames only land in a texture
    Offscreen(RenderTarget),
}

impl Presenter {
    fn size(&self) -> (u32, u32) {
        match self {
            Presenter::Surface { config, .. } => (config.width, config.height),
            Presenter::Offscreen(target) => (target.width, target.height),
        }
    }

    fn format(&self) -> wgpu::TextureFormat {
        match self {
            Presenter::Surface { config, .. } => config.format,
            Presenter::Offscreen(_) => TARGET_FORMAT,
        }
    }
}

/// Configure `surface` for the screen, picking a readable sRGB format.
fn configure_surface(
    context: &GpuContext,
    surface: wgpu::Surface<'static>,
    screen: ScreenGeometry,
) -> Result<Presenter, EngineError> {
    let caps = surface.get_capabilities(&context.adapter);
    let format = SURFACE_FORMATS
        .into_iter()
        .find(|format| caps.formats.contains(format))
        .ok_or_else(|| {
            EngineError::ContextUnsupported(format!(
                "no 8-bit surface format among {:?}",
                caps.formats
            ))
        })?;

    let present_mode = if caps.present_modes.contains(&wgpu::PresentMode::Mailbox) {
        wgpu::PresentMode::Mailbox
    } else {
        wgpu::PresentMode::Fifo
    };

    let config = wgpu::SurfaceConfiguration {
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        format,
        width: screen.width,
        height: screen.height,
        present_mode,
        desired_maximum_frame_latency: 2,
        alpha_mode: wgpu::CompositeAlphaMode::Auto,
        view_formats: vec![],
    };
    surface.configure(&context.device, &config);

    log::debug!("Surface configured: {:?} {:?}", format, present_mode);
    Ok(Presenter::Surface { surface, config })
}

fn is_bgra(format: wgpu::TextureFormat) -> bool {
    matches!(
        format,
        wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb
    )
}

/// wgpu render backend for the video quad
pub struct WgpuBackend {
    // Declared first so the wgpu surface drops before anything else.
    presenter: Option<Presenter>,
    context: Arc<GpuContext>,
    pipeline: wgpu::RenderPipeline,
    binding: Arc<TextureBinding>,
    transform_buffer: wgpu::Buffer,
    transform_bind_group: wgpu::BindGroup,
    /// Cell of the texture created last; older textures are never drawn
    current: TextureCell,
    frames_drawn: u64,
}

impl WgpuBackend {
    /// Build the backend, presenting to `surface` when one is given and
    /// rendering offscreen otherwise.
    pub fn new(
        context: Arc<GpuContext>,
        surface: Option<wgpu::Surface<'static>>,
        screen: ScreenGeometry,
    ) -> Result<Self, EngineError> {
        screen.validate()?;
        context.check_size("screen", screen.width, screen.height)?;

        let presenter = match surface {
            Some(surface) => configure_surface(&context, surface, screen)?,
            None => Presenter::Offscreen(RenderTarget::new(
                &context.device,
                TARGET_FORMAT,
                screen.width,
                screen.height,
            )),
        };

        let device = &context.device;
        let layouts = QuadLayouts::new(device);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Video Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        let pipeline = create_quad_pipeline(device, &layouts, presenter.format());

        let identity = TransformUniform {
            model: glam::Mat4::IDENTITY.to_cols_array(),
        };
        let transform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Transform Buffer"),
            contents: bytemuck::bytes_of(&identity),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let transform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Transform Bind Group"),
            layout: &layouts.transform,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: transform_buffer.as_entire_binding(),
            }],
        });

        log::info!(
            "GPU backend ready ({:?} tier, {}x{}, {})",
            context.tier,
            screen.width,
            screen.height,
            if matches!(presenter, Presenter::Surface { .. }) {
                "presenting"
            } else {
                "offscreen"
            }
        );

        Ok(Self {
            binding: Arc::new(TextureBinding {
                layout: layouts.texture,
                sampler,
            }),
            presenter: Some(presenter),
            context,
            pipeline,
            transform_buffer,
            transform_bind_group,
            current: Arc::new(Mutex::new(None)),
            frames_drawn: 0,
        })
    }

    fn presenter(&self) -> Result<&Presenter, EngineError> {
        self.presenter
            .as_ref()
            .ok_or_else(|| EngineError::ContextUnsupported("backend was released".into()))
    }

    /// Record the quad pass into `view`. Without a latched frame the pass
    /// only clears.
    fn encode_quad(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
    ) -> Result<(), EngineError> {
        let cell = self
            .current
            .lock()
            .map_err(|_| EngineError::Io("texture cell poisoned".into()))?;

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Quad Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });

        if let Some(ref texture) = *cell {
            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &self.transform_bind_group, &[]);
            render_pass.set_bind_group(1, &texture.bind_group, &[]);
            render_pass.draw(0..4, 0..1);
        }
        Ok(())
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }
}

impl RenderBackend for WgpuBackend {
    fn tier(&self) -> RendererTier {
        self.context.tier
    }

    fn max_texture_size(&self) -> u32 {
        self.context.limits.max_texture_dimension_2d
    }

    fn presents(&self) -> bool {
        matches!(self.presenter, Some(Presenter::Surface { .. }))
    }

    fn create_external_texture(&mut self) -> Box<dyn ExternalTexture> {
        self.current = Arc::new(Mutex::new(None));
        Box::new(GpuExternalTexture::new(
            Arc::clone(&self.context),
            Arc::clone(&self.binding),
            Arc::clone(&self.current),
        ))
    }

    fn resize(&mut self, screen: ScreenGeometry) -> Result<(), EngineError> {
        screen.validate()?;
        if self.presenter()?.size() == (screen.width, screen.height) {
            return Ok(());
        }
        self.context
            .check_size("screen", screen.width, screen.height)?;

        log::debug!("Resizing render target to {}x{}", screen.width, screen.height);
        match self.presenter.as_mut() {
            Some(Presenter::Surface { surface, config }) => {
                config.width = screen.width;
                config.height = screen.height;
                surface.configure(&self.context.device, config);
            }
            Some(Presenter::Offscreen(target)) => {
                target.texture.destroy();
                *target = RenderTarget::new(
                    &self.context.device,
                    TARGET_FORMAT,
                    screen.width,
                    screen.height,
                );
            }
            None => {}
        }
        Ok(())
    }

    fn set_transform(&mut self, matrix: [f32; 16]) {
        let uniform = TransformUniform { model: matrix };
        self.context
            .queue
            .write_buffer(&self.transform_buffer, 0, bytemuck::bytes_of(&uniform));
    }

    fn draw(&mut self) -> Result<(), EngineError> {
        let mut encoder = self.encoder("Quad Encoder");

        match self.presenter()? {
            Presenter::Surface { surface, config } => {
                let output = match surface.get_current_texture() {
                    Ok(output) => output,
                    Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                        // Skip this frame; the next one uses the fresh swapchain.
                        surface.configure(&self.context.device, config);
                        return Ok(());
                    }
                    Err(wgpu::SurfaceError::Timeout) => {
                        log::warn!("Surface texture timed out, dropping frame");
                        return Ok(());
                    }
                    Err(e) => {
                        return Err(EngineError::ContextUnsupported(format!(
                            "cannot acquire surface texture: {e}"
                        )));
                    }
                };
                let view = output
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                self.encode_quad(&mut encoder, &view)?;
                self.context.queue.submit(std::iter::once(encoder.finish()));
                output.present();
            }
            Presenter::Offscreen(target) => {
                self.encode_quad(&mut encoder, &target.view)?;
                self.context.queue.submit(std::iter::once(encoder.finish()));
            }
        }

        self.frames_drawn += 1;
        Ok(())
    }

    fn snapshot(&mut self) -> Result<Snapshot, EngineError> {
        let presenter = self.presenter()?;
        let (width, height) = presenter.size();
        let format = presenter.format();

        // Swapchain images cannot be copied from, so render a fresh frame.
        let target = RenderTarget::new(&self.context.device, format, width, height);

        // Note: bytes_per_row must be aligned to COPY_BYTES_PER_ROW_ALIGNMENT (256)
        let bytes_per_row = width * 4;
        let aligned_bytes_per_row = bytes_per_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let buffer_size = (aligned_bytes_per_row * height) as u64;

        let output_buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Snapshot Buffer"),
            size: buffer_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.encoder("Snapshot Encoder");
        self.encode_quad(&mut encoder, &target.view)?;

        encoder.copy_texture_to_buffer(
            target.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &output_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );

        self.context.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = output_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        // Wait for mapping to complete
        let _ = self.context.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        receiver
            .recv()
            .map_err(|e| EngineError::Io(format!("snapshot readback dropped: {e}")))?
            .map_err(|e| EngineError::Io(format!("snapshot map failed: {e}")))?;

        let data = buffer_slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((bytes_per_row * height) as usize);
        for row in data.chunks(aligned_bytes_per_row as usize) {
            pixels.extend_from_slice(&row[..bytes_per_row as usize]);
        }
        drop(data);
        output_buffer.unmap();
        target.texture.destroy();

        if is_bgra(format) {
            for pixel in pixels.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
        }

        log::debug!("Snapshot read back {}x{} ({} bytes)", width, height, pixels.len());

        Ok(Snapshot {
            width,
            height,
            data: pixels,
        })
    }

    fn release(&mut self) {
        if let Some(presenter) = self.presenter.take() {
            if let Presenter::Offscreen(target) = presenter {
                target.texture.destroy();
            }
            log::info!("GPU backend released after {} frames", self.frames_drawn);
        }
        if let Ok(mut cell) = self.current.lock() {
            *cell = None;
        }
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("context", &self.context)
            .field("presents", &self.presents())
            .field("frames_drawn", &self.frames_drawn)
            .finish()
    }
}

/// Runs the capability check and builds a [`WgpuBackend`]
pub struct WgpuBackendFactory {
    settings: GpuSettings,
}

impl WgpuBackendFactory {
    pub fn new(settings: GpuSettings) -> Self {
        Self { settings }
    }
}

impl BackendFactory for WgpuBackendFactory {
    fn create(
        &self,
        screen: ScreenGeometry,
        host: Option<HostSurface>,
    ) -> Result<Box<dyn RenderBackend>, EngineError> {
        let (context, surface) = pollster::block_on(GpuContext::new(&self.settings, host))?;
        Ok(Box::new(WgpuBackend::new(Arc::new(context), surface, screen)?))
    }
}
