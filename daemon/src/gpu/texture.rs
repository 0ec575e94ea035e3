use std::sync::{Arc, Mutex};

use crate::bridge::{DecodedFrame, ExternalTexture, FrameSlot};
use crate::error::EngineError;
use crate::gpu::GpuContext;

/// Bind group layout and sampler every video texture is bound with
pub struct TextureBinding {
    pub layout: wgpu::BindGroupLayout,
    pub sampler: wgpu::Sampler,
}

/// Represents a GPU texture with its bind group for shader access
pub struct VideoTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub bind_group: wgpu::BindGroup,
    pub width: u32,
    pub height: u32,
}

impl VideoTexture {
    /// Allocate an RGBA texture of the given size
    pub fn new(context: &GpuContext, binding: &TextureBinding, width: u32, height: u32) -> Self {
        let texture = context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Video Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Video Bind Group"),
                layout: &binding.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&binding.sampler),
                    },
                ],
            });

        Self {
            texture,
            view,
            bind_group,
            width,
            height,
        }
    }

    /// Upload a frame of the same size as the texture
    pub fn upload(&self, queue: &wgpu::Queue, frame: &DecodedFrame) -> Result<(), EngineError> {
        let expected_size = (self.width * self.height * 4) as usize;
        if frame.data.len() != expected_size {
            return Err(EngineError::InvalidGeometry(format!(
                "frame has {} bytes, expected {} for {}x{} RGBA",
                frame.data.len(),
                expected_size,
                self.width,
                self.height
            )));
        }

        queue.write_texture(
            self.texture.as_image_copy(),
            &frame.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.width * 4),
                rows_per_image: Some(self.height),
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }
}

/// Texture slot shared between an external texture handle and the renderer
pub type TextureCell = Arc<Mutex<Option<VideoTexture>>>;

/// Receives decoded frames and latches them into a GPU texture.
///
/// The renderer draws whatever is in the shared cell. Releasing empties the
/// cell so a released texture is never drawn.
pub struct GpuExternalTexture {
    context: Arc<GpuContext>,
    binding: Arc<TextureBinding>,
    cell: TextureCell,
    slot: FrameSlot,
    latched: bool,
}

impl GpuExternalTexture {
    pub fn new(context: Arc<GpuContext>, binding: Arc<TextureBinding>, cell: TextureCell) -> Self {
        Self {
            context,
            binding,
            cell,
            slot: FrameSlot::new(),
            latched: false,
        }
    }
}

impl ExternalTexture for GpuExternalTexture {
    fn update_tex_image(&mut self) -> Result<(), EngineError> {
        let Some(frame) = self.slot.take() else {
            return Ok(());
        };

        let mut cell = self
            .cell
            .lock()
            .map_err(|_| EngineError::Io("texture cell poisoned".into()))?;

        // Recreate on the first frame and whenever the decoded size changes.
        let needs_new = cell
            .as_ref()
            .is_none_or(|t| t.width != frame.width || t.height != frame.height);
        if needs_new {
            if frame.width == 0 || frame.height == 0 {
                return Err(EngineError::InvalidGeometry(format!(
                    "decoded frame is {}x{}",
                    frame.width, frame.height
                )));
            }
            self.context
                .check_size("video frame", frame.width, frame.height)?;
            log::debug!("Allocating {}x{} video texture", frame.width, frame.height);
            *cell = Some(VideoTexture::new(
                &self.context,
                &self.binding,
                frame.width,
                frame.height,
            ));
        }

        if let Some(texture) = cell.as_ref() {
            texture.upload(&self.context.queue, &frame)?;
            self.latched = true;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Ok(mut cell) = self.cell.lock()
            && let Some(texture) = cell.take()
        {
            texture.texture.destroy();
        }
        self.slot.clear();
        self.latched = false;
    }

    fn has_image(&self) -> bool {
        self.latched
    }

    fn frame_slot(&self) -> FrameSlot {
        self.slot.clone()
    }
}
