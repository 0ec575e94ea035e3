//! Frame delivery between the decoder thread and the draw loop.
//!
//! The decoder thread writes the newest frame into a [`FrameSlot`] and calls
//! [`FrameNotifier::mark_ready`]. The render thread calls
//! [`FrameTextureBridge::consume_if_ready`] once per tick, which latches the
//! newest frame into the texture at most once no matter how many frames
//! arrived in between. Older frames are dropped, never replayed.
//!
//! Each counter has a single writer: `delivered` is only written by the
//! decoder thread, `consumed` only by the render thread. No lock is taken on
//! the counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// One decoded RGBA frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 rows
    pub data: Vec<u8>,
}

/// Latest-frame slot shared between the decoder and a texture.
///
/// Writing replaces whatever frame was there.
#[derive(Debug, Clone, Default)]
pub struct FrameSlot {
    frame: Arc<Mutex<Option<DecodedFrame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a frame, replacing any frame not yet consumed.
    pub fn store(&self, frame: DecodedFrame) {
        if let Ok(mut slot) = self.frame.lock() {
            *slot = Some(frame);
        }
    }

    /// Take the newest frame, leaving the slot empty.
    pub fn take(&self) -> Option<DecodedFrame> {
        self.frame.lock().ok()?.take()
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.frame.lock() {
            *slot = None;
        }
    }
}

/// GPU texture that receives decoder output.
///
/// Implementations must only be driven from the render thread.
pub trait ExternalTexture: Send {
    /// Latch the newest decoded image into the texture.
    fn update_tex_image(&mut self) -> Result<(), EngineError>;

    /// Release the backing GPU storage. Called once before the texture is dropped.
    fn release(&mut self);

    /// Whether at least one image was latched since creation.
    fn has_image(&self) -> bool;

    /// Slot the decoder should write frames into.
    fn frame_slot(&self) -> FrameSlot;
}

#[derive(Debug, Default)]
struct FrameCounters {
    delivered: AtomicU64,
    consumed: AtomicU64,
}

/// Decoder-side handle. Cheap to clone.
///
/// A notifier from a previous attachment keeps counting into counters nobody
/// reads any more, so late callbacks after a re-attach are harmless.
#[derive(Debug, Clone)]
pub struct FrameNotifier {
    counters: Arc<FrameCounters>,
}

impl FrameNotifier {
    pub fn mark_ready(&self) {
        self.counters.delivered.fetch_add(1, Ordering::Release);
    }
}

/// Everything a video source needs to deliver frames.
#[derive(Debug, Clone)]
pub struct FrameTarget {
    pub slot: FrameSlot,
    pub notifier: FrameNotifier,
}

impl FrameTarget {
    /// Store a frame and signal the render thread.
    pub fn deliver(&self, frame: DecodedFrame) {
        self.slot.store(frame);
        self.notifier.mark_ready();
    }
}

/// Owns one external texture and the counter pair guarding it.
pub struct FrameTextureBridge {
    texture: Option<Box<dyn ExternalTexture>>,
    counters: Arc<FrameCounters>,
    updates: u64,
}

impl FrameTextureBridge {
    pub fn new() -> Self {
        Self {
            texture: None,
            counters: Arc::new(FrameCounters::default()),
            updates: 0,
        }
    }

    /// Replace the backing texture and reset both counters.
    ///
    /// Returns the target the new video source must deliver into.
    pub fn attach(&mut self, texture: Box<dyn ExternalTexture>) -> FrameTarget {
        self.release();

        let slot = texture.frame_slot();
        self.texture = Some(texture);
        self.counters = Arc::new(FrameCounters::default());
        self.updates = 0;
        log::debug!("Frame bridge attached to a fresh texture");

        FrameTarget {
            slot,
            notifier: self.notifier(),
        }
    }

    pub fn notifier(&self) -> FrameNotifier {
        FrameNotifier {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Latch the newest frame if any arrived since the last tick.
    ///
    /// Returns whether the texture was updated. Render thread only.
    pub fn consume_if_ready(&mut self) -> bool {
        let Some(texture) = self.texture.as_mut() else {
            return false;
        };

        let delivered = self.counters.delivered.load(Ordering::Acquire);
        let consumed = self.counters.consumed.load(Ordering::Relaxed);
        if consumed >= delivered {
            return false;
        }

        // Drain the whole backlog in one step.
        self.counters.consumed.store(delivered, Ordering::Relaxed);
        log::trace!(
            "Consuming frame backlog of {} ({} delivered)",
            delivered - consumed,
            delivered
        );

        match texture.update_tex_image() {
            Ok(()) => {
                self.updates += 1;
                true
            }
            Err(e) => {
                log::warn!("Texture update failed: {e}");
                false
            }
        }
    }

    /// Release the texture. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(mut texture) = self.texture.take() {
            texture.release();
            log::debug!(
                "Frame bridge released texture after {} updates",
                self.updates
            );
        }
    }

    pub fn is_attached(&self) -> bool {
        self.texture.is_some()
    }

    /// Whether there is a latched image that may be drawn.
    pub fn has_image(&self) -> bool {
        self.texture.as_ref().is_some_and(|t| t.has_image())
    }

    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Acquire)
    }

    pub fn consumed(&self) -> u64 {
        self.counters.consumed.load(Ordering::Relaxed)
    }

    /// Texture updates performed since the last attach.
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl Default for FrameTextureBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameTextureBridge {
    fn drop(&mut self) {
        self.release();
    }
}
