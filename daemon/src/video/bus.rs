//! Playback decisions taken on the bus thread.
//!
//! The GStreamer bus loop reduces each message to a [`BusMessage`] and carries
//! out whatever [`BusState::handle`] returns, so looping, the one-shot
//! geometry report and deferred seeks do not depend on a live pipeline.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::EngineError;
use crate::geometry::Rotation;

/// State shared between a source and its bus thread
#[derive(Debug, Default)]
pub struct BusShared {
    stopping: AtomicBool,
    prerolled: AtomicBool,
    /// Seek requested before preroll finished
    pending_seek: Mutex<Option<u64>>,
}

impl BusShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Keep `position_ms` for the first preroll. Returns `false` once the
    /// pipeline has prerolled, in which case the caller seeks directly.
    pub fn defer_seek(&self, position_ms: u64) -> bool {
        let Ok(mut pending) = self.pending_seek.lock() else {
            return false;
        };
        if self.prerolled.load(Ordering::Acquire) {
            return false;
        }
        *pending = Some(position_ms);
        true
    }

    /// Mark the pipeline prerolled. Returns the deferred seek on the first
    /// call only; later calls return `Err(())`.
    fn finish_preroll(&self) -> Result<Option<u64>, ()> {
        let mut pending = self.pending_seek.lock().map_err(|_| ())?;
        if self.prerolled.swap(true, Ordering::AcqRel) {
            return Err(());
        }
        Ok(pending.take())
    }
}

/// Bus messages that drive playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// A state change finished (preroll, or a flushing seek)
    AsyncDone,
    Eos,
    Orientation(Rotation),
    Error(String),
}

/// What the bus thread should do next
#[derive(Debug, PartialEq)]
pub enum BusAction {
    Seek(u64),
    /// Read the negotiated size and report it with this rotation
    ReportGeometry(Rotation),
    Fail(EngineError),
}

/// Per-pipeline bus bookkeeping
pub struct BusState<'a> {
    shared: &'a BusShared,
    rotation: Rotation,
    geometry_reported: bool,
}

impl<'a> BusState<'a> {
    pub fn new(shared: &'a BusShared) -> Self {
        Self {
            shared,
            rotation: Rotation::None,
            geometry_reported: false,
        }
    }

    pub fn handle(&mut self, message: BusMessage) -> Vec<BusAction> {
        match message {
            BusMessage::Orientation(rotation) => {
                self.rotation = rotation;
                Vec::new()
            }
            BusMessage::AsyncDone => {
                // Seeks finish with AsyncDone too; only the first one counts.
                let Ok(pending) = self.shared.finish_preroll() else {
                    return Vec::new();
                };
                let mut actions: Vec<BusAction> = pending.into_iter().map(BusAction::Seek).collect();
                if !self.geometry_reported {
                    self.geometry_reported = true;
                    actions.push(BusAction::ReportGeometry(self.rotation));
                }
                actions
            }
            BusMessage::Eos => {
                log::debug!("Video reached EOS, looping...");
                vec![BusAction::Seek(0)]
            }
            BusMessage::Error(message) => vec![BusAction::Fail(EngineError::DecodeFatal(message))],
        }
    }
}
