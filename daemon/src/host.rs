//! Turns layer surface events into lifecycle commands.
//!
//! The compositor sends a configure for every size change and `closed` when
//! it drops the surface. [`SurfaceTracker`] reduces that stream to the
//! acquire/resize/release edges the controller expects.

use crate::geometry::ScreenGeometry;
use crate::lifecycle::LifecycleCommand;
use crate::render::HostSurface;

/// Surface state as seen by the host
#[derive(Debug, Default)]
pub struct SurfaceTracker {
    size: Option<ScreenGeometry>,
}

impl SurfaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_acquired(&self) -> bool {
        self.size.is_some()
    }

    /// A configure arrived. A zero size means the compositor has not picked
    /// one yet.
    pub fn configure(
        &mut self,
        width: u32,
        height: u32,
        host: HostSurface,
    ) -> Vec<LifecycleCommand> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring configure without a size ({width}x{height})");
            return Vec::new();
        }
        let screen = ScreenGeometry::new(width, height);

        match self.size.replace(screen) {
            None => vec![
                LifecycleCommand::SurfaceAcquired(screen, Some(host)),
                // Background layers are shown as soon as they are mapped.
                LifecycleCommand::Visibility(true),
            ],
            Some(previous) if previous == screen => Vec::new(),
            Some(_) => vec![LifecycleCommand::SurfaceResized(screen)],
        }
    }

    /// The surface is going away. Returns the release to send before it is
    /// destroyed.
    pub fn closed(&mut self) -> Option<LifecycleCommand> {
        self.size
            .take()
            .map(|_| LifecycleCommand::SurfaceReleased)
    }
}
