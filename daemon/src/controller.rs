//! Surface lifecycle state machine and draw loop.
//!
//! [`RenderSurfaceController`] runs on the lifecycle thread and reacts to host
//! events. [`DrawLoop`] runs on the render thread. They share
//! [`SharedRenderState`]:
//!
//! - low-frequency inputs (screen, video geometry, offset) behind a lock that
//!   the draw loop only holds while copying them out
//! - a `ticking` flag the draw loop checks before doing any GPU work
//! - the surface resources (backend and frame bridge), owned by the render
//!   thread while drawing and by the lifecycle thread while creating or
//!   releasing them
//!
//! Every transition is a guarded edge: an event that makes no sense in the
//! current state is logged and ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use common::{EngineStatus, SourceKind, WallpaperSource};

use crate::bridge::FrameTextureBridge;
use crate::config::PlaybackConfig;
use crate::crop::CropCalculator;
use crate::error::EngineError;
use crate::geometry::{Offset, ScreenGeometry, VideoGeometry};
use crate::guard_edge;
use crate::render::{BackendFactory, HostSurface, RenderBackend, Snapshot, check_texture_size};
use crate::store::WallpaperSelectionStore;
use crate::video::{SourceCallbacks, SourceFactory, VideoSource};

/// Restarts allowed after a decode error before it is escalated
const MAX_DECODE_RESTARTS: u32 = 1;

/// How often the draw loop logs frame statistics
const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    SurfaceReady,
    Playing,
    Paused,
}

#[derive(Debug, Default)]
struct PendingInputs {
    screen: Option<ScreenGeometry>,
    video: Option<VideoGeometry>,
    offset: Offset,
    /// Bumped on every surface acquisition
    surface_epoch: u64,
}

/// GPU resources tied to one surface
struct SurfaceResources {
    backend: Box<dyn RenderBackend>,
    bridge: FrameTextureBridge,
}

/// State shared between the lifecycle thread and the render thread
#[derive(Default)]
pub struct SharedRenderState {
    inputs: Mutex<PendingInputs>,
    ticking: AtomicBool,
    resources: Mutex<Option<SurfaceResources>>,
}

impl SharedRenderState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn inputs(&self) -> MutexGuard<'_, PendingInputs> {
        self.inputs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resources(&self) -> MutexGuard<'_, Option<SurfaceResources>> {
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking.load(Ordering::Acquire)
    }
}

/// Events fired by video sources, tagged with the source they came from
enum SourceEvent {
    Geometry { epoch: u64, geometry: VideoGeometry },
    Error { epoch: u64, error: EngineError },
}

#[derive(Debug, Clone)]
struct ResumePoint {
    locator: String,
    position_ms: u64,
}

/// Reacts to host lifecycle events. Lifecycle thread only.
pub struct RenderSurfaceController {
    playback: PlaybackConfig,
    default_source: WallpaperSource,
    store: Arc<dyn WallpaperSelectionStore>,
    sources: Arc<dyn SourceFactory>,
    backends: Arc<dyn BackendFactory>,
    shared: Arc<SharedRenderState>,

    state: EngineState,
    source: Option<Box<dyn VideoSource>>,
    active: Option<WallpaperSource>,
    screen: Option<ScreenGeometry>,
    /// Native surface of the current host, reused when a selection is applied
    host: Option<HostSurface>,
    /// Texture size limit of the current backend
    texture_limit: Option<u32>,
    /// Last visibility the host asked for
    visible: bool,
    /// Whether the current source has reported its geometry
    geometry_known: bool,
    resume: Option<ResumePoint>,
    restarts_left: u32,
    last_error: Option<String>,

    source_epoch: u64,
    events_tx: Sender<SourceEvent>,
    events_rx: Receiver<SourceEvent>,
    started_at: Instant,
}

impl RenderSurfaceController {
    pub fn new(
        playback: PlaybackConfig,
        default_source: WallpaperSource,
        store: Arc<dyn WallpaperSelectionStore>,
        sources: Arc<dyn SourceFactory>,
        backends: Arc<dyn BackendFactory>,
        shared: Arc<SharedRenderState>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            playback,
            default_source,
            store,
            sources,
            backends,
            shared,
            state: EngineState::Idle,
            source: None,
            active: None,
            screen: None,
            host: None,
            texture_limit: None,
            visible: false,
            geometry_known: false,
            resume: None,
            restarts_left: MAX_DECODE_RESTARTS,
            last_error: None,
            source_epoch: 0,
            events_tx,
            events_rx,
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn active_source(&self) -> Option<&WallpaperSource> {
        self.active.as_ref()
    }

    /// A drawing surface was created. Without a native `host` surface the
    /// engine renders offscreen.
    pub fn on_surface_acquired(
        &mut self,
        screen: ScreenGeometry,
        host: Option<HostSurface>,
    ) -> Result<(), EngineError> {
        if self.state != EngineState::Idle {
            log::debug!("Ignoring surface acquired in state {:?}", self.state);
            return Ok(());
        }
        screen.validate()?;
        log::info!("Surface acquired ({}x{})", screen.width, screen.height);

        let mut backend = self.backends.create(screen, host).inspect_err(|e| {
            log::error!("Cannot create render backend: {e}");
            self.last_error = Some(e.to_string());
        })?;
        let texture_limit = backend.max_texture_size();
        if let Err(e) = check_texture_size("screen", screen.width, screen.height, texture_limit) {
            log::error!("Cannot render to this surface: {e}");
            backend.release();
            self.last_error = Some(e.to_string());
            return Err(e);
        }
        log::info!(
            "Render backend tier: {:?}, {}",
            backend.tier(),
            if backend.presents() {
                "presenting"
            } else {
                "offscreen"
            }
        );

        {
            let mut inputs = self.shared.inputs();
            inputs.screen = Some(screen);
            inputs.video = None;
            inputs.offset = Offset::ZERO;
            inputs.surface_epoch += 1;
        }
        *self.shared.resources() = Some(SurfaceResources {
            backend,
            bridge: FrameTextureBridge::new(),
        });

        self.screen = Some(screen);
        self.host = host;
        self.texture_limit = Some(texture_limit);
        self.restarts_left = MAX_DECODE_RESTARTS;
        self.state = EngineState::SurfaceReady;

        let selected = self.resolve_source();
        if let Err(e) = self.start_with_fallback(selected) {
            log::error!("No playable wallpaper: {e}");
            self.last_error = Some(e.to_string());
            self.teardown();
            self.host = None;
            return Err(e);
        }

        // The host may have asked for visibility before the surface existed.
        if self.visible {
            self.on_visible(true);
        }
        Ok(())
    }

    /// The surface became visible or hidden.
    pub fn on_visible(&mut self, visible: bool) {
        self.visible = visible;

        if visible {
            guard_edge!(
                self.state,
                "visible(true)",
                EngineState::SurfaceReady | EngineState::Paused
            );
            if self.source.is_none() && self.state == EngineState::SurfaceReady {
                self.retry_selection();
                return;
            }
            if self.source.is_none() || !self.geometry_known {
                log::debug!("Deferring playback until the video geometry is known");
                return;
            }
            self.start_playing();
        } else {
            guard_edge!(self.state, "visible(false)", EngineState::Playing);
            self.shared.ticking.store(false, Ordering::Release);
            self.record_resume_point();
            if let Some(source) = self.source.as_mut() {
                crate::log_and_continue!(source.pause(), "pause video source");
            }
            self.state = EngineState::Paused;
            log::info!("Playback paused");
        }
    }

    /// Start over after an escalated failure left the surface without a
    /// source. Playback begins once the new source reports its geometry.
    fn retry_selection(&mut self) {
        log::info!("Retrying the wallpaper selection");
        self.restarts_left = MAX_DECODE_RESTARTS;
        let selected = self.resolve_source();
        if let Err(e) = self.start_with_fallback(selected) {
            log::error!("No playable wallpaper: {e}");
            self.last_error = Some(e.to_string());
        }
    }

    fn start_playing(&mut self) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        match source.play() {
            Ok(()) => {
                self.shared.ticking.store(true, Ordering::Release);
                self.state = EngineState::Playing;
                log::info!("Playback started");
            }
            Err(e) => {
                log::warn!("Failed to start playback: {e}");
                self.handle_source_error(e);
            }
        }
    }

    /// Host paging offsets changed. Each is in `[0, 1]`.
    pub fn on_offset_changed(&mut self, x: f32, y: f32) {
        if !self.playback.parallax_enabled() {
            log::trace!("Parallax disabled, ignoring offsets {x},{y}");
            return;
        }
        self.shared.inputs().offset = Offset::from_paging(x, y);
    }

    /// The surface changed size.
    pub fn on_screen_resized(&mut self, screen: ScreenGeometry) -> Result<(), EngineError> {
        if self.state == EngineState::Idle {
            log::debug!("Ignoring resize without a surface");
            return Ok(());
        }
        screen.validate()?;
        if let Some(max) = self.texture_limit {
            check_texture_size("screen", screen.width, screen.height, max)?;
        }
        log::info!("Surface resized to {}x{}", screen.width, screen.height);
        self.screen = Some(screen);
        self.shared.inputs().screen = Some(screen);
        Ok(())
    }

    /// The surface was destroyed. Safe to call repeatedly.
    pub fn on_surface_released(&mut self) {
        if self.state == EngineState::Idle {
            log::debug!("Ignoring surface released in state Idle");
            return;
        }
        log::info!("Surface released");
        self.record_resume_point();
        self.teardown();
        self.host = None;
    }

    /// Persist a new selection and recreate the surface with it.
    pub fn apply(&mut self, source: WallpaperSource) -> Result<(), EngineError> {
        self.store
            .persist(&source)
            .map_err(|e| EngineError::Io(format!("{e:#}")))?;

        let Some(screen) = self.screen.filter(|_| self.state != EngineState::Idle) else {
            log::info!("Selection stored, it will play on the next surface");
            return Ok(());
        };

        let host = self.host;
        self.on_surface_released();
        self.on_surface_acquired(screen, host)
    }

    /// Handle events reported by the current source.
    ///
    /// Returns an error when a decode failure had to be escalated.
    pub fn pump_events(&mut self) -> Option<EngineError> {
        let mut escalated = None;

        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                SourceEvent::Geometry { epoch, geometry } if epoch == self.source_epoch => {
                    if let Err(e) = geometry.validate() {
                        escalated = self.handle_source_error(e).or(escalated);
                        continue;
                    }
                    if let Err(e) = self.check_texture_limit(&geometry) {
                        // Restarting would decode the same size again.
                        escalated = self.replace_with_default(e).or(escalated);
                        continue;
                    }
                    self.shared.inputs().video = Some(geometry);
                    self.geometry_known = true;
                    if self.visible && self.state == EngineState::SurfaceReady {
                        self.start_playing();
                    }
                }
                SourceEvent::Error { epoch, error } if epoch == self.source_epoch => {
                    escalated = self.handle_source_error(error).or(escalated);
                }
                _ => log::debug!("Dropping event from a previous video source"),
            }
        }

        escalated
    }

    /// Restart the current source once, then give up.
    fn handle_source_error(&mut self, error: EngineError) -> Option<EngineError> {
        if self.state == EngineState::Idle {
            return None;
        }
        let Some(active) = self.active.clone() else {
            return None;
        };

        if self.restarts_left > 0 && error.is_recoverable() {
            self.restarts_left -= 1;
            log::warn!("Video source failed ({error}), restarting {}", active.locator);
            self.record_resume_point();
            self.stop_source();
            self.state = EngineState::SurfaceReady;

            // Playback resumes once the new source reports its geometry.
            let Err(e) = self.start(&active) else {
                return None;
            };
            log::warn!("Restart failed: {e}");
            return match self.fall_back_to_default(&active, e) {
                Ok(()) => None,
                Err(e) => self.escalate(e),
            };
        }

        self.escalate(error)
    }

    /// Drop the current source and play the bundled default instead.
    fn replace_with_default(&mut self, error: EngineError) -> Option<EngineError> {
        let Some(active) = self.active.clone() else {
            return None;
        };
        self.stop_source();
        self.state = EngineState::SurfaceReady;
        match self.fall_back_to_default(&active, error) {
            Ok(()) => None,
            Err(e) => self.escalate(e),
        }
    }

    fn escalate(&mut self, error: EngineError) -> Option<EngineError> {
        log::error!("Giving up on video source: {error}");
        self.last_error = Some(error.to_string());
        self.stop_source();
        if let Some(resources) = self.shared.resources().as_mut() {
            resources.bridge.release();
        }
        self.active = None;
        self.state = EngineState::SurfaceReady;
        Some(error)
    }

    /// Pick the selected source, or the bundled default if it is unusable.
    fn resolve_source(&mut self) -> WallpaperSource {
        let Some(selected) = self.store.resolve_active_source() else {
            log::info!("No selection, using the bundled default");
            return self.default_source.clone();
        };

        if selected.kind == SourceKind::External
            && let Err(e) = self.sources.check_reachable(&selected.locator)
        {
            log::warn!("{e}, falling back to the bundled default");
            self.store.mark_unreachable(&selected);
            self.last_error = Some(e.to_string());
            return self.default_source.clone();
        }

        selected
    }

    fn start_with_fallback(&mut self, selected: WallpaperSource) -> Result<(), EngineError> {
        match self.start(&selected) {
            Ok(()) => Ok(()),
            Err(e) => self.fall_back_to_default(&selected, e),
        }
    }

    /// `failed` could not be played. Start the bundled default, unless that
    /// is what failed. A selection that became unreachable is marked so.
    fn fall_back_to_default(
        &mut self,
        failed: &WallpaperSource,
        error: EngineError,
    ) -> Result<(), EngineError> {
        if failed.same_video(&self.default_source) {
            return Err(error);
        }
        log::warn!(
            "Cannot play '{}' ({error}), retrying with the bundled default",
            failed.name
        );

        let reason = match self.sources.check_reachable(&failed.locator) {
            Err(unreachable) => Some(unreachable),
            Ok(()) if matches!(error, EngineError::SourceUnreachable(_)) => Some(error.clone()),
            Ok(()) => None,
        };
        if let Some(ref unreachable) = reason {
            self.store.mark_unreachable(failed);
            log::warn!("{unreachable}");
        }
        self.last_error = Some(reason.unwrap_or(error).to_string());

        let fallback = self.default_source.clone();
        self.start(&fallback)
    }

    fn check_texture_limit(&self, geometry: &VideoGeometry) -> Result<(), EngineError> {
        match self.texture_limit {
            Some(max) => check_texture_size("video", geometry.width, geometry.height, max),
            None => Ok(()),
        }
    }

    /// Probe, create and prepare a source for `wallpaper` on a fresh texture.
    fn start(&mut self, wallpaper: &WallpaperSource) -> Result<(), EngineError> {
        let geometry = self.sources.probe(&wallpaper.locator)?;
        geometry.validate()?;
        self.check_texture_limit(&geometry)?;
        log::info!(
            "Starting '{}': {}x{} rotation {}",
            wallpaper.name,
            geometry.width,
            geometry.height,
            geometry.rotation.degrees()
        );

        let target = {
            let mut resources = self.shared.resources();
            let resources = resources
                .as_mut()
                .ok_or_else(|| EngineError::ContextUnsupported("no render backend".into()))?;
            let texture = resources.backend.create_external_texture();
            resources.bridge.attach(texture)
        };
        self.shared.inputs().video = Some(geometry);

        self.source_epoch += 1;
        self.geometry_known = false;
        let callbacks = self.callbacks();

        let mut source = self.sources.create();
        source.attach_texture(target);
        if let Err(e) = source.prepare(&wallpaper.locator, callbacks) {
            source.stop();
            return Err(e);
        }

        if let Some(ref resume) = self.resume
            && resume.locator == wallpaper.locator
        {
            log::debug!("Resuming at {}ms", resume.position_ms);
            crate::log_and_continue!(source.seek(resume.position_ms), "seek to resume point");
        }

        self.source = Some(source);
        self.active = Some(wallpaper.clone());
        Ok(())
    }

    fn callbacks(&self) -> SourceCallbacks {
        let epoch = self.source_epoch;
        let geometry_tx = self.events_tx.clone();
        let error_tx = self.events_tx.clone();

        SourceCallbacks {
            on_geometry: Box::new(move |geometry| {
                let _ = geometry_tx.send(SourceEvent::Geometry { epoch, geometry });
            }),
            on_error: Box::new(move |error| {
                let _ = error_tx.send(SourceEvent::Error { epoch, error });
            }),
        }
    }

    fn record_resume_point(&mut self) {
        let (Some(source), Some(active)) = (self.source.as_ref(), self.active.as_ref()) else {
            return;
        };
        if let Some(position_ms) = source.position_ms() {
            self.resume = Some(ResumePoint {
                locator: active.locator.clone(),
                position_ms,
            });
        }
    }

    fn stop_source(&mut self) {
        self.shared.ticking.store(false, Ordering::Release);
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
        self.geometry_known = false;
    }

    /// Stop the source, then release the texture and the backend.
    fn teardown(&mut self) {
        self.stop_source();

        if let Some(mut resources) = self.shared.resources().take() {
            resources.bridge.release();
            resources.backend.release();
        }
        {
            let mut inputs = self.shared.inputs();
            inputs.screen = None;
            inputs.video = None;
        }

        self.active = None;
        self.texture_limit = None;
        self.state = EngineState::Idle;
    }

    /// Render the current frame offscreen and read it back.
    pub fn snapshot(&self) -> Result<Snapshot, EngineError> {
        let mut resources = self.shared.resources();
        let resources = resources
            .as_mut()
            .ok_or_else(|| EngineError::Io("no surface to snapshot".into()))?;
        resources.backend.snapshot()
    }

    pub fn status(&self) -> EngineStatus {
        let video = self.shared.inputs().video;
        let (frames_delivered, frames_consumed, texture_updates) = self
            .shared
            .resources()
            .as_ref()
            .map(|r| (r.bridge.delivered(), r.bridge.consumed(), r.bridge.updates()))
            .unwrap_or_default();

        EngineStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            state: format!("{:?}", self.state),
            source: self.active.clone(),
            video: video.map(|v| (v.width, v.height, v.rotation.degrees())),
            screen: self.screen.map(|s| (s.width, s.height)),
            frames_delivered,
            frames_consumed,
            texture_updates,
            last_error: self.last_error.clone(),
        }
    }
}

/// Per-tick work on the render thread
pub struct DrawLoop {
    shared: Arc<SharedRenderState>,
    calculator: CropCalculator,
    surface_epoch: u64,
    applied_screen: Option<ScreenGeometry>,
    ticks: u64,
    draws: u64,
    last_stats_log: Instant,
}

impl DrawLoop {
    pub fn new(shared: Arc<SharedRenderState>) -> Self {
        Self {
            shared,
            calculator: CropCalculator::new(),
            surface_epoch: 0,
            applied_screen: None,
            ticks: 0,
            draws: 0,
            last_stats_log: Instant::now(),
        }
    }

    /// Run one draw tick. Returns whether a frame was drawn.
    pub fn tick(&mut self) -> bool {
        if !self.shared.is_ticking() {
            return false;
        }
        self.ticks += 1;
        #[cfg(feature = "profiling")]
        let tick_started = Instant::now();

        let (screen, video, offset, surface_epoch) = {
            let inputs = self.shared.inputs();
            (inputs.screen, inputs.video, inputs.offset, inputs.surface_epoch)
        };

        if surface_epoch != self.surface_epoch {
            self.calculator.clear();
            self.applied_screen = None;
            self.surface_epoch = surface_epoch;
        }

        let mut guard = self.shared.resources();
        let Some(resources) = guard.as_mut() else {
            return false;
        };

        let (Some(screen), Some(video)) = (screen, video) else {
            return false;
        };

        if self.applied_screen != Some(screen) {
            if let Err(e) = resources.backend.resize(screen) {
                log::warn!("Resize failed: {e}");
                return false;
            }
            self.applied_screen = Some(screen);
        }

        match self.calculator.update(video, screen, offset) {
            Ok(true) => {
                if let Some(transform) = self.calculator.current() {
                    resources.backend.set_transform(transform.to_cols_array());
                }
            }
            Ok(false) => {}
            Err(e) => {
                log::warn!("Not drawing: {e}");
                return false;
            }
        }

        resources.bridge.consume_if_ready();

        let drawn = match resources.backend.draw() {
            Ok(()) => {
                self.draws += 1;
                true
            }
            Err(e) => {
                log::warn!("Draw failed: {e}");
                false
            }
        };

        if self.last_stats_log.elapsed() >= STATS_INTERVAL {
            log::debug!(
                "Draw stats: {} ticks, {} draws, {} frames delivered, {} consumed, {} texture updates (attached: {}, latched: {})",
                self.ticks,
                self.draws,
                resources.bridge.delivered(),
                resources.bridge.consumed(),
                resources.bridge.updates(),
                resources.bridge.is_attached(),
                resources.bridge.has_image()
            );
            self.last_stats_log = Instant::now();
        }

        #[cfg(feature = "profiling")]
        log::trace!("Draw tick took {:?}", tick_started.elapsed());

        drawn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::CountingTexture;
    use crate::bridge::{DecodedFrame, ExternalTexture, FrameTarget};
    use crate::geometry::Rotation;
    use crate::render::RendererTier;
    use std::collections::HashMap;
    use std::ffi::c_void;
    use std::ptr::NonNull;
    use std::sync::atomic::AtomicUsize;

    const DEFAULT_LOCATOR: &str = "/usr/share/vidwall/default.mp4";
    const USER_LOCATOR: &str = "/home/user/beach.mp4";

    #[derive(Default)]
    struct BackendLog {
        created: AtomicUsize,
        released: AtomicUsize,
        draws: AtomicUsize,
        transforms: Mutex<Vec<[f32; 16]>>,
        textures: AtomicUsize,
        hosts: Mutex<Vec<Option<HostSurface>>>,
    }

    struct FakeBackend {
        log: Arc<BackendLog>,
        limit: u32,
        presents: bool,
    }

    impl RenderBackend for FakeBackend {
        fn tier(&self) -> RendererTier {
            RendererTier::Compat
        }

        fn max_texture_size(&self) -> u32 {
            self.limit
        }

        fn presents(&self) -> bool {
            self.presents
        }

        fn create_external_texture(&mut self) -> Box<dyn ExternalTexture> {
            self.log.textures.fetch_add(1, Ordering::SeqCst);
            Box::new(CountingTexture::new())
        }

        fn resize(&mut self, _screen: ScreenGeometry) -> Result<(), EngineError> {
            Ok(())
        }

        fn set_transform(&mut self, matrix: [f32; 16]) {
            self.log.transforms.lock().unwrap().push(matrix);
        }

        fn draw(&mut self) -> Result<(), EngineError> {
            self.log.draws.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn snapshot(&mut self) -> Result<Snapshot, EngineError> {
            Ok(Snapshot {
                width: 1,
                height: 1,
                data: vec![0, 0, 0, 255],
            })
        }

        fn release(&mut self) {
            self.log.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeBackends {
        log: Arc<BackendLog>,
        unsupported: bool,
        limit: u32,
    }

    impl BackendFactory for FakeBackends {
        fn create(
            &self,
            _screen: ScreenGeometry,
            host: Option<HostSurface>,
        ) -> Result<Box<dyn RenderBackend>, EngineError> {
            if self.unsupported {
                return Err(EngineError::ContextUnsupported("test GPU".into()));
            }
            self.log.created.fetch_add(1, Ordering::SeqCst);
            self.log.hosts.lock().unwrap().push(host);
            Ok(Box::new(FakeBackend {
                log: Arc::clone(&self.log),
                limit: self.limit,
                presents: host.is_some(),
            }))
        }
    }

    type ErrorHook = Arc<dyn Fn(EngineError) + Send + Sync>;

    #[derive(Default)]
    struct SourceLog {
        calls: Mutex<Vec<String>>,
        target: Mutex<Option<FrameTarget>>,
        on_error: Mutex<Option<ErrorHook>>,
        position_ms: Mutex<Option<u64>>,
    }

    impl SourceLog {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn fail(&self, error: EngineError) {
            let hook = self.on_error.lock().unwrap().clone().unwrap();
            hook(error);
        }
    }

    struct FakeSource {
        log: Arc<SourceLog>,
        geometry: Option<VideoGeometry>,
    }

    impl VideoSource for FakeSource {
        fn attach_texture(&mut self, target: FrameTarget) {
            self.log.push("attach".into());
            *self.log.target.lock().unwrap() = Some(target);
        }

        fn prepare(&mut self, locator: &str, callbacks: SourceCallbacks) -> Result<(), EngineError> {
            self.log.push(format!("prepare {locator}"));
            *self.log.on_error.lock().unwrap() = Some(Arc::from(callbacks.on_error));
            if let Some(geometry) = self.geometry {
                (callbacks.on_geometry)(geometry);
            }
            Ok(())
        }

        fn play(&mut self) -> Result<(), EngineError> {
            self.log.push("play".into());
            Ok(())
        }

        fn pause(&mut self) -> Result<(), EngineError> {
            self.log.push("pause".into());
            Ok(())
        }

        fn stop(&mut self) {
            self.log.push("stop".into());
        }

        fn seek(&mut self, position_ms: u64) -> Result<(), EngineError> {
            self.log.push(format!("seek {position_ms}"));
            Ok(())
        }

        fn position_ms(&self) -> Option<u64> {
            *self.log.position_ms.lock().unwrap()
        }
    }

    struct FakeSources {
        probes: Mutex<HashMap<String, Result<VideoGeometry, EngineError>>>,
        unreachable: Mutex<Vec<String>>,
        created: Mutex<Vec<Arc<SourceLog>>>,
        /// Report geometry from inside `prepare`
        report_geometry: bool,
    }

    impl FakeSources {
        fn new() -> Self {
            let mut probes = HashMap::new();
            probes.insert(DEFAULT_LOCATOR.to_string(), Ok(landscape()));
            probes.insert(USER_LOCATOR.to_string(), Ok(landscape()));
            Self {
                probes: Mutex::new(probes),
                unreachable: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                report_geometry: true,
            }
        }

        fn created(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        fn last(&self) -> Arc<SourceLog> {
            Arc::clone(self.created.lock().unwrap().last().unwrap())
        }

        fn nth(&self, index: usize) -> Arc<SourceLog> {
            Arc::clone(&self.created.lock().unwrap()[index])
        }
    }

    impl SourceFactory for FakeSources {
        fn create(&self) -> Box<dyn VideoSource> {
            let log = Arc::new(SourceLog::default());
            self.created.lock().unwrap().push(Arc::clone(&log));
            Box::new(FakeSource {
                log,
                geometry: self.report_geometry.then(landscape),
            })
        }

        fn probe(&self, locator: &str) -> Result<VideoGeometry, EngineError> {
            self.probes
                .lock()
                .unwrap()
                .get(locator)
                .cloned()
                .unwrap_or_else(|| Err(EngineError::Io(format!("{locator} not found"))))
        }

        fn check_reachable(&self, locator: &str) -> Result<(), EngineError> {
            if self.unreachable.lock().unwrap().iter().any(|l| l == locator) {
                return Err(EngineError::SourceUnreachable(locator.to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        selection: Mutex<Option<WallpaperSource>>,
        unreachable: Mutex<Vec<String>>,
        resolves: AtomicUsize,
    }

    impl WallpaperSelectionStore for FakeStore {
        fn resolve_active_source(&self) -> Option<WallpaperSource> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            self.selection.lock().unwrap().clone()
        }

        fn persist(&self, source: &WallpaperSource) -> anyhow::Result<()> {
            *self.selection.lock().unwrap() = Some(source.clone());
            Ok(())
        }

        fn mark_unreachable(&self, source: &WallpaperSource) {
            self.unreachable
                .lock()
                .unwrap()
                .push(source.locator.clone());
        }
    }

    fn landscape() -> VideoGeometry {
        VideoGeometry::new(1920, 1080, Rotation::None)
    }

    fn phone() -> ScreenGeometry {
        ScreenGeometry::new(1080, 2400)
    }

    fn host_surface() -> HostSurface {
        HostSurface {
            display: NonNull::<c_void>::dangling(),
            surface: NonNull::<c_void>::dangling(),
        }
    }

    struct Harness {
        controller: RenderSurfaceController,
        draw: DrawLoop,
        shared: Arc<SharedRenderState>,
        sources: Arc<FakeSources>,
        backends: Arc<BackendLog>,
        store: Arc<FakeStore>,
    }

    fn harness_with(
        playback: PlaybackConfig,
        sources: FakeSources,
        unsupported: bool,
    ) -> Harness {
        harness_limited(playback, sources, unsupported, 8192)
    }

    fn harness_limited(
        playback: PlaybackConfig,
        sources: FakeSources,
        unsupported: bool,
        limit: u32,
    ) -> Harness {
        let shared = SharedRenderState::new();
        let sources = Arc::new(sources);
        let backends = Arc::new(BackendLog::default());
        let store = Arc::new(FakeStore::default());

        let controller = RenderSurfaceController::new(
            playback,
            WallpaperSource::bundled("Default", DEFAULT_LOCATOR),
            store.clone(),
            sources.clone(),
            Arc::new(FakeBackends {
                log: Arc::clone(&backends),
                unsupported,
                limit,
            }),
            Arc::clone(&shared),
        );

        Harness {
            controller,
            draw: DrawLoop::new(Arc::clone(&shared)),
            shared,
            sources,
            backends,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(PlaybackConfig::default(), FakeSources::new(), false)
    }

    fn frame() -> DecodedFrame {
        DecodedFrame {
            width: 2,
            height: 2,
            data: vec![0; 16],
        }
    }

    #[test]
    fn test_acquire_release_acquire_re_resolves_source() {
        let mut h = harness();

        h.controller.on_surface_acquired(phone(), None).unwrap();
        assert_eq!(h.controller.state(), EngineState::SurfaceReady);
        h.controller.on_surface_released();
        assert_eq!(h.controller.state(), EngineState::Idle);

        *h.store.selection.lock().unwrap() =
            Some(WallpaperSource::external("Beach", USER_LOCATOR));
        h.controller.on_surface_acquired(phone(), None).unwrap();

        assert_eq!(h.store.resolves.load(Ordering::SeqCst), 2);
        assert_eq!(h.sources.created(), 2);
        assert_eq!(h.sources.nth(0).calls().last().unwrap(), "stop");
        assert_eq!(
            h.controller.active_source().unwrap().locator,
            USER_LOCATOR
        );
        assert_eq!(h.backends.created.load(Ordering::SeqCst), 2);
        assert_eq!(h.backends.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut h = harness();
        h.controller.on_surface_acquired(phone(), None).unwrap();

        h.controller.on_surface_released();
        h.controller.on_surface_released();

        assert_eq!(h.backends.released.load(Ordering::SeqCst), 1);
        let stops = h
            .sources
            .last()
            .calls()
            .iter()
            .filter(|c| *c == "stop")
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn test_visibility_before_surface_is_ignored_then_honoured() {
        let mut h = harness();

        h.controller.on_visible(false);
        h.controller.on_visible(true);
        assert_eq!(h.controller.state(), EngineState::Idle);

        h.controller.on_surface_acquired(phone(), None).unwrap();
        // Geometry is only known once the event is pumped.
        assert_eq!(h.controller.state(), EngineState::SurfaceReady);

        assert!(h.controller.pump_events().is_none());
        assert_eq!(h.controller.state(), EngineState::Playing);
        assert!(h.sources.last().calls().contains(&"play".to_string()));
    }

    #[test]
    fn test_visible_waits_for_geometry() {
        let mut sources = FakeSources::new();
        sources.report_geometry = false;
        let mut h = harness_with(PlaybackConfig::default(), sources, false);

        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        assert_eq!(h.controller.state(), EngineState::SurfaceReady);
        assert!(!h.sources.last().calls().contains(&"play".to_string()));
        assert!(!h.draw.tick());
    }

    #[test]
    fn test_pause_records_position_and_resume_seeks() {
        let mut h = harness();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.pump_events();
        h.controller.on_visible(true);
        assert_eq!(h.controller.state(), EngineState::Playing);

        *h.sources.last().position_ms.lock().unwrap() = Some(4200);
        h.controller.on_visible(false);
        assert_eq!(h.controller.state(), EngineState::Paused);
        assert!(!h.shared.is_ticking());

        h.controller.on_surface_released();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        assert!(h.sources.last().calls().contains(&"seek 4200".to_string()));
    }

    #[test]
    fn test_unreachable_selection_falls_back_to_default() {
        let mut sources = FakeSources::new();
        sources.unreachable.lock().unwrap().push(USER_LOCATOR.to_string());
        let mut h = harness_with(PlaybackConfig::default(), sources, false);
        *h.store.selection.lock().unwrap() =
            Some(WallpaperSource::external("Beach", USER_LOCATOR));

        h.controller.on_surface_acquired(phone(), None).unwrap();

        assert_eq!(
            h.controller.active_source().unwrap().locator,
            DEFAULT_LOCATOR
        );
        assert_eq!(*h.store.unreachable.lock().unwrap(), vec![USER_LOCATOR]);
        assert!(h.controller.status().last_error.is_some());
    }

    #[test]
    fn test_bad_metadata_retries_default_once() {
        let sources = FakeSources::new();
        sources.probes.lock().unwrap().insert(
            USER_LOCATOR.to_string(),
            Err(EngineError::InvalidGeometry("0x0".into())),
        );
        let mut h = harness_with(PlaybackConfig::default(), sources, false);
        *h.store.selection.lock().unwrap() =
            Some(WallpaperSource::external("Beach", USER_LOCATOR));

        h.controller.on_surface_acquired(phone(), None).unwrap();
        assert_eq!(
            h.controller.active_source().unwrap().locator,
            DEFAULT_LOCATOR
        );
        assert_eq!(h.sources.created(), 1);
    }

    #[test]
    fn test_default_failure_is_fatal_and_releases_everything() {
        let sources = FakeSources::new();
        sources.probes.lock().unwrap().clear();
        let mut h = harness_with(PlaybackConfig::default(), sources, false);

        let err = h.controller.on_surface_acquired(phone(), None).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert_eq!(h.controller.state(), EngineState::Idle);
        assert_eq!(h.backends.released.load(Ordering::SeqCst), 1);
        assert!(h.controller.status().last_error.is_some());
    }

    #[test]
    fn test_unsupported_gpu_aborts_creation() {
        let mut h = harness_with(PlaybackConfig::default(), FakeSources::new(), true);

        let err = h.controller.on_surface_acquired(phone(), None).unwrap_err();
        assert!(matches!(err, EngineError::ContextUnsupported(_)));
        assert_eq!(h.controller.state(), EngineState::Idle);
        assert_eq!(h.sources.created(), 0);
    }

    #[test]
    fn test_zero_sized_surface_is_rejected() {
        let mut h = harness();
        let err = h
            .controller
            .on_surface_acquired(ScreenGeometry::new(0, 2400), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidGeometry(_)));
        assert_eq!(h.backends.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decode_error_restarts_once_then_escalates() {
        let mut h = harness();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();
        assert_eq!(h.controller.state(), EngineState::Playing);

        h.sources.last().fail(EngineError::DecodeFatal("corrupt".into()));
        assert!(h.controller.pump_events().is_none());
        assert_eq!(h.sources.created(), 2);
        assert_eq!(h.controller.state(), EngineState::Playing);
        assert_eq!(h.backends.textures.load(Ordering::SeqCst), 2);

        h.sources.last().fail(EngineError::DecodeFatal("corrupt".into()));
        let escalated = h.controller.pump_events();
        assert!(matches!(escalated, Some(EngineError::DecodeFatal(_))));
        assert_eq!(h.sources.created(), 2);
        assert_eq!(h.controller.state(), EngineState::SurfaceReady);
        assert!(!h.shared.is_ticking());
        assert!(h.controller.status().last_error.is_some());
    }

    #[test]
    fn test_failed_restart_falls_back_to_default() {
        let mut h = harness();
        *h.store.selection.lock().unwrap() =
            Some(WallpaperSource::external("Beach", USER_LOCATOR));
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();
        assert_eq!(h.controller.active_source().unwrap().locator, USER_LOCATOR);

        // The file can no longer be opened, so the restart fails.
        h.sources.probes.lock().unwrap().remove(USER_LOCATOR);
        h.sources.last().fail(EngineError::DecodeFatal("corrupt".into()));

        assert!(h.controller.pump_events().is_none());
        assert_eq!(h.controller.state(), EngineState::Playing);
        assert_eq!(
            h.controller.active_source().unwrap().locator,
            DEFAULT_LOCATOR
        );
        assert!(h.shared.is_ticking());
        assert!(h.controller.status().last_error.is_some());
        assert!(h.store.unreachable.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_restart_marks_removed_selection_unreachable() {
        let mut h = harness();
        *h.store.selection.lock().unwrap() =
            Some(WallpaperSource::external("Beach", USER_LOCATOR));
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();

        h.sources.probes.lock().unwrap().remove(USER_LOCATOR);
        h.sources
            .unreachable
            .lock()
            .unwrap()
            .push(USER_LOCATOR.to_string());
        h.sources.last().fail(EngineError::DecodeFatal("corrupt".into()));
        h.controller.pump_events();

        assert_eq!(h.controller.state(), EngineState::Playing);
        assert_eq!(*h.store.unreachable.lock().unwrap(), vec![USER_LOCATOR]);
        assert!(
            h.controller
                .status()
                .last_error
                .unwrap()
                .contains("unreachable")
        );
    }

    #[test]
    fn test_escalation_clears_source_and_visible_retries() {
        let mut h = harness();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();

        h.sources.last().fail(EngineError::DecodeFatal("corrupt".into()));
        h.controller.pump_events();
        h.sources.last().fail(EngineError::DecodeFatal("corrupt".into()));
        assert!(h.controller.pump_events().is_some());
        assert!(h.controller.active_source().is_none());
        assert!(h.controller.status().source.is_none());

        h.controller.on_visible(true);
        assert_eq!(h.sources.created(), 3);
        h.controller.pump_events();
        assert_eq!(h.controller.state(), EngineState::Playing);
        assert_eq!(
            h.controller.active_source().unwrap().locator,
            DEFAULT_LOCATOR
        );
    }

    #[test]
    fn test_oversized_video_falls_back_to_default() {
        let sources = FakeSources::new();
        sources.probes.lock().unwrap().insert(
            USER_LOCATOR.to_string(),
            Ok(VideoGeometry::new(8192, 4320, Rotation::None)),
        );
        let mut h = harness_limited(PlaybackConfig::default(), sources, false, 4096);
        *h.store.selection.lock().unwrap() =
            Some(WallpaperSource::external("Beach", USER_LOCATOR));

        h.controller.on_surface_acquired(phone(), None).unwrap();

        assert_eq!(
            h.controller.active_source().unwrap().locator,
            DEFAULT_LOCATOR
        );
        assert_eq!(h.sources.created(), 1);
        let error = h.controller.status().last_error.unwrap();
        assert!(error.contains("8192x4320"), "{error}");
    }

    #[test]
    fn test_oversized_screen_is_rejected() {
        let mut h = harness_limited(PlaybackConfig::default(), FakeSources::new(), false, 4096);

        let err = h
            .controller
            .on_surface_acquired(ScreenGeometry::new(5120, 2880), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidGeometry(_)));
        assert_eq!(h.controller.state(), EngineState::Idle);
        assert_eq!(h.backends.released.load(Ordering::SeqCst), 1);
        assert_eq!(h.sources.created(), 0);
    }

    #[test]
    fn test_resize_beyond_limit_is_rejected() {
        let mut h = harness_limited(PlaybackConfig::default(), FakeSources::new(), false, 4096);
        h.controller.on_surface_acquired(phone(), None).unwrap();

        let err = h
            .controller
            .on_screen_resized(ScreenGeometry::new(7680, 4320))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidGeometry(_)));
        assert_eq!(h.controller.status().screen, Some((1080, 2400)));
    }

    #[test]
    fn test_apply_reuses_host_surface() {
        let mut h = harness();
        h.controller
            .on_surface_acquired(phone(), Some(host_surface()))
            .unwrap();

        h.controller
            .apply(WallpaperSource::external("Beach", USER_LOCATOR))
            .unwrap();

        let hosts = h.backends.hosts.lock().unwrap();
        assert_eq!(*hosts, vec![Some(host_surface()), Some(host_surface())]);
    }

    #[test]
    fn test_release_forgets_host_surface() {
        let mut h = harness();
        h.controller
            .on_surface_acquired(phone(), Some(host_surface()))
            .unwrap();
        h.controller.on_surface_released();
        h.controller.on_surface_acquired(phone(), None).unwrap();

        assert_eq!(h.backends.hosts.lock().unwrap().last(), Some(&None));
    }

    #[test]
    fn test_errors_from_replaced_source_are_ignored() {
        let mut h = harness();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        let old = h.sources.last();
        h.controller.on_surface_released();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.pump_events();

        old.fail(EngineError::DecodeFatal("late".into()));
        assert!(h.controller.pump_events().is_none());
        assert_eq!(h.sources.created(), 2);
    }

    #[test]
    fn test_draw_loop_skips_work_when_not_ticking() {
        let mut h = harness();
        assert!(!h.draw.tick());

        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();
        assert!(h.draw.tick());

        h.controller.on_visible(false);
        assert!(!h.draw.tick());
        assert_eq!(h.backends.draws.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_draw_loop_uploads_transform_only_on_change() {
        let mut h = harness();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();

        h.draw.tick();
        h.draw.tick();
        assert_eq!(h.backends.transforms.lock().unwrap().len(), 1);

        h.controller
            .on_screen_resized(ScreenGeometry::new(2400, 1080))
            .unwrap();
        h.draw.tick();
        assert_eq!(h.backends.transforms.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_draw_loop_latches_latest_frame_once() {
        let mut h = harness();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();

        let target = h.sources.last().target.lock().unwrap().clone().unwrap();
        for _ in 0..5 {
            target.deliver(frame());
        }
        h.draw.tick();

        let status = h.controller.status();
        assert_eq!(status.frames_delivered, 5);
        assert_eq!(status.frames_consumed, 5);
        assert_eq!(status.texture_updates, 1);
    }

    #[test]
    fn test_offsets_ignored_without_parallax() {
        let mut h = harness();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();
        h.draw.tick();

        h.controller.on_offset_changed(0.0, 0.5);
        h.draw.tick();
        assert_eq!(h.backends.transforms.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_offsets_move_transform_with_parallax() {
        let playback = PlaybackConfig {
            allow_parallax: true,
            ..Default::default()
        };
        let mut h = harness_with(playback, FakeSources::new(), false);
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();
        h.draw.tick();

        h.controller.on_offset_changed(0.0, 0.5);
        h.draw.tick();

        let transforms = h.backends.transforms.lock().unwrap();
        assert_eq!(transforms.len(), 2);
        // Column 3 holds the translation.
        assert_eq!(transforms[0][12], 0.0);
        assert!(transforms[1][12] > 0.0);
    }

    #[test]
    fn test_parallax_disabled_in_preview() {
        let playback = PlaybackConfig {
            allow_parallax: true,
            preview: true,
            ..Default::default()
        };
        let mut h = harness_with(playback, FakeSources::new(), false);
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_offset_changed(0.0, 0.5);
        assert_eq!(h.shared.inputs().offset, Offset::ZERO);
    }

    #[test]
    fn test_apply_persists_and_recreates_surface() {
        let mut h = harness();
        h.controller.on_surface_acquired(phone(), None).unwrap();
        h.controller.on_visible(true);
        h.controller.pump_events();

        h.controller
            .apply(WallpaperSource::external("Beach", USER_LOCATOR))
            .unwrap();

        assert_eq!(
            h.store.selection.lock().unwrap().as_ref().unwrap().locator,
            USER_LOCATOR
        );
        assert_eq!(h.controller.active_source().unwrap().locator, USER_LOCATOR);
        assert_eq!(h.backends.created.load(Ordering::SeqCst), 2);

        h.controller.pump_events();
        assert_eq!(h.controller.state(), EngineState::Playing);
    }

    #[test]
    fn test_apply_without_surface_only_persists() {
        let mut h = harness();
        h.controller
            .apply(WallpaperSource::external("Beach", USER_LOCATOR))
            .unwrap();
        assert_eq!(h.controller.state(), EngineState::Idle);
        assert_eq!(h.sources.created(), 0);
    }

    #[test]
    fn test_resize_without_surface_is_ignored() {
        let mut h = harness();
        h.controller
            .on_screen_resized(ScreenGeometry::new(100, 100))
            .unwrap();
        assert!(h.controller.status().screen.is_none());
    }

    #[test]
    fn test_snapshot_requires_surface() {
        let mut h = harness();
        assert!(h.controller.snapshot().is_err());
        h.controller.on_surface_acquired(phone(), None).unwrap();
        assert_eq!(h.controller.snapshot().unwrap().width, 1);
    }
}
