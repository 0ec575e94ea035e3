//! GStreamer-backed video source
//!
//! A bus thread per pipeline loops the video on end of stream, reports the
//! geometry once the pipeline has prerolled and forwards decode errors.

use super::bus::{BusAction, BusMessage, BusShared, BusState};
use super::pipeline::{self, AudioOptions};
use super::{SourceCallbacks, SourceFactory, VideoSource};
use crate::bridge::FrameTarget;
use crate::config::PlaybackConfig;
use crate::error::EngineError;
use crate::geometry::VideoGeometry;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the bus thread checks whether it should exit
const BUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Creates [`GstVideoSource`]s sharing one playback configuration
pub struct GstSourceFactory {
    playback: PlaybackConfig,
}

impl GstSourceFactory {
    pub fn new(playback: PlaybackConfig) -> Self {
        Self { playback }
    }
}

impl SourceFactory for GstSourceFactory {
    fn create(&self) -> Box<dyn VideoSource> {
        Box::new(GstVideoSource::new(&self.playback))
    }

    fn probe(&self, locator: &str) -> Result<VideoGeometry, EngineError> {
        pipeline::probe_geometry(locator, self.playback.prepare_timeout())
    }
}

/// Plays one video in a loop
pub struct GstVideoSource {
    audio: AudioOptions,
    pipeline: Option<gst::Pipeline>,
    app_sink: Option<gst_app::AppSink>,
    target: Arc<Mutex<Option<FrameTarget>>>,
    shared: Arc<BusShared>,
    bus_thread: Option<JoinHandle<()>>,
}

impl GstVideoSource {
    pub fn new(playback: &PlaybackConfig) -> Self {
        Self {
            audio: AudioOptions {
                muted: playback.muted,
                volume: if playback.muted { 0.0 } else { playback.volume },
            },
            pipeline: None,
            app_sink: None,
            target: Arc::new(Mutex::new(None)),
            shared: Arc::new(BusShared::new()),
            bus_thread: None,
        }
    }

    fn pipeline(&self) -> Result<&gst::Pipeline, EngineError> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| EngineError::DecodeFatal("video source is not prepared".into()))
    }

    /// Stop the bus thread and bring the pipeline to `Null`. Keeps the target.
    fn teardown(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        log::info!("Stopping video pipeline");

        // Clear callbacks first to prevent new frames
        if let Some(app_sink) = self.app_sink.take() {
            app_sink.set_callbacks(gst_app::AppSinkCallbacks::builder().build());
        }

        self.shared.stop();
        if let Some(handle) = self.bus_thread.take()
            && handle.join().is_err()
        {
            log::warn!("Bus thread panicked");
        }

        pipeline::shutdown(&pipeline);
    }

    fn set_state(&self, state: gst::State) -> Result<(), EngineError> {
        self.pipeline()?
            .set_state(state)
            .map(|_| ())
            .map_err(|e| EngineError::DecodeFatal(format!("Failed to set {state:?}: {e}")))
    }
}

fn seek_to(pipeline: &gst::Pipeline, position_ms: u64) -> Result<(), EngineError> {
    pipeline
        .seek_simple(
            gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
            gst::ClockTime::from_mseconds(position_ms),
        )
        .map_err(|e| EngineError::DecodeFatal(format!("Seek to {position_ms}ms failed: {e}")))
}

/// Reduce a GStreamer message to the ones that drive playback.
fn classify(msg: &gst::Message) -> Option<BusMessage> {
    if let Some(rotation) = pipeline::orientation_from_message(msg) {
        return Some(BusMessage::Orientation(rotation));
    }

    match msg.view() {
        gst::MessageView::AsyncDone(_) => Some(BusMessage::AsyncDone),
        gst::MessageView::Eos(_) => Some(BusMessage::Eos),
        gst::MessageView::Error(err) => {
            log::error!(
                "GStreamer error: {} (debug: {:?})",
                err.error(),
                err.debug()
            );
            Some(BusMessage::Error(err.error().to_string()))
        }
        _ => None,
    }
}

/// Drain the bus until asked to stop.
fn run_bus_loop(
    pipeline: gst::Pipeline,
    app_sink: gst_app::AppSink,
    shared: Arc<BusShared>,
    callbacks: SourceCallbacks,
) {
    let SourceCallbacks {
        on_geometry,
        on_error,
    } = callbacks;

    let Some(bus) = pipeline.bus() else {
        on_error(EngineError::DecodeFatal("Pipeline has no bus".into()));
        return;
    };

    let mut on_geometry = Some(on_geometry);
    let mut state = BusState::new(&shared);
    let poll = gst::ClockTime::from_mseconds(BUS_POLL_INTERVAL.as_millis() as u64);

    while !shared.is_stopping() {
        // Other messages are popped and dropped so the bus never grows.
        let Some(message) = bus.timed_pop(poll).as_ref().and_then(classify) else {
            continue;
        };

        for action in state.handle(message) {
            match action {
                BusAction::Seek(position_ms) => {
                    if let Err(e) = seek_to(&pipeline, position_ms) {
                        log::warn!("Seek to {position_ms}ms failed: {e}");
                        if position_ms == 0 {
                            on_error(e);
                        }
                    }
                }
                BusAction::ReportGeometry(rotation) => {
                    let Some(report) = on_geometry.take() else {
                        continue;
                    };
                    match pipeline::negotiated_size(&app_sink) {
                        Some((width, height)) => {
                            log::info!(
                                "Video prepared: {}x{} rotation {}",
                                width,
                                height,
                                rotation.degrees()
                            );
                            report(VideoGeometry::new(width, height, rotation));
                        }
                        None => on_error(EngineError::InvalidGeometry(
                            "no negotiated video caps after preroll".into(),
                        )),
                    }
                }
                BusAction::Fail(e) => on_error(e),
            }
        }
    }
}

impl VideoSource for GstVideoSource {
    fn attach_texture(&mut self, target: FrameTarget) {
        if let Ok(mut current) = self.target.lock() {
            *current = Some(target);
        }
    }

    fn prepare(&mut self, locator: &str, callbacks: SourceCallbacks) -> Result<(), EngineError> {
        self.teardown();
        log::info!("Preparing video: {}", locator);

        let (pipeline, app_sink) = pipeline::build_pipeline(locator, self.audio)?;
        pipeline::setup_frame_callback(&app_sink, Arc::clone(&self.target));

        self.shared = Arc::new(BusShared::new());

        let thread_pipeline = pipeline.clone();
        let thread_sink = app_sink.clone();
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("vidwall-bus".into())
            .spawn(move || run_bus_loop(thread_pipeline, thread_sink, shared, callbacks))
            .map_err(|e| EngineError::Io(format!("Failed to spawn bus thread: {e}")))?;

        self.pipeline = Some(pipeline);
        self.app_sink = Some(app_sink);
        self.bus_thread = Some(handle);

        self.set_state(gst::State::Paused)
    }

    fn play(&mut self) -> Result<(), EngineError> {
        log::info!("Starting video playback");
        self.set_state(gst::State::Playing)
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        log::info!("Pausing video playback");
        self.set_state(gst::State::Paused)
    }

    fn stop(&mut self) {
        self.teardown();
        if let Ok(mut target) = self.target.lock() {
            *target = None;
        }
    }

    fn seek(&mut self, position_ms: u64) -> Result<(), EngineError> {
        // Before preroll the bus thread applies the seek on AsyncDone.
        if self.shared.defer_seek(position_ms) {
            return Ok(());
        }
        seek_to(self.pipeline()?, position_ms)
    }

    fn position_ms(&self) -> Option<u64> {
        self.pipeline
            .as_ref()?
            .query_position::<gst::ClockTime>()
            .map(|t| t.mseconds())
    }
}

impl Drop for GstVideoSource {
    fn drop(&mut self) {
        self.stop();
    }
}
