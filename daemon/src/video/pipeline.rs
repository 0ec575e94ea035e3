//! GStreamer pipeline setup and metadata probing
//!
//! Decoding goes through `uridecodebin`, so any container and codec that has a
//! GStreamer plugin installed works, with hardware decoders picked by rank.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::Path;
use std::time::Duration;

use crate::bridge::{DecodedFrame, FrameTarget};
use crate::error::EngineError;
use crate::geometry::{Rotation, VideoGeometry};

/// Initialize GStreamer (idempotent, safe to call multiple times)
pub fn initialize_gstreamer() -> Result<(), EngineError> {
    static GSTREAMER_INITIALIZED: std::sync::OnceLock<Result<(), String>> =
        std::sync::OnceLock::new();

    GSTREAMER_INITIALIZED
        .get_or_init(|| {
            gst::init().map_err(|e| e.to_string())?;
            log::info!("GStreamer initialized");
            Ok(())
        })
        .clone()
        .map_err(|e| EngineError::DecodeFatal(format!("GStreamer init failed: {e}")))
}

/// Audio settings for a pipeline.
#[derive(Debug, Clone, Copy)]
pub struct AudioOptions {
    pub muted: bool,
    pub volume: f64,
}

/// Turn a locator into a URI `uridecodebin` understands.
pub fn locator_to_uri(locator: &str) -> Result<String, EngineError> {
    if locator.contains("://") {
        return Ok(locator.to_string());
    }

    gst::glib::filename_to_uri(Path::new(locator), None)
        .map(|uri| uri.to_string())
        .map_err(|e| EngineError::SourceUnreachable(format!("{locator}: {e}")))
}

/// Build the description passed to `gst::parse::launch`.
///
/// The audio branch is only present when audio is enabled. When muted,
/// `uridecodebin` may still decode an audio track, but its pad stays unlinked
/// and the samples are dropped without reaching an audio sink.
pub fn pipeline_description(uri: &str, audio: AudioOptions) -> String {
    let mut description = format!(
        "uridecodebin uri=\"{}\" name=dec \
         dec. ! queue ! videoconvert ! video/x-raw,format=RGBA ! appsink name=sink",
        uri.replace('"', "%22")
    );

    if !audio.muted {
        description.push_str(&format!(
            " dec. ! queue ! audioconvert ! audioresample ! volume volume={:.3} ! autoaudiosink",
            audio.volume.clamp(0.0, 1.0)
        ));
    }

    description
}

/// Build a decode pipeline for `locator`.
///
/// # Returns
///
/// Tuple of (pipeline, app_sink) where app_sink receives RGBA frames
pub fn build_pipeline(
    locator: &str,
    audio: AudioOptions,
) -> Result<(gst::Pipeline, gst_app::AppSink), EngineError> {
    initialize_gstreamer()?;

    let uri = locator_to_uri(locator)?;
    let description = pipeline_description(&uri, audio);
    log::debug!("GStreamer pipeline: {}", description);

    let pipeline = gst::parse::launch(&description)
        .map_err(|e| EngineError::DecodeFatal(format!("Failed to create pipeline: {e}")))?
        .dynamic_cast::<gst::Pipeline>()
        .map_err(|_| EngineError::DecodeFatal("Pipeline is not a gst::Pipeline".into()))?;

    let app_sink = pipeline
        .by_name("sink")
        .ok_or_else(|| EngineError::DecodeFatal("Failed to get appsink from pipeline".into()))?
        .dynamic_cast::<gst_app::AppSink>()
        .map_err(|_| EngineError::DecodeFatal("sink is not an AppSink".into()))?;

    configure_app_sink(&app_sink);

    Ok((pipeline, app_sink))
}

/// Configure AppSink for latest-frame delivery
///
/// - `sync=true`: Frames are paced by their timestamps
/// - `max-buffers=1` and `drop=true`: Never queue a backlog
fn configure_app_sink(app_sink: &gst_app::AppSink) {
    app_sink.set_property("emit-signals", false);
    app_sink.set_property("sync", true);
    app_sink.set_property("max-buffers", 1u32);
    app_sink.set_property("drop", true);
}

/// Copy a sample into a tightly packed RGBA frame.
fn sample_to_frame(sample: &gst::Sample) -> Result<DecodedFrame, gst::FlowError> {
    let caps = sample.caps().ok_or(gst::FlowError::NotNegotiated)?;
    let info = gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::NotNegotiated)?;
    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * 4;
    let stride = info.stride()[0] as usize;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .ok_or(gst::FlowError::Error)?
            .to_vec()
    } else {
        let mut packed = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            packed.extend_from_slice(
                data.get(start..start + row_bytes)
                    .ok_or(gst::FlowError::Error)?,
            );
        }
        packed
    };

    Ok(DecodedFrame {
        width,
        height,
        data: pixels,
    })
}

/// Setup frame callback for AppSink
///
/// Every sample is written to the currently attached target, if any.
pub fn setup_frame_callback(
    app_sink: &gst_app::AppSink,
    target: std::sync::Arc<std::sync::Mutex<Option<FrameTarget>>>,
) {
    app_sink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let frame = sample_to_frame(&sample)?;

                if let Ok(guard) = target.lock()
                    && let Some(ref target) = *guard
                {
                    target.deliver(frame);
                } else {
                    log::trace!("Video frame dropped (no texture attached)");
                }

                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
}

/// Pick up an orientation tag from a bus message, if it carries one.
pub fn orientation_from_message(msg: &gst::Message) -> Option<Rotation> {
    if let gst::MessageView::Tag(tag) = msg.view() {
        let tags = tag.tags();
        let orientation = tags.get::<gst::tags::ImageOrientation>()?;
        return Some(Rotation::from_orientation_tag(orientation.get()));
    }
    None
}

/// Read the negotiated raw size from the appsink pad.
pub fn negotiated_size(app_sink: &gst_app::AppSink) -> Option<(u32, u32)> {
    let caps = app_sink.static_pad("sink")?.current_caps()?;
    let info = gst_video::VideoInfo::from_caps(&caps).ok()?;
    Some((info.width(), info.height()))
}

/// Shut a pipeline down and wait for it to reach `Null`.
pub fn shutdown(pipeline: &gst::Pipeline) {
    match pipeline.set_state(gst::State::Null) {
        Ok(_) => {
            let (result, current, _) = pipeline.state(Some(gst::ClockTime::from_seconds(2)));
            if let Err(e) = result {
                log::warn!("Pipeline did not reach Null (stuck in {:?}): {:?}", current, e);
            }
        }
        Err(e) => {
            log::warn!("Failed to set pipeline state to Null: {}", e);
        }
    }

    // Drain pending messages from bus
    if let Some(bus) = pipeline.bus() {
        let mut drained = 0;
        while bus.pop().is_some() {
            drained += 1;
        }
        if drained > 0 {
            log::debug!("Drained {} pending messages from bus", drained);
        }
    }
}

/// Preroll `locator` and read its geometry without playing it.
pub fn probe_geometry(locator: &str, timeout: Duration) -> Result<VideoGeometry, EngineError> {
    let (pipeline, app_sink) = build_pipeline(
        locator,
        AudioOptions {
            muted: true,
            volume: 0.0,
        },
    )?;

    let result = preroll_and_read(&pipeline, &app_sink, timeout);
    shutdown(&pipeline);
    result
}

fn preroll_and_read(
    pipeline: &gst::Pipeline,
    app_sink: &gst_app::AppSink,
    timeout: Duration,
) -> Result<VideoGeometry, EngineError> {
    pipeline
        .set_state(gst::State::Paused)
        .map_err(|e| EngineError::DecodeFatal(format!("Failed to preroll: {e}")))?;

    let bus = pipeline
        .bus()
        .ok_or_else(|| EngineError::DecodeFatal("Pipeline has no bus".into()))?;
    let deadline = std::time::Instant::now() + timeout;
    let mut rotation = Rotation::None;

    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Err(EngineError::Io(format!(
                "Timed out after {}ms reading video metadata",
                timeout.as_millis()
            )));
        }

        let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(remaining.as_millis() as u64))
        else {
            continue;
        };

        if let Some(found) = orientation_from_message(&msg) {
            rotation = found;
            continue;
        }

        match msg.view() {
            gst::MessageView::AsyncDone(_) => break,
            gst::MessageView::Error(err) => {
                return Err(EngineError::DecodeFatal(format!(
                    "{} (debug: {:?})",
                    err.error(),
                    err.debug()
                )));
            }
            _ => {}
        }
    }

    let (width, height) = negotiated_size(app_sink)
        .ok_or_else(|| EngineError::InvalidGeometry("no video stream".into()))?;
    let geometry = VideoGeometry::new(width, height, rotation);
    geometry.validate()?;
    Ok(geometry)
}
