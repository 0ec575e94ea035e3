//! Video decoding for the wallpaper.
//!
//! - `bus`: looping, geometry and deferred-seek decisions of the bus thread
//! - `pipeline`: GStreamer pipeline construction and metadata probing
//! - `player`: [`VideoSource`] backed by a GStreamer pipeline
//!
//! # Architecture
//!
//! 1. `uridecodebin` picks a decoder for the file or URI
//! 2. `videoconvert` produces RGBA
//! 3. The `AppSink` callback writes each frame into the attached
//!    [`FrameTarget`](crate::bridge::FrameTarget) and marks it ready
//! 4. The render thread latches the newest frame into its texture once per tick
//!
//! Audio is only linked when playback is unmuted. End of stream seeks back to
//! zero so the video loops forever.

use std::path::PathBuf;

use crate::bridge::FrameTarget;
use crate::error::EngineError;
use crate::geometry::VideoGeometry;

#[cfg_attr(not(feature = "video"), allow(dead_code))]
mod bus;
#[cfg(feature = "video")]
mod pipeline;
#[cfg(feature = "video")]
mod player;

#[cfg(feature = "video")]
pub use player::GstSourceFactory;

#[cfg(not(feature = "video"))]
pub use factory_stub::GstSourceFactory;

/// Callbacks a source fires from its own threads.
pub struct SourceCallbacks {
    /// Fired once, after the container and codec headers are parsed.
    pub on_geometry: Box<dyn FnOnce(VideoGeometry) + Send>,
    /// Fired on codec or container errors during playback.
    pub on_error: Box<dyn Fn(EngineError) + Send + Sync>,
}

/// A decoder/player for one video.
///
/// Everything except the callbacks is driven from the lifecycle thread.
pub trait VideoSource: Send {
    /// Where decoded frames go. May be called again to re-attach.
    fn attach_texture(&mut self, target: FrameTarget);

    /// Start loading `locator`. Returns once loading has begun; geometry is
    /// reported later through `callbacks.on_geometry`.
    fn prepare(&mut self, locator: &str, callbacks: SourceCallbacks) -> Result<(), EngineError>;

    fn play(&mut self) -> Result<(), EngineError>;

    fn pause(&mut self) -> Result<(), EngineError>;

    /// Release all decoder resources. Blocks until they are gone.
    fn stop(&mut self);

    fn seek(&mut self, position_ms: u64) -> Result<(), EngineError>;

    /// Current playback position, if known.
    fn position_ms(&self) -> Option<u64>;
}

/// Creates video sources and reads metadata without starting playback.
pub trait SourceFactory: Send + Sync {
    fn create(&self) -> Box<dyn VideoSource>;

    /// Read the geometry of `locator` synchronously.
    fn probe(&self, locator: &str) -> Result<VideoGeometry, EngineError>;

    /// Check that `locator` can still be opened.
    fn check_reachable(&self, locator: &str) -> Result<(), EngineError> {
        check_locator_readable(locator)
    }
}

/// Local paths and `file://` URIs must be openable. Other schemes are
/// assumed reachable and fail later in the decoder if they are not.
pub fn check_locator_readable(locator: &str) -> Result<(), EngineError> {
    let path = match locator.split_once("://") {
        Some(("file", _)) => file_uri_to_path(locator)?,
        Some(_) => return Ok(()),
        None => PathBuf::from(locator),
    };

    std::fs::File::open(&path)
        .map(|_| ())
        .map_err(|e| EngineError::SourceUnreachable(format!("{}: {e}", path.display())))
}

/// Decode a `file://` URI, including percent-escapes, into a local path.
#[cfg(feature = "video")]
fn file_uri_to_path(uri: &str) -> Result<PathBuf, EngineError> {
    gstreamer::glib::filename_from_uri(uri)
        .map(|(path, _host)| path)
        .map_err(|e| EngineError::SourceUnreachable(format!("{uri}: {e}")))
}

/// Without GStreamer nothing can be decoded anyway, so only the scheme is
/// stripped.
#[cfg(not(feature = "video"))]
fn file_uri_to_path(uri: &str) -> Result<PathBuf, EngineError> {
    uri.strip_prefix("file://")
        .map(PathBuf::from)
        .ok_or_else(|| EngineError::SourceUnreachable(format!("{uri}: not a file URI")))
}

#[cfg(not(feature = "video"))]
mod factory_stub {
    use super::*;

    /// Stub factory when the video feature is disabled
    pub struct GstSourceFactory;

    impl GstSourceFactory {
        pub fn new(_options: crate::config::PlaybackConfig) -> Self {
            Self
        }
    }

    struct NullSource;

    impl VideoSource for NullSource {
        fn attach_texture(&mut self, _target: FrameTarget) {}

        fn prepare(&mut self, _locator: &str, _callbacks: SourceCallbacks) -> Result<(), EngineError> {
            Err(EngineError::DecodeFatal("video support not compiled in".into()))
        }

        fn play(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn pause(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn stop(&mut self) {}

        fn seek(&mut self, _position_ms: u64) -> Result<(), EngineError> {
            Ok(())
        }

        fn position_ms(&self) -> Option<u64> {
            None
        }
    }

    impl SourceFactory for GstSourceFactory {
        fn create(&self) -> Box<dyn VideoSource> {
            Box::new(NullSource)
        }

        fn probe(&self, _locator: &str) -> Result<VideoGeometry, EngineError> {
            Err(EngineError::DecodeFatal("video support not compiled in".into()))
        }
    }
}
