//! Common types and utilities for vidwall.
//!
//! This crate defines the shared data structures and IPC protocol used for
//! communication between the render daemon (`vidwalld`), the host glue that
//! owns the drawing surface, and the control client (`vwctl`).
//!
//! # IPC Protocol
//!
//! Communication happens over a Unix domain socket using newline-delimited
//! JSON messages. The peer sends [`Command`] variants and receives
//! [`Response`] variants.
//!
//! # Examples
//!
//! ```no_run
//! use common::Command;
//!
//! // Tell the daemon a 1080x2400 surface was created
//! let cmd = Command::SurfaceAcquired {
//!     width: 1080,
//!     height: 2400,
//! };
//!
//! // Serialize for sending over IPC
//! let json = serde_json::to_string(&cmd).unwrap();
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common error types shared between client and daemon.
///
/// All errors are serializable for transmission over IPC.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum WallpaperError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("GPU context unsupported: {0}")]
    ContextUnsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for WallpaperError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for WallpaperError {
    fn from(e: serde_json::Error) -> Self {
        Self::Ipc(e.to_string())
    }
}

/// Where a wallpaper video comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    /// Shipped with the daemon; always reachable.
    Bundled,
    /// Picked by the user from the filesystem; may disappear.
    External,
}

/// A persisted reference to a playable video.
///
/// This is the minimum needed to rebuild a source after a process restart,
/// independent of the catalog and of the video's geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallpaperSource {
    /// Human readable name shown by the catalog
    pub name: String,
    /// File path or URI of the video
    pub locator: String,
    /// Whether the video is bundled or external
    pub kind: SourceKind,
}

impl WallpaperSource {
    pub fn bundled(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
            kind: SourceKind::Bundled,
        }
    }

    pub fn external(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
            kind: SourceKind::External,
        }
    }

    /// Two sources are the same video when their locators match.
    pub fn same_video(&self, other: &WallpaperSource) -> bool {
        self.locator == other.locator
    }
}

/// Commands sent to the daemon via IPC.
///
/// The surface lifecycle commands are sent by the host that owns the drawing
/// surface. They may arrive in any order; the daemon ignores the ones that
/// make no sense for its current state.
///
/// # Examples
///
/// ```
/// use common::Command;
///
/// // Apply a new wallpaper from the catalog
/// let cmd = Command::Apply {
///     name: "Beach".to_string(),
///     path: "/home/user/Videos/beach.mp4".to_string(),
/// };
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub enum Command {
    /// A drawing surface was created with the given size in pixels.
    SurfaceAcquired { width: u32, height: u32 },
    /// The drawing surface changed size.
    SurfaceResized { width: u32, height: u32 },
    /// The surface became visible or hidden.
    VisibilityChanged { visible: bool },
    /// Home screen paging offsets, each in `[0, 1]`.
    OffsetsChanged { x: f32, y: f32 },
    /// The drawing surface was destroyed.
    SurfaceReleased,
    /// Persist a new selection and recreate the surface with it.
    Apply {
        /// Display name for the selection
        name: String,
        /// Path to the video file (must be absolute)
        path: String,
    },
    /// Query engine status
    Query,
    /// Write the last drawn frame to a PNG file
    Snapshot { path: String },
    /// Ping the daemon
    Ping,
    /// Kill the daemon
    Kill,
}

/// Response from daemon to client
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(WallpaperError),
    Status(EngineStatus),
    Pong,
}

/// Engine status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub version: String,
    pub uptime_secs: u64,
    /// Lifecycle state name (Idle, SurfaceReady, Playing, Paused)
    pub state: String,
    pub source: Option<WallpaperSource>,
    /// Raw video width, height and rotation in degrees
    pub video: Option<(u32, u32, u32)>,
    pub screen: Option<(u32, u32)>,
    pub frames_delivered: u64,
    pub frames_consumed: u64,
    pub texture_updates: u64,
    pub last_error: Option<String>,
}

/// IPC socket path helper
pub fn get_socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));

    std::path::PathBuf::from(runtime_dir).join("vidwall.sock")
}
