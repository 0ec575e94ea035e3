//! Error taxonomy for the render/lifecycle engine.

use common::WallpaperError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Zero or negative dimensions. Never draw with these.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The file was removed or permission to read it was revoked.
    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    /// Codec or container failure while decoding.
    #[error("decode failed: {0}")]
    DecodeFatal(String),

    /// The GPU is below the minimum capability tier.
    #[error("GPU context unsupported: {0}")]
    ContextUnsupported(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl EngineError {
    /// Geometry and decode errors are handled inside the engine with a
    /// bounded retry. Everything else is surfaced to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidGeometry(_) | Self::DecodeFatal(_) | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<EngineError> for WallpaperError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidGeometry(msg) => Self::InvalidGeometry(msg),
            EngineError::SourceUnreachable(msg) => Self::SourceUnreachable(msg),
            EngineError::DecodeFatal(msg) => Self::Decode(msg),
            EngineError::ContextUnsupported(msg) => Self::ContextUnsupported(msg),
            EngineError::Io(msg) => Self::Io(msg),
        }
    }
}
