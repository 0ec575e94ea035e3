//! Geometry inputs of the crop transform.

use crate::error::EngineError;

/// Raw video dimensions as reported by the decoder plus the rotation the
/// container declares. Width and height are *not* pre-rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
}

/// Orientation correction declared in the container metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Map a metadata angle to a rotation. Angles are normalised modulo 360;
    /// anything that is not a multiple of 90 is rejected.
    pub fn from_degrees(degrees: i32) -> Result<Self, EngineError> {
        match degrees.rem_euclid(360) {
            0 => Ok(Self::None),
            90 => Ok(Self::Cw90),
            180 => Ok(Self::Cw180),
            270 => Ok(Self::Cw270),
            other => Err(EngineError::InvalidGeometry(format!(
                "unsupported rotation {other} degrees"
            ))),
        }
    }

    /// Map a GStreamer `image-orientation` tag such as `rotate-90`.
    ///
    /// Flipped orientations are not supported and are treated as upright.
    pub fn from_orientation_tag(tag: &str) -> Self {
        tag.strip_prefix("rotate-")
            .and_then(|degrees| degrees.parse::<i32>().ok())
            .and_then(|degrees| Self::from_degrees(degrees).ok())
            .unwrap_or_default()
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }

    /// Quarter turns swap the displayed width and height.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270)
    }
}

impl VideoGeometry {
    pub fn new(width: u32, height: u32, rotation: Rotation) -> Self {
        Self {
            width,
            height,
            rotation,
        }
    }

    /// Width and height as displayed, after applying the declared rotation.
    pub fn display_size(&self) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::InvalidGeometry(format!(
                "video is {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Drawing surface size in pixels. Last write wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenGeometry {
    pub width: u32,
    pub height: u32,
}

impl ScreenGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::InvalidGeometry(format!(
                "screen is {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Parallax translation in normalised quad units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Offset {
    pub x: f32,
    pub y: f32,
}

impl Offset {
    pub const ZERO: Offset = Offset { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Convert home screen paging offsets (each in `[0, 1]`, 0.5 is the
    /// middle page) to a parallax offset centred on zero.
    pub fn from_paging(x: f32, y: f32) -> Self {
        Self {
            x: 0.5 - x,
            y: 0.5 - y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(0).unwrap(), Rotation::None);
        assert_eq!(Rotation::from_degrees(90).unwrap(), Rotation::Cw90);
        assert_eq!(Rotation::from_degrees(-90).unwrap(), Rotation::Cw270);
        assert_eq!(Rotation::from_degrees(450).unwrap(), Rotation::Cw90);
        assert!(Rotation::from_degrees(45).is_err());
    }

    #[test]
    fn test_orientation_tags() {
        assert_eq!(Rotation::from_orientation_tag("rotate-0"), Rotation::None);
        assert_eq!(Rotation::from_orientation_tag("rotate-90"), Rotation::Cw90);
        assert_eq!(Rotation::from_orientation_tag("rotate-270"), Rotation::Cw270);
        assert_eq!(Rotation::from_orientation_tag("rotate-45"), Rotation::None);
        assert_eq!(Rotation::from_orientation_tag("flip-rotate-90"), Rotation::None);
    }

    #[test]
    fn test_display_size_swaps_on_quarter_turns() {
        let portrait = VideoGeometry::new(1920, 1080, Rotation::Cw90);
        assert_eq!(portrait.display_size(), (1080, 1920));
        let flipped = VideoGeometry::new(1920, 1080, Rotation::Cw180);
        assert_eq!(flipped.display_size(), (1920, 1080));
    }

    #[test]
    fn test_zero_dimensions_are_invalid() {
        assert!(VideoGeometry::new(0, 1080, Rotation::None).validate().is_err());
        assert!(ScreenGeometry::new(1080, 0).validate().is_err());
        assert!(ScreenGeometry::new(1080, 2400).validate().is_ok());
    }

    #[test]
    fn test_offset_from_paging() {
        let centre = Offset::from_paging(0.5, 0.5);
        assert_eq!(centre, Offset::ZERO);
        let first_page = Offset::from_paging(0.0, 0.5);
        assert_eq!(first_page.x, 0.5);
    }
}
