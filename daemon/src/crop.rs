//! Crop transform math.
//!
//! The video is drawn on a unit quad spanning `[-1, 1]` on both axes. The
//! model matrix built here scales that quad so the video *fills* the screen:
//! the axis on which the video is relatively longer overflows the screen and
//! gets cropped, the other axis fits exactly. No letterboxing.
//!
//! The matrix is `scale * rotate * translate`, applied right to left to each
//! vertex: the parallax translation moves the quad inside its own overflow,
//! the rotation undoes the orientation declared in the container, and the
//! scale works on the rotated (display) aspect ratio.

use glam::{Mat4, Vec2, Vec3};

use crate::error::EngineError;
use crate::geometry::{Offset, ScreenGeometry, VideoGeometry};

/// Which axis overflows the screen and is cropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropAxis {
    /// Video is relatively wider than the screen; left and right are cropped.
    Horizontal,
    /// Video is relatively taller than the screen; top and bottom are cropped.
    Vertical,
}

/// Result of [`compute`]. Always built from scratch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropTransform {
    /// Column-major model matrix for the vertex shader
    pub matrix: Mat4,
    /// Scale factors applied to the quad
    pub scale: Vec2,
    pub axis: CropAxis,
    /// Parallax offset after clamping
    pub offset: Offset,
    /// Largest offset magnitude allowed on each axis
    pub max_offset: Offset,
}

impl CropTransform {
    pub fn to_cols_array(&self) -> [f32; 16] {
        self.matrix.to_cols_array()
    }
}

/// Largest parallax offset the crop leaves room for on each axis.
///
/// The axis that is not cropped has no slack, so its limit is zero.
pub fn max_offsets(video_ratio: f32, screen_ratio: f32) -> Offset {
    let x = (1.0 - screen_ratio / video_ratio) / 2.0;
    let y = (1.0 - (1.0 / screen_ratio) / (1.0 / video_ratio)) / 2.0;
    Offset::new(x.max(0.0), y.max(0.0))
}

/// Clamp one offset component to `[-max, +max]`. Non-finite input clamps to zero.
pub fn clamp_component(value: f32, max: f32) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(-max, max)
}

/// Compute the crop transform for the given inputs.
///
/// Fails only when either geometry has a zero dimension; the caller must not
/// draw in that case.
pub fn compute(
    video: &VideoGeometry,
    screen: &ScreenGeometry,
    offset: Offset,
) -> Result<CropTransform, EngineError> {
    video.validate()?;
    screen.validate()?;

    // Decoders report raw sample dimensions, so rotate them first.
    let (video_width, video_height) = video.display_size();
    let video_ratio = video_width as f32 / video_height as f32;
    let screen_ratio = screen.width as f32 / screen.height as f32;

    let max_offset = max_offsets(video_ratio, screen_ratio);
    let clamped = Offset::new(
        clamp_component(offset.x, max_offset.x),
        clamp_component(offset.y, max_offset.y),
    );

    let (axis, scale, translation) = if video_ratio >= screen_ratio {
        (
            CropAxis::Horizontal,
            Vec2::new(video_ratio / screen_ratio, 1.0),
            Vec3::new(clamped.x, 0.0, 0.0),
        )
    } else {
        (
            CropAxis::Vertical,
            Vec2::new(1.0, screen_ratio / video_ratio),
            Vec3::new(0.0, clamped.y, 0.0),
        )
    };

    let mut matrix = Mat4::from_scale(Vec3::new(scale.x, scale.y, 1.0));
    let degrees = video.rotation.degrees();
    if degrees != 0 {
        matrix *= Mat4::from_rotation_z(-(degrees as f32).to_radians());
    }
    matrix *= Mat4::from_translation(translation);

    Ok(CropTransform {
        matrix,
        scale,
        axis,
        offset: clamped,
        max_offset,
    })
}

/// Caches the last inputs so unchanged inputs do not cause a recompute or a
/// uniform upload.
#[derive(Debug, Default)]
pub struct CropCalculator {
    last_inputs: Option<(VideoGeometry, ScreenGeometry, Offset)>,
    current: Option<CropTransform>,
}

impl CropCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the last inputs and the last transform.
    pub fn clear(&mut self) {
        self.last_inputs = None;
        self.current = None;
    }

    pub fn current(&self) -> Option<&CropTransform> {
        self.current.as_ref()
    }

    /// Recompute if any input changed. Returns `Ok(true)` when a new transform
    /// was produced and `Ok(false)` when the inputs were identical.
    ///
    /// On error the previous transform is dropped so nothing is drawn with
    /// stale geometry.
    pub fn update(
        &mut self,
        video: VideoGeometry,
        screen: ScreenGeometry,
        offset: Offset,
    ) -> Result<bool, EngineError> {
        let inputs = (video, screen, offset);
        if self.last_inputs == Some(inputs) && self.current.is_some() {
            return Ok(false);
        }

        match compute(&video, &screen, offset) {
            Ok(transform) => {
                log::debug!(
                    "Crop {:?}: scale {:.3}x{:.3}, rotation {}, offset {:.3},{:.3}",
                    transform.axis,
                    transform.scale.x,
                    transform.scale.y,
                    video.rotation.degrees(),
                    transform.offset.x,
                    transform.offset.y
                );
                self.last_inputs = Some(inputs);
                self.current = Some(transform);
                Ok(true)
            }
            Err(e) => {
                self.clear();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation;
    use proptest::prelude::*;

    const EPSILON: f32 = 1e-5;

    fn video(width: u32, height: u32, degrees: i32) -> VideoGeometry {
        VideoGeometry::new(width, height, Rotation::from_degrees(degrees).unwrap())
    }

    #[test]
    fn test_rotated_portrait_matches_screen_exactly() {
        let screen = ScreenGeometry::new(1080, 1920);
        let transform = compute(&video(1920, 1080, 90), &screen, Offset::ZERO).unwrap();

        assert_eq!(transform.scale, Vec2::ONE);
        assert_eq!(transform.max_offset, Offset::ZERO);
    }

    #[test]
    fn test_landscape_video_on_tall_phone_crops_horizontally() {
        let screen = ScreenGeometry::new(1080, 2400);
        let transform = compute(&video(1920, 1080, 0), &screen, Offset::ZERO).unwrap();

        assert_eq!(transform.axis, CropAxis::Horizontal);
        let expected = (1920.0 / 1080.0) / (1080.0 / 2400.0);
        assert!((transform.scale.x - expected).abs() < EPSILON);
        assert!((transform.scale.x - 3.95).abs() < 0.01);
        assert_eq!(transform.scale.y, 1.0);
    }

    #[test]
    fn test_tall_video_on_wide_screen_crops_vertically() {
        let screen = ScreenGeometry::new(1920, 1080);
        let transform = compute(&video(720, 1280, 0), &screen, Offset::ZERO).unwrap();

        assert_eq!(transform.axis, CropAxis::Vertical);
        assert_eq!(transform.scale.x, 1.0);
        let expected = (1920.0 / 1080.0) / (720.0 / 1280.0);
        assert!((transform.scale.y - expected).abs() < EPSILON);
    }

    #[test]
    fn test_rotation_swap_is_equivalent_for_ratios() {
        let screen = ScreenGeometry::new(1080, 2400);
        let rotated = compute(&video(1080, 1920, 90), &screen, Offset::ZERO).unwrap();
        let upright = compute(&video(1920, 1080, 0), &screen, Offset::ZERO).unwrap();

        assert_eq!(rotated.scale, upright.scale);
        assert_eq!(rotated.axis, upright.axis);
        assert_eq!(rotated.max_offset, upright.max_offset);
    }

    #[test]
    fn test_rotation_maps_corner_into_rotated_position() {
        let screen = ScreenGeometry::new(1000, 1000);
        let transform = compute(&video(500, 500, 90), &screen, Offset::ZERO).unwrap();

        // Rotating by -90 degrees sends +x to -y.
        let corner = transform.matrix.transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert!(corner.x.abs() < EPSILON);
        assert!((corner.y + 1.0).abs() < EPSILON);
    }

    #[test]
    fn test_offset_only_moves_cropped_axis() {
        let screen = ScreenGeometry::new(1080, 2400);
        let transform = compute(&video(1920, 1080, 0), &screen, Offset::new(0.1, 0.3)).unwrap();

        assert!((transform.offset.x - 0.1).abs() < EPSILON);
        assert_eq!(transform.offset.y, 0.0);
        let origin = transform.matrix.transform_point3(Vec3::ZERO);
        assert!((origin.x - 0.1 * transform.scale.x).abs() < EPSILON);
        assert_eq!(origin.y, 0.0);
    }

    #[test]
    fn test_offset_is_clamped_to_crop_slack() {
        let screen = ScreenGeometry::new(1080, 2400);
        let transform = compute(&video(1920, 1080, 0), &screen, Offset::new(5.0, 0.0)).unwrap();

        let screen_ratio = 1080.0 / 2400.0;
        let video_ratio = 1920.0 / 1080.0;
        let max_x = (1.0 - screen_ratio / video_ratio) / 2.0;
        assert!((transform.offset.x - max_x).abs() < EPSILON);
    }

    #[test]
    fn test_non_finite_offset_is_zeroed() {
        assert_eq!(clamp_component(f32::NAN, 0.3), 0.0);
        assert_eq!(clamp_component(f32::INFINITY, 0.3), 0.0);
    }

    #[test]
    fn test_zero_dimensions_fail() {
        let screen = ScreenGeometry::new(1080, 2400);
        let err = compute(&video(0, 1080, 0), &screen, Offset::ZERO).unwrap_err();
        assert!(matches!(err, EngineError::InvalidGeometry(_)));

        let err = compute(&video(1920, 1080, 0), &ScreenGeometry::new(0, 0), Offset::ZERO)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidGeometry(_)));
    }

    #[test]
    fn test_calculator_skips_unchanged_inputs() {
        let mut calc = CropCalculator::new();
        let v = video(1920, 1080, 0);
        let s = ScreenGeometry::new(1080, 2400);

        assert!(calc.update(v, s, Offset::ZERO).unwrap());
        assert!(!calc.update(v, s, Offset::ZERO).unwrap());
        assert!(calc.update(v, s, Offset::new(0.1, 0.0)).unwrap());
        assert!(calc.update(v, ScreenGeometry::new(2400, 1080), Offset::new(0.1, 0.0)).unwrap());
    }

    #[test]
    fn test_calculator_drops_transform_on_error() {
        let mut calc = CropCalculator::new();
        let s = ScreenGeometry::new(1080, 2400);
        calc.update(video(1920, 1080, 0), s, Offset::ZERO).unwrap();
        assert!(calc.current().is_some());

        assert!(calc.update(video(0, 0, 0), s, Offset::ZERO).is_err());
        assert!(calc.current().is_none());
    }

    proptest! {
        #[test]
        fn prop_scale_follows_ratio_branch(
            vw in 1u32..8000, vh in 1u32..8000, sw in 1u32..8000, sh in 1u32..8000,
        ) {
            let v = video(vw, vh, 0);
            let s = ScreenGeometry::new(sw, sh);
            let t = compute(&v, &s, Offset::ZERO).unwrap();
            let video_ratio = vw as f32 / vh as f32;
            let screen_ratio = sw as f32 / sh as f32;

            if video_ratio >= screen_ratio {
                prop_assert_eq!(t.scale.x, video_ratio / screen_ratio);
                prop_assert_eq!(t.scale.y, 1.0);
            } else {
                prop_assert_eq!(t.scale.x, 1.0);
                prop_assert_eq!(t.scale.y, screen_ratio / video_ratio);
            }
            prop_assert!(t.scale.x >= 1.0 && t.scale.y >= 1.0);
        }

        #[test]
        fn prop_compute_is_idempotent(
            vw in 1u32..8000, vh in 1u32..8000, sw in 1u32..8000, sh in 1u32..8000,
            quarter in 0i32..4, ox in -2.0f32..2.0, oy in -2.0f32..2.0,
        ) {
            let v = video(vw, vh, quarter * 90);
            let s = ScreenGeometry::new(sw, sh);
            let first = compute(&v, &s, Offset::new(ox, oy)).unwrap();
            let second = compute(&v, &s, Offset::new(ox, oy)).unwrap();

            let a = first.to_cols_array().map(f32::to_bits);
            let b = second.to_cols_array().map(f32::to_bits);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_clamp_is_symmetric(max in 0.0f32..0.5, x in 0.5f32..100.0) {
            prop_assert_eq!(clamp_component(x, max), -clamp_component(-x, max));
            prop_assert_eq!(clamp_component(x, max), max);
        }
    }
}
