//! Pinhole camera intrinsics and meter/pixel conversions.

use nalgebra::{Point2, Vector3};
use serde::{Deserialize, Serialize};

/// Pinhole camera intrinsics (no distortion).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Pixel `(u, v)` to normalized image-plane coordinates `(x, y)`.
    #[inline]
    pub fn pixel_to_normalized(&self, pixel: &Point2<f64>) -> Point2<f64> {
        Point2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }

    /// Normalized `(x, y)` to pixel `(u, v)`.
    #[inline]
    pub fn normalized_to_pixel(&self, normalized: &Point2<f64>) -> Point2<f64> {
        Point2::new(
            normalized.x * self.fx + self.cx,
            normalized.y * self.fy + self.cy,
        )
    }

    /// Perspective projection of a camera-frame point to normalized coordinates.
    /// Returns `None` for points on or behind the image plane.
    #[inline]
    pub fn project_normalized(p_cam: &Vector3<f64>) -> Option<Point2<f64>> {
        if p_cam.z <= f64::EPSILON {
            return None;
        }
        Some(Point2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z))
    }

    /// Perspective projection of a camera-frame point to pixels.
    #[inline]
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Point2<f64>> {
        Self::project_normalized(p_cam).map(|n| self.normalized_to_pixel(&n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pixel_normalized_roundtrip() {
        let cam = CameraModel::new(600.0, 610.0, 320.0, 240.0);
        let px = Point2::new(100.5, 400.25);

        let back = cam.normalized_to_pixel(&cam.pixel_to_normalized(&px));
        assert_relative_eq!(back, px, epsilon = 1e-12);
    }

    #[test]
    fn test_project_principal_point() {
        let cam = CameraModel::new(600.0, 600.0, 320.0, 240.0);
        let px = cam.project(&Vector3::new(0.0, 0.0, 2.0)).unwrap();
        assert_relative_eq!(px, Point2::new(320.0, 240.0));
    }

    #[test]
    fn test_project_behind_camera() {
        let cam = CameraModel::new(600.0, 600.0, 320.0, 240.0);
        assert!(cam.project(&Vector3::new(0.1, 0.1, -1.0)).is_none());
    }
}
