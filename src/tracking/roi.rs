//! Model projection and the region of interest used for local re-detection.

use std::time::Duration;

use nalgebra::{Point2, Vector3};
use serde::Serialize;

use crate::geometry::{CameraModel, SE3};
use crate::tracking::marker::MarkerModel;

/// Axis-aligned pixel rectangle, always inside `[0, width] x [0, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Integer bounding rectangle of `points` (inclusive of the extreme
    /// pixels), clipped to the image.
    pub fn bounding(points: &[Point2<f64>], image_width: u32, image_height: u32) -> Self {
        let mut iter = points.iter().filter(|p| p.x.is_finite() && p.y.is_finite());
        let Some(first) = iter.next() else {
            return Self::default();
        };

        let (mut min_x, mut min_y) = (first.x as i64, first.y as i64);
        let (mut max_x, mut max_y) = (min_x, min_y);
        for p in iter {
            let (x, y) = (p.x as i64, p.y as i64);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        Self::clipped(min_x, min_y, max_x + 1, max_y + 1, image_width, image_height)
    }

    /// Clip the half-open rectangle `[x0, x1) x [y0, y1)` to the image.
    pub fn clipped(x0: i64, y0: i64, x1: i64, y1: i64, image_width: u32, image_height: u32) -> Self {
        let (w, h) = (i64::from(image_width), i64::from(image_height));
        let sx = x0.clamp(0, w);
        let sy = y0.clamp(0, h);
        let dx = x1.clamp(sx, w);
        let dy = y1.clamp(sy, h);

        Self {
            x: sx as u32,
            y: sy as u32,
            width: (dx - sx) as u32,
            height: (dy - sy) as u32,
        }
    }

    /// Detection budget proportional to the searched area:
    /// `timeout × roi_area / frame_area`.
    pub fn scaled_timeout(&self, timeout: Duration, image_width: u32, image_height: u32) -> Duration {
        let frame_area = u64::from(image_width) * u64::from(image_height);
        if frame_area == 0 {
            return Duration::ZERO;
        }
        let ms = timeout.as_millis() as f64 * self.area() as f64 / frame_area as f64;
        Duration::from_millis(ms as u64)
    }
}

/// Project object points to pixels under `pose`; points behind the camera
/// project to `None`.
pub fn project_points(
    points: &[Vector3<f64>],
    pose: &SE3,
    camera: &CameraModel,
) -> Vec<Option<Point2<f64>>> {
    points
        .iter()
        .map(|p| camera.project(&pose.transform_point(p)))
        .collect()
}

/// Outer and inner marker outlines projected under one pose.
#[derive(Debug, Clone)]
pub struct ModelProjection {
    pub outer: Vec<Option<Point2<f64>>>,
    pub inner: Vec<Option<Point2<f64>>>,
}

impl ModelProjection {
    pub fn new(model: &MarkerModel, pose: &SE3, camera: &CameraModel) -> Self {
        Self {
            outer: project_points(model.outer(), pose, camera),
            inner: project_points(model.inner(), pose, camera),
        }
    }

    /// Clipped bounding rectangle of the projected outer outline.
    pub fn roi(&self, image_width: u32, image_height: u32) -> Roi {
        let visible: Vec<Point2<f64>> = self.outer.iter().flatten().copied().collect();
        Roi::bounding(&visible, image_width, image_height)
    }

    /// Mean of `|u - u_inner|` and `|v - v_inner|` over all landmarks: the
    /// apparent width of the dark band in pixels.
    pub fn mean_band_width(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for (outer, inner) in self.outer.iter().zip(self.inner.iter()) {
            if let (Some(o), Some(i)) = (outer, inner) {
                sum += (o.x - i.x).abs() + (o.y - i.y).abs();
                count += 2;
            }
        }
        (count > 0).then(|| sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MarkerConfig, TrackerConfig};
    use nalgebra::UnitQuaternion;

    fn model() -> MarkerModel {
        let config = TrackerConfig {
            marker: MarkerConfig::square(0.03, 0.04, 0.05),
            ..Default::default()
        };
        MarkerModel::from_config(&config).unwrap()
    }

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0)
    }

    fn pose_at(x: f64, y: f64, z: f64) -> SE3 {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(x, y, z),
        }
    }

    #[test]
    fn test_bounding_inside_image() {
        let pts = [Point2::new(10.7, 20.2), Point2::new(30.1, 40.9)];
        let roi = Roi::bounding(&pts, 640, 480);
        assert_eq!(
            roi,
            Roi {
                x: 10,
                y: 20,
                width: 21,
                height: 21
            }
        );
    }

    #[test]
    fn test_bounding_is_clipped() {
        let cases = [
            vec![Point2::new(-50.0, -20.0), Point2::new(100.0, 90.0)],
            vec![Point2::new(600.0, 400.0), Point2::new(900.0, 700.0)],
            vec![Point2::new(-10.0, 100.0), Point2::new(700.0, 500.0)],
            vec![Point2::new(-100.0, -100.0), Point2::new(-50.0, -50.0)],
        ];
        for pts in cases {
            let roi = Roi::bounding(&pts, 640, 480);
            assert!(roi.x + roi.width <= 640, "{roi:?}");
            assert!(roi.y + roi.height <= 480, "{roi:?}");
        }

        let left = Roi::bounding(&[Point2::new(-50.0, -20.0), Point2::new(100.0, 90.0)], 640, 480);
        assert_eq!((left.x, left.y, left.width, left.height), (0, 0, 101, 91));

        let outside = Roi::bounding(&[Point2::new(-100.0, -100.0), Point2::new(-50.0, -50.0)], 640, 480);
        assert!(outside.is_empty());
    }

    #[test]
    fn test_bounding_of_nothing_is_empty() {
        assert!(Roi::bounding(&[], 640, 480).is_empty());
    }

    #[test]
    fn test_scaled_timeout() {
        let roi = Roi {
            x: 0,
            y: 0,
            width: 320,
            height: 240,
        };
        let t = roi.scaled_timeout(Duration::from_millis(1000), 640, 480);
        assert_eq!(t, Duration::from_millis(250));
        assert_eq!(
            Roi::full(640, 480).scaled_timeout(Duration::from_millis(1000), 640, 480),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_projection_roi_centered_marker() {
        let projection = ModelProjection::new(&model(), &pose_at(0.0, 0.0, 0.5), &camera());
        let roi = projection.roi(640, 480);

        // outer half-size 0.05 m at 0.5 m → 50 px
        assert_eq!((roi.x, roi.y), (270, 190));
        assert_eq!((roi.width, roi.height), (101, 101));

        let band = projection.mean_band_width().unwrap();
        assert!((band - 10.0).abs() < 1e-9, "band width {band}");
    }

    #[test]
    fn test_projection_near_border_is_clipped() {
        let projection = ModelProjection::new(&model(), &pose_at(0.3, 0.2, 0.5), &camera());
        let roi = projection.roi(640, 480);
        assert!(roi.x + roi.width <= 640);
        assert!(roi.y + roi.height <= 480);
        assert!(!roi.is_empty());
    }

    #[test]
    fn test_projection_behind_camera() {
        let projection = ModelProjection::new(&model(), &pose_at(0.0, 0.0, -0.5), &camera());
        assert!(projection.roi(640, 480).is_empty());
        assert!(projection.mean_band_width().is_none());
    }
}
