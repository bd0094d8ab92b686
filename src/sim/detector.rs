//! Fiducial detector that "sees" the flashcode by projecting it under a
//! ground-truth pose.

use std::time::Duration;

use image::RgbaImage;
use nalgebra::{Point2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TrackerConfig;
use crate::geometry::{CameraModel, SE3};
use crate::tracking::collaborators::FiducialDetector;
use crate::tracking::roi::{project_points, Roi};

/// One `detect` call, as seen by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectCall {
    /// Searched region in full-frame pixels.
    pub region: Roi,
    pub timeout: Duration,
    pub found: bool,
}

#[derive(Debug, Clone)]
enum Dropout {
    Never,
    /// Fail each call with the given probability.
    Random { rate: f64, rng: StdRng },
}

#[derive(Debug, Clone)]
pub struct SimulatedDetector {
    flashcode: Vec<Vector3<f64>>,
    truth: Option<(SE3, CameraModel)>,
    dropout: Dropout,
    /// Calls to fail before falling back to `dropout`.
    forced_failures: usize,
    polygon: Vec<Point2<f64>>,
    calls: Vec<DetectCall>,
}

impl SimulatedDetector {
    pub fn new(flashcode: Vec<Vector3<f64>>) -> Self {
        Self {
            flashcode,
            truth: None,
            dropout: Dropout::Never,
            forced_failures: 0,
            polygon: Vec::new(),
            calls: Vec::new(),
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.marker.flashcode_points())
    }

    /// Drop detections at random with probability `rate`. A non-finite rate
    /// never drops.
    pub fn with_drop_rate(mut self, rate: f64, seed: u64) -> Self {
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        self.dropout = Dropout::Random {
            rate,
            rng: StdRng::seed_from_u64(seed),
        };
        self
    }

    /// Where the flashcode is in the next frame.
    pub fn set_truth(&mut self, pose: SE3, camera: CameraModel) {
        self.truth = Some((pose, camera));
    }

    /// Flashcode not visible at all.
    pub fn clear_truth(&mut self) {
        self.truth = None;
    }

    /// Fail the next `n` calls regardless of visibility.
    pub fn fail_next(&mut self, n: usize) {
        self.forced_failures += n;
    }

    pub fn calls(&self) -> &[DetectCall] {
        &self.calls
    }

    fn dropped(&mut self) -> bool {
        if self.forced_failures > 0 {
            self.forced_failures -= 1;
            return true;
        }
        match &mut self.dropout {
            Dropout::Never => false,
            Dropout::Random { rate, rng } => rng.gen_bool(*rate),
        }
    }

    fn locate(&self, region: &Roi) -> Option<Vec<Point2<f64>>> {
        let (pose, camera) = self.truth.as_ref()?;
        let corners: Vec<Point2<f64>> = project_points(&self.flashcode, pose, camera)
            .into_iter()
            .collect::<Option<_>>()?;

        let x1 = f64::from(region.x + region.width);
        let y1 = f64::from(region.y + region.height);
        let inside = corners.iter().all(|c| {
            c.x >= f64::from(region.x) && c.y >= f64::from(region.y) && c.x < x1 && c.y < y1
        });
        inside.then_some(corners)
    }
}

impl FiducialDetector for SimulatedDetector {
    fn detect(&mut self, region: &RgbaImage, timeout: Duration, origin: Point2<u32>) -> bool {
        let region = Roi {
            x: origin.x,
            y: origin.y,
            width: region.width(),
            height: region.height(),
        };

        let found = if self.dropped() {
            None
        } else {
            self.locate(&region)
        };

        let success = found.is_some();
        if let Some(polygon) = found {
            self.polygon = polygon;
        }
        self.calls.push(DetectCall {
            region,
            timeout,
            found: success,
        });
        success
    }

    fn polygon(&self) -> Vec<Point2<f64>> {
        self.polygon.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarkerConfig;
    use nalgebra::UnitQuaternion;

    fn detector() -> SimulatedDetector {
        let config = TrackerConfig {
            marker: MarkerConfig::square(0.03, 0.04, 0.05),
            ..Default::default()
        };
        let mut detector = SimulatedDetector::from_config(&config);
        let pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, 0.5),
        };
        detector.set_truth(pose, CameraModel::new(500.0, 500.0, 320.0, 240.0));
        detector
    }

    #[test]
    fn test_nan_drop_rate_never_drops() {
        let mut detector = detector().with_drop_rate(f64::NAN, 7);
        let frame = RgbaImage::new(640, 480);
        for _ in 0..20 {
            assert!(detector.detect(&frame, Duration::from_millis(100), Point2::new(0, 0)));
        }
    }

    #[test]
    fn test_detects_visible_flashcode() {
        let mut detector = detector();
        let frame = RgbaImage::new(640, 480);
        assert!(detector.detect(&frame, Duration::from_millis(100), Point2::new(0, 0)));

        let polygon = detector.polygon();
        assert_eq!(polygon.len(), 4);
        assert!((polygon[0].x - 290.0).abs() < 1e-9);
        assert!((polygon[2].y - 270.0).abs() < 1e-9);
    }

    #[test]
    fn test_region_must_contain_flashcode() {
        let mut detector = detector();
        let region = RgbaImage::new(100, 100);
        assert!(!detector.detect(&region, Duration::ZERO, Point2::new(0, 0)));
        assert!(detector.detect(&region, Duration::ZERO, Point2::new(260, 200)));
        assert_eq!(detector.calls().len(), 2);
        assert!(!detector.calls()[0].found);
    }

    #[test]
    fn test_forced_failures() {
        let mut detector = detector();
        detector.fail_next(2);
        let frame = RgbaImage::new(640, 480);
        let results: Vec<bool> = (0..3)
            .map(|_| detector.detect(&frame, Duration::ZERO, Point2::new(0, 0)))
            .collect();
        assert_eq!(results, vec![false, false, true]);
    }
}
