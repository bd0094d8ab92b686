//! Contracts of the external components driven by the tracker.
//!
//! All calls are blocking from the tracker's point of view and must not call
//! back into it.

use std::time::Duration;

use anyhow::Result;
use image::{GrayImage, RgbaImage};
use nalgebra::{Matrix6, Point2};

use crate::geometry::{CameraModel, Correspondence, SE3};

/// Flashcode (datamatrix/QR) detector.
pub trait FiducialDetector {
    /// Search `region` for the marker within `timeout`. `origin` is the
    /// position of `region` inside the full frame.
    fn detect(&mut self, region: &RgbaImage, timeout: Duration, origin: Point2<u32>) -> bool;

    /// Corners of the last successful detection in full-frame pixels,
    /// clockwise. Only meaningful right after `detect` returned `true`.
    fn polygon(&self) -> Vec<Point2<f64>>;
}

/// Pose from point correspondences (closed form + iterative refinement).
pub trait PoseEstimator {
    /// Estimate `cMo`; `None` when the correspondences do not admit a pose.
    fn estimate(&self, correspondences: &[Correspondence]) -> Option<SE3>;
}

/// Output of one model-tracking iteration.
#[derive(Debug, Clone)]
pub struct TrackOutput {
    pub pose: SE3,
    /// Pose covariance, DOF order `(x, y, z, wx, wy, wz)`. `None` when the
    /// tracker does not estimate one.
    pub covariance: Option<Matrix6<f64>>,
}

/// Frame-to-frame model-based tracker. Keeps its own internal model between
/// calls.
pub trait ModelTracker {
    /// Start tracking from `pose`, then run `convergence_steps` iterations on
    /// the same image.
    fn init(
        &mut self,
        gray: &GrayImage,
        camera: &CameraModel,
        pose: &SE3,
        convergence_steps: u32,
    ) -> Result<()>;

    /// Track into a new frame.
    fn track(&mut self, gray: &GrayImage, camera: &CameraModel) -> Result<TrackOutput>;

    /// Search range hint in pixels, sized to the apparent marker band.
    fn set_search_range(&mut self, _range_px: u32) {}
}
