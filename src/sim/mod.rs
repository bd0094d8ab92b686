//! Deterministic synthetic collaborators: a rendered marker scene, a
//! projecting flashcode detector and a scripted model tracker.
//!
//! Used by the lifecycle tests and by the `simulate` command.

pub mod detector;
pub mod model_tracker;
pub mod render;

pub use detector::{DetectCall, SimulatedDetector};
pub use model_tracker::{ScriptedModelTracker, TrackStep};
pub use render::render_marker;

use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::{CameraModel, SE3};
use crate::tracking::event::Frame;
use crate::tracking::marker::MarkerModel;

/// Fixed camera looking at the marker.
#[derive(Debug, Clone)]
pub struct Scene {
    pub camera: CameraModel,
    pub width: u32,
    pub height: u32,
    model: MarkerModel,
}

impl Scene {
    pub fn new(model: MarkerModel, camera: CameraModel, width: u32, height: u32) -> Self {
        Self {
            camera,
            width,
            height,
            model,
        }
    }

    /// VGA camera with a 500 px focal length.
    pub fn vga(model: MarkerModel) -> Self {
        Self::new(model, CameraModel::new(500.0, 500.0, 320.0, 240.0), 640, 480)
    }

    /// Render the marker at `pose`.
    pub fn frame(&self, index: u64, pose: &SE3) -> Frame {
        let image = render_marker(&self.model, pose, &self.camera, self.width, self.height);
        Frame::new(index, image, self.camera)
    }
}

/// Smooth marker motion in front of the camera, about half a meter away.
pub fn demo_trajectory(k: u64) -> SE3 {
    let t = k as f64 * 0.05;
    SE3 {
        rotation: UnitQuaternion::from_euler_angles(0.25 * t.sin(), 0.2 * (0.7 * t).cos() - 0.2, 0.1 * t),
        translation: Vector3::new(0.06 * t.sin(), 0.04 * (0.5 * t).sin(), 0.5 + 0.05 * (0.3 * t).sin()),
    }
}
