//! Geometry utilities: SE3 poses, camera model, planar pose estimation.

pub mod camera;
pub mod pnp;
pub mod se3;
pub mod so3;

pub use camera::CameraModel;
pub use pnp::{correspondences_from_pixels, Correspondence, PlanarPoseEstimator, PoseResult};
pub use se3::SE3;
