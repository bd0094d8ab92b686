//! Rigid-body transform used for camera/object poses.
//!
//! Poses in this crate are `cMo`: they map object (marker) coordinates into
//! the camera frame.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3, Vector6};

use crate::geometry::so3;

/// Rigid transform `p' = R p + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix and a translation. The matrix is assumed
    /// orthonormal.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// `self * other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Decoupled exponential map from `(ω, t)`: rotation `exp(ω)`, translation `t`.
    pub fn exp(params: &Vector6<f64>) -> Self {
        let omega = Vector3::new(params[0], params[1], params[2]);
        Self {
            rotation: so3::exp(&omega),
            translation: Vector3::new(params[3], params[4], params[5]),
        }
    }

    /// Inverse of [`SE3::exp`]: `(ω, t)`.
    pub fn log(&self) -> Vector6<f64> {
        let omega = so3::log(&self.rotation);
        Vector6::new(
            omega.x,
            omega.y,
            omega.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }

    /// Pose vector `(tx, ty, tz, θux, θuy, θuz)` as written to the diagnostic log.
    pub fn to_pose_vector(&self) -> Vector6<f64> {
        let theta_u = so3::log(&self.rotation);
        Vector6::new(
            self.translation.x,
            self.translation.y,
            self.translation.z,
            theta_u.x,
            theta_u.y,
            theta_u.z,
        )
    }

    /// Angle (radians) and translation distance between two poses.
    pub fn distance(&self, other: &SE3) -> (f64, f64) {
        let dq = self.rotation.inverse() * other.rotation;
        (dq.angle(), (self.translation - other.translation).norm())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_inverse_roundtrip() {
        let pose = SE3::exp(&Vector6::new(0.1, -0.2, 0.3, 0.5, -0.1, 2.0));
        let p = Vector3::new(0.3, 0.4, -0.2);

        let back = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_sequential_transform() {
        let a = SE3::exp(&Vector6::new(0.0, 0.2, 0.0, 1.0, 0.0, 0.0));
        let b = SE3::exp(&Vector6::new(0.1, 0.0, -0.3, 0.0, 2.0, 0.5));
        let p = Vector3::new(1.0, 2.0, 3.0);

        let direct = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(a.compose(&b).transform_point(&p), direct, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_log() {
        let params = Vector6::new(0.4, -0.1, 0.25, 0.01, 0.02, 0.5);
        assert_relative_eq!(SE3::exp(&params).log(), params, epsilon = 1e-10);
    }

    #[test]
    fn test_pose_vector_layout() {
        let pose = SE3::exp(&Vector6::new(0.0, 0.0, 0.5, 1.0, 2.0, 3.0));
        let v = pose.to_pose_vector();
        assert_relative_eq!(v[0], 1.0);
        assert_relative_eq!(v[2], 3.0);
        assert_relative_eq!(v[5], 0.5, epsilon = 1e-12);
    }
}
