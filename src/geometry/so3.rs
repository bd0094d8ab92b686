//! SO(3) helpers: skew matrices and the exponential/logarithm maps used to
//! parameterize poses as `θu` rotation vectors.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Rodrigues' formula:
///
/// ```text
/// exp(θu) = I + sin θ/θ [θu]× + (1 - cos θ)/θ² [θu]×²
/// ```
pub fn exp(theta_u: &Vector3<f64>) -> UnitQuaternion<f64> {
    let theta = theta_u.norm();
    let k = skew(theta_u);

    let r = if theta < SMALL_ANGLE_THRESHOLD {
        Matrix3::identity() + k + 0.5 * k * k
    } else {
        let theta_sq = theta * theta;
        Matrix3::identity() + (theta.sin() / theta) * k + ((1.0 - theta.cos()) / theta_sq) * (k * k)
    };

    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r))
}

/// Rotation vector `θu` of a rotation, with `θ ∈ [0, π]`.
pub fn log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}
