//! Planar pose estimation from 3D–2D correspondences.
//!
//! Two stages, like the classic Lagrange + virtual visual servoing pipeline:
//! - closed form: DLT homography between the marker plane and the normalized
//!   image plane, decomposed into `[r1 r2 t]`
//! - iterative: Levenberg–Marquardt on normalized reprojection residuals over
//!   all 6 degrees of freedom

use std::cmp::Ordering;

use anyhow::{anyhow, bail, Result};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn, Matrix3, Point2, Vector3, Vector6};
use tracing::debug;

use crate::geometry::camera::CameraModel;
use crate::geometry::SE3;
use crate::tracking::collaborators::PoseEstimator;

/// Minimum number of correspondences for a homography.
const MIN_CORRESPONDENCES: usize = 4;

/// Step used for the central-difference Jacobian.
const JACOBIAN_STEP: f64 = 1e-7;

/// A marker point paired with its observation on the normalized image plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Marker coordinates (object frame).
    pub object: Vector3<f64>,
    /// Normalized image coordinates `(x, y)`.
    pub normalized: Point2<f64>,
}

/// Result of pose estimation.
#[derive(Debug, Clone)]
pub struct PoseResult {
    /// Estimated `cMo`.
    pub pose: SE3,
    /// Reprojection error per correspondence (normalized units).
    pub reproj_errors: Vec<f64>,
    /// Root mean square of `reproj_errors`.
    pub rms: f64,
}

/// Closed-form + LM pose estimator for planar markers.
#[derive(Debug, Clone)]
pub struct PlanarPoseEstimator {
    /// Reject poses whose RMS reprojection error (normalized units) exceeds this.
    pub max_rms: f64,
    /// LM patience (function evaluations per parameter).
    pub max_iterations: usize,
    /// Out-of-plane spread tolerated, relative to the in-plane spread.
    pub planarity_tolerance: f64,
}

impl Default for PlanarPoseEstimator {
    fn default() -> Self {
        Self {
            max_rms: 0.02,
            max_iterations: 100,
            planarity_tolerance: 1e-3,
        }
    }
}

impl PlanarPoseEstimator {
    pub fn with_max_rms(max_rms: f64) -> Self {
        Self {
            max_rms,
            ..Default::default()
        }
    }

    /// Estimate `cMo`, reporting why estimation failed.
    pub fn estimate_detailed(&self, correspondences: &[Correspondence]) -> Result<PoseResult> {
        let n = correspondences.len();
        if n < MIN_CORRESPONDENCES {
            bail!("need at least {MIN_CORRESPONDENCES} correspondences, got {n}");
        }

        let objects: Vec<Vector3<f64>> = correspondences.iter().map(|c| c.object).collect();
        let frame = PlaneFrame::fit(&objects, self.planarity_tolerance)?;

        // Stage 1: closed form from the plane homography
        let plane_points: Vec<Point2<f64>> = objects.iter().map(|p| frame.to_plane(p)).collect();
        let image_points: Vec<Point2<f64>> = correspondences.iter().map(|c| c.normalized).collect();
        let h = dlt_homography(&plane_points, &image_points)?;
        let c_m_p = pose_from_homography(&h)?;
        let initial = c_m_p.compose(&frame.plane_from_object());

        let initial_cost = residual_cost(correspondences, &initial)
            .ok_or_else(|| anyhow!("closed-form pose places marker behind the camera"))?;

        // Stage 2: iterative refinement
        let problem = PoseRefinement {
            correspondences,
            params: DVector::from_column_slice(initial.log().as_slice()),
        };
        let lm = LevenbergMarquardt::new().with_patience(self.max_iterations.max(1));
        let (problem, report) = lm.minimize(problem);

        let refined = pose_from_params(&problem.params());
        let pose = match residual_cost(correspondences, &refined) {
            Some(cost) if cost.is_finite() && cost <= initial_cost => refined,
            _ => {
                debug!(
                    termination = ?report.termination,
                    "pose refinement did not improve the closed-form pose"
                );
                initial
            }
        };

        let reproj_errors = reprojection_errors(correspondences, &pose)
            .ok_or_else(|| anyhow!("refined pose places marker behind the camera"))?;
        let rms = (reproj_errors.iter().map(|e| e * e).sum::<f64>() / n as f64).sqrt();
        if !rms.is_finite() || rms > self.max_rms {
            bail!("reprojection rms {rms:.5} above limit {:.5}", self.max_rms);
        }

        Ok(PoseResult {
            pose,
            reproj_errors,
            rms,
        })
    }
}

impl PoseEstimator for PlanarPoseEstimator {
    fn estimate(&self, correspondences: &[Correspondence]) -> Option<SE3> {
        match self.estimate_detailed(correspondences) {
            Ok(result) => {
                debug!(rms = result.rms, "pose estimated");
                Some(result.pose)
            }
            Err(err) => {
                debug!("pose estimation failed: {err:#}");
                None
            }
        }
    }
}

/// Build correspondences from marker points and their pixel observations.
pub fn correspondences_from_pixels(
    objects: &[Vector3<f64>],
    pixels: &[Point2<f64>],
    camera: &CameraModel,
) -> Vec<Correspondence> {
    objects
        .iter()
        .zip(pixels.iter())
        .map(|(object, pixel)| Correspondence {
            object: *object,
            normalized: camera.pixel_to_normalized(pixel),
        })
        .collect()
}

/// Orthonormal frame attached to the marker plane: origin at the centroid,
/// `e1`, `e2` in-plane, `n = e1 × e2`.
struct PlaneFrame {
    origin: Vector3<f64>,
    basis: Matrix3<f64>,
}

impl PlaneFrame {
    fn fit(points: &[Vector3<f64>], tolerance: f64) -> Result<Self> {
        let origin = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / points.len() as f64;

        let mut scatter = Matrix3::zeros();
        for p in points {
            let d = p - origin;
            scatter += d * d.transpose();
        }

        let eig = scatter.symmetric_eigen();
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| {
            eig.eigenvalues[b]
                .partial_cmp(&eig.eigenvalues[a])
                .unwrap_or(Ordering::Equal)
        });

        let largest = eig.eigenvalues[order[0]];
        let middle = eig.eigenvalues[order[1]];
        let smallest = eig.eigenvalues[order[2]].max(0.0);
        if largest <= f64::EPSILON || middle <= largest * 1e-12 {
            bail!("marker points are degenerate (coincident or collinear)");
        }
        if smallest.sqrt() > tolerance * largest.sqrt() {
            bail!("marker points are not coplanar");
        }

        let e1 = eig.eigenvectors.column(order[0]).into_owned();
        let e2 = eig.eigenvectors.column(order[1]).into_owned();
        let n = e1.cross(&e2);

        let mut basis = Matrix3::zeros();
        basis.set_column(0, &e1);
        basis.set_column(1, &e2);
        basis.set_column(2, &n);

        Ok(Self { origin, basis })
    }

    fn to_plane(&self, p: &Vector3<f64>) -> Point2<f64> {
        let local = self.basis.transpose() * (p - self.origin);
        Point2::new(local.x, local.y)
    }

    /// Transform taking object coordinates into plane coordinates.
    fn plane_from_object(&self) -> SE3 {
        let r = self.basis.transpose();
        SE3::from_rt(r, -(r * self.origin))
    }
}

/// Similarity that centers points and scales their mean distance to √2.
fn normalizing_transform(points: &[Point2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn apply(t: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let q = t * Vector3::new(p.x, p.y, 1.0);
    Point2::new(q.x / q.z, q.y / q.z)
}

/// Estimate `H` such that `image ~ H plane` using the normalized DLT.
fn dlt_homography(plane: &[Point2<f64>], image: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    let n = plane.len();
    let t_plane = normalizing_transform(plane);
    let t_image = normalizing_transform(image);

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (pw, pi)) in plane.iter().zip(image.iter()).enumerate() {
        let w = apply(&t_plane, pw);
        let m = apply(&t_image, pi);
        let (x, y, u, v) = (w.x, w.y, m.x, m.y);

        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // Null vector of A via the 9x9 normal matrix (A is only 8x9 for four points)
    let ata = a.transpose() * &a;
    let svd = ata.svd(false, true);
    let v_t = svd.v_t.ok_or_else(|| anyhow!("svd failed"))?;
    let mut min_idx = 0;
    for i in 1..svd.singular_values.len() {
        if svd.singular_values[i] < svd.singular_values[min_idx] {
            min_idx = i;
        }
    }
    let h = v_t.row(min_idx);

    let mut h_norm = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h_norm[(r, c)] = h[3 * r + c];
        }
    }

    let t_image_inv = t_image
        .try_inverse()
        .ok_or_else(|| anyhow!("degenerate image points"))?;
    let h_mat = t_image_inv * h_norm * t_plane;
    if h_mat.iter().any(|v| !v.is_finite()) {
        bail!("homography is not finite");
    }
    Ok(h_mat)
}

/// Decompose a plane-to-normalized-image homography into `cMp` with the
/// plane in front of the camera.
fn pose_from_homography(h: &Matrix3<f64>) -> Result<SE3> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm_sum = h1.norm() + h2.norm();
    if norm_sum <= f64::EPSILON {
        bail!("degenerate homography");
    }
    let mut lambda = 2.0 / norm_sum;
    if lambda * h3.z < 0.0 {
        lambda = -lambda;
    }

    let r1 = lambda * h1;
    let r2 = lambda * h2;
    let r3 = r1.cross(&r2);

    let mut r_mat = Matrix3::zeros();
    r_mat.set_column(0, &r1);
    r_mat.set_column(1, &r2);
    r_mat.set_column(2, &r3);

    // Project onto SO(3)
    let svd = r_mat.svd(true, true);
    let u = svd.u.ok_or_else(|| anyhow!("svd failed"))?;
    let v_t = svd.v_t.ok_or_else(|| anyhow!("svd failed"))?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    Ok(SE3::from_rt(r_orth, lambda * h3))
}

fn pose_from_params(params: &DVector<f64>) -> SE3 {
    SE3::exp(&Vector6::from_column_slice(params.as_slice()))
}

/// Stacked `(dx, dy)` residuals; `None` if a point falls behind the camera.
fn residuals(correspondences: &[Correspondence], pose: &SE3) -> Option<DVector<f64>> {
    let mut r = DVector::zeros(correspondences.len() * 2);
    for (i, c) in correspondences.iter().enumerate() {
        let projected = CameraModel::project_normalized(&pose.transform_point(&c.object))?;
        r[2 * i] = projected.x - c.normalized.x;
        r[2 * i + 1] = projected.y - c.normalized.y;
    }
    Some(r)
}

fn residual_cost(correspondences: &[Correspondence], pose: &SE3) -> Option<f64> {
    residuals(correspondences, pose).map(|r| r.norm_squared())
}

fn reprojection_errors(correspondences: &[Correspondence], pose: &SE3) -> Option<Vec<f64>> {
    let r = residuals(correspondences, pose)?;
    Some(
        (0..correspondences.len())
            .map(|i| (r[2 * i].powi(2) + r[2 * i + 1].powi(2)).sqrt())
            .collect(),
    )
}

struct PoseRefinement<'a> {
    correspondences: &'a [Correspondence],
    params: DVector<f64>,
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PoseRefinement<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        residuals(self.correspondences, &pose_from_params(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let rows = self.correspondences.len() * 2;
        let mut jac = DMatrix::zeros(rows, 6);
        for k in 0..6 {
            let mut plus = self.params.clone();
            let mut minus = self.params.clone();
            plus[k] += JACOBIAN_STEP;
            minus[k] -= JACOBIAN_STEP;

            let r_plus = residuals(self.correspondences, &pose_from_params(&plus))?;
            let r_minus = residuals(self.correspondences, &pose_from_params(&minus))?;
            jac.set_column(k, &((r_plus - r_minus) / (2.0 * JACOBIAN_STEP)));
        }
        Some(jac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn square(half: f64) -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(-half, -half, 0.0),
            Vector3::new(half, -half, 0.0),
            Vector3::new(half, half, 0.0),
            Vector3::new(-half, half, 0.0),
        ]
    }

    fn observe(objects: &[Vector3<f64>], pose: &SE3) -> Vec<Correspondence> {
        objects
            .iter()
            .map(|p| Correspondence {
                object: *p,
                normalized: CameraModel::project_normalized(&pose.transform_point(p)).unwrap(),
            })
            .collect()
    }

    fn ground_truth() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.2, -0.15, 0.4),
            translation: Vector3::new(0.03, -0.02, 0.5),
        }
    }

    #[test]
    fn test_recovers_pose_from_four_points() {
        let objects = square(0.05);
        let gt = ground_truth();

        let result = PlanarPoseEstimator::default()
            .estimate_detailed(&observe(&objects, &gt))
            .unwrap();

        let (angle, dist) = result.pose.distance(&gt);
        assert!(angle < 1e-6, "rotation error {angle}");
        assert!(dist < 1e-6, "translation error {dist}");
        assert!(result.rms < 1e-8);
    }

    #[test]
    fn test_recovers_pose_for_tilted_marker_plane() {
        // Marker defined on a plane that is not z = 0 in its own frame
        let tilt = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.5, 0.3, 0.0),
            translation: Vector3::new(0.01, 0.02, 0.1),
        };
        let objects: Vec<_> = square(0.04).iter().map(|p| tilt.transform_point(p)).collect();
        let gt = ground_truth();

        let pose = PlanarPoseEstimator::default()
            .estimate(&observe(&objects, &gt))
            .unwrap();

        let (angle, dist) = pose.distance(&gt);
        assert!(angle < 1e-6 && dist < 1e-6, "angle {angle} dist {dist}");
    }

    #[test]
    fn test_refinement_handles_noisy_observations() {
        let mut rng = StdRng::seed_from_u64(7);
        let objects: Vec<_> = square(0.05)
            .into_iter()
            .chain(square(0.03))
            .collect();
        let gt = ground_truth();
        let mut corr = observe(&objects, &gt);
        for c in corr.iter_mut() {
            c.normalized.x += rng.gen_range(-5e-4..5e-4);
            c.normalized.y += rng.gen_range(-5e-4..5e-4);
        }

        let result = PlanarPoseEstimator::default().estimate_detailed(&corr).unwrap();
        let (angle, dist) = result.pose.distance(&gt);
        assert!(angle < 0.05, "rotation error {angle}");
        assert!(dist < 0.01, "translation error {dist}");
    }

    #[test]
    fn test_rejects_too_few_points() {
        let objects = square(0.05);
        let corr = observe(&objects[..3], &ground_truth());
        assert!(PlanarPoseEstimator::default().estimate(&corr).is_none());
    }

    #[test]
    fn test_rejects_collinear_points() {
        let objects: Vec<_> = (0..4).map(|i| Vector3::new(i as f64 * 0.01, 0.0, 0.0)).collect();
        let corr = observe(&objects, &ground_truth());
        assert!(PlanarPoseEstimator::default().estimate_detailed(&corr).is_err());
    }

    #[test]
    fn test_rejects_inconsistent_observations() {
        let mut rng = StdRng::seed_from_u64(3);
        let objects: Vec<_> = square(0.05).into_iter().chain(square(0.02)).collect();
        let corr: Vec<_> = objects
            .iter()
            .map(|p| Correspondence {
                object: *p,
                normalized: Point2::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5)),
            })
            .collect();

        assert!(PlanarPoseEstimator::default().estimate(&corr).is_none());
    }

    #[test]
    fn test_correspondences_from_pixels() {
        let cam = CameraModel::new(500.0, 500.0, 320.0, 240.0);
        let corr = correspondences_from_pixels(
            &square(0.05),
            &[Point2::new(320.0, 240.0); 4],
            &cam,
        );
        assert_eq!(corr.len(), 4);
        assert_eq!(corr[0].normalized, Point2::new(0.0, 0.0));
    }
}
