//! Health check run on every tracked frame.
//!
//! Sub-checks, in order; the first failure decides the verdict:
//! 1. variance limit on each covariance diagonal entry
//! 2. Hinkley change-point test on each covariance diagonal entry
//! 3. checkpoint intensity: the median gray level around each projected
//!    middle point must stay dark
//!
//! A non-finite covariance entry fails the first two checks outright and is
//! never fed to the change-point test. Unconfigured sub-checks are skipped. Every evaluated value is also fed to
//! [`TrackingStatistics`] and, when enabled, to the diagnostic log.

use std::fmt::{self, Display};
use std::io::Write;

use image::GrayImage;
use nalgebra::{Matrix6, Point2, Vector3, Vector6};
use tracing::debug;

use crate::config::TrackerConfig;
use crate::geometry::{CameraModel, SE3};
use crate::health::hinkley::ChangePointBank;
use crate::health::statistics::TrackingStatistics;
use crate::io::varlog::{VarLog, VarLogColumns, VarRecord};
use crate::tracking::marker::MarkerModel;
use crate::tracking::roi::Roi;

/// The sub-check responsible for a failed verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum FailedCheck {
    /// The model tracker itself reported an error.
    Tracker(String),
    VarianceLimit { dof: usize, value: f64, limit: f64 },
    NonFiniteVariance { dof: usize },
    ChangePoint { dof: usize, value: f64 },
    Checkpoint { index: usize, median: u8, threshold: u8 },
    /// The checkpoint window fell entirely outside the image.
    CheckpointOutOfImage { index: usize },
}

impl Display for FailedCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedCheck::Tracker(msg) => write!(f, "model tracker failed: {msg}"),
            FailedCheck::VarianceLimit { dof, value, limit } => {
                write!(f, "variance {value:.3e} on dof {dof} above limit {limit:.3e}")
            }
            FailedCheck::NonFiniteVariance { dof } => {
                write!(f, "non-finite variance on dof {dof}")
            }
            FailedCheck::ChangePoint { dof, value } => {
                write!(f, "hinkley jump on dof {dof} (variance {value:.3e})")
            }
            FailedCheck::Checkpoint {
                index,
                median,
                threshold,
            } => write!(f, "checkpoint {index} median {median} above {threshold}"),
            FailedCheck::CheckpointOutOfImage { index } => {
                write!(f, "checkpoint {index} outside the image")
            }
        }
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthVerdict {
    pub failed: Option<FailedCheck>,
}

impl HealthVerdict {
    pub fn pass() -> Self {
        Self { failed: None }
    }

    pub fn fail(check: FailedCheck) -> Self {
        Self {
            failed: Some(check),
        }
    }

    pub fn passed(&self) -> bool {
        self.failed.is_none()
    }
}

/// Everything one check looks at.
pub struct HealthInput<'a> {
    pub iteration: u64,
    pub pose: &'a SE3,
    pub covariance: Option<&'a Matrix6<f64>>,
    pub gray: &'a GrayImage,
    pub camera: &'a CameraModel,
    pub model: &'a MarkerModel,
    /// Current tracker search range, logged when dynamic range is enabled.
    pub dynamic_range: Option<u32>,
}

#[derive(Debug, Clone)]
struct CheckpointSettings {
    /// Fail on bright checkpoints (otherwise only logged).
    enforce: bool,
    log: bool,
    size: f64,
    threshold: u8,
}

/// Combined variance / change-point / checkpoint policy.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    var_limit: Option<f64>,
    change_points: Option<ChangePointBank>,
    checkpoints: Option<CheckpointSettings>,
    log_dynamic_range: bool,
    log_pose: bool,
}

impl HealthCheck {
    pub fn from_config(config: &TrackerConfig) -> Self {
        let checkpoints = config.using_checkpoints().then(|| CheckpointSettings {
            enforce: config.recovery.enabled,
            log: config.logging.log_checkpoints,
            size: config.recovery.size,
            threshold: config.recovery.threshold,
        });

        Self {
            var_limit: config.var_limit,
            change_points: config
                .hinkley_params()
                .map(|(alpha, delta)| ChangePointBank::new(alpha, delta)),
            checkpoints,
            log_dynamic_range: config.mbt_dynamic_range.is_some(),
            log_pose: config.logging.log_pose,
        }
    }

    /// Diagnostic log layout matching what [`HealthCheck::evaluate`] writes.
    pub fn log_columns(&self, model: &MarkerModel) -> VarLogColumns {
        VarLogColumns {
            dynamic_range: self.log_dynamic_range,
            pose: self.log_pose,
            checkpoints: match &self.checkpoints {
                Some(settings) if settings.log => model.len(),
                _ => 0,
            },
        }
    }

    pub fn change_points(&self) -> Option<&ChangePointBank> {
        self.change_points.as_ref()
    }

    pub fn evaluate<W: Write>(
        &mut self,
        input: &HealthInput<'_>,
        stats: &mut TrackingStatistics,
        log: Option<&mut VarLog<W>>,
    ) -> HealthVerdict {
        // The row is finished when `record` goes out of scope, on every return path
        let mut record = log.map(|l| l.record());
        put(&mut record, input.iteration);

        let variances = input.covariance.map(|c| c.diagonal());
        match &variances {
            Some(v) => {
                for value in v.iter() {
                    put(&mut record, value);
                }
                stats.push_covariance(v);
            }
            None => {
                for _ in 0..6 {
                    put(&mut record, f64::NAN);
                }
            }
        }

        if let Some(v) = &variances {
            if let Some(failed) = self.check_variances(v) {
                return reject(failed);
            }
        }

        if self.log_dynamic_range {
            match input.dynamic_range {
                Some(range) => put(&mut record, range),
                None => put(&mut record, f64::NAN),
            }
        }
        if self.log_pose {
            for value in input.pose.to_pose_vector().iter() {
                put(&mut record, value);
            }
        }

        if let Some(settings) = &self.checkpoints {
            if let Some(failed) = check_checkpoints(settings, input, stats, &mut record) {
                return reject(failed);
            }
        }

        HealthVerdict::pass()
    }

    fn check_variances(&mut self, variances: &Vector6<f64>) -> Option<FailedCheck> {
        if self.var_limit.is_none() && self.change_points.is_none() {
            return None;
        }
        if let Some(dof) = variances.iter().position(|v| !v.is_finite()) {
            return Some(FailedCheck::NonFiniteVariance { dof });
        }

        if let Some(limit) = self.var_limit {
            if let Some((dof, value)) = variances.iter().enumerate().find(|(_, v)| **v > limit) {
                return Some(FailedCheck::VarianceLimit {
                    dof,
                    value: *value,
                    limit,
                });
            }
        }

        if let Some(bank) = self.change_points.as_mut() {
            if let Some(dof) = bank.feed(variances) {
                return Some(FailedCheck::ChangePoint {
                    dof,
                    value: variances[dof],
                });
            }
        }
        None
    }
}

fn reject(failed: FailedCheck) -> HealthVerdict {
    debug!("health check failed: {}", failed);
    HealthVerdict::fail(failed)
}

fn put<W: Write, T: Display>(record: &mut Option<VarRecord<'_, W>>, value: T) {
    if let Some(record) = record.as_mut() {
        record.write(value);
    }
}

fn check_checkpoints<W: Write>(
    settings: &CheckpointSettings,
    input: &HealthInput<'_>,
    stats: &mut TrackingStatistics,
    record: &mut Option<VarRecord<'_, W>>,
) -> Option<FailedCheck> {
    let (width, height) = input.gray.dimensions();
    let model = input.model;

    for index in 0..model.len() {
        let project = |p: &Vector3<f64>| input.camera.project(&input.pose.transform_point(p));
        let window = match (
            project(&model.middle()[index]),
            project(&model.inner()[index]),
            project(&model.outer()[index]),
        ) {
            (Some(middle), Some(inner), Some(outer)) => {
                checkpoint_window(&middle, &inner, &outer, settings.size, width, height)
            }
            _ => Roi::default(),
        };

        let median = window_median(input.gray, &window, stats);
        if settings.log {
            match median {
                Some(m) => put(record, m),
                None => put(record, f64::NAN),
            }
        }

        if settings.enforce {
            match median {
                None => return Some(FailedCheck::CheckpointOutOfImage { index }),
                Some(m) if m > settings.threshold => {
                    return Some(FailedCheck::Checkpoint {
                        index,
                        median: m,
                        threshold: settings.threshold,
                    })
                }
                _ => {}
            }
        }
    }
    None
}

/// Sampling window around a projected checkpoint: half-extent is `size`
/// times the inner/outer pixel gap per axis (at least one pixel), clipped to
/// the image.
pub fn checkpoint_window(
    middle: &Point2<f64>,
    inner: &Point2<f64>,
    outer: &Point2<f64>,
    size: f64,
    image_width: u32,
    image_height: u32,
) -> Roi {
    let half_w = (((outer.x - inner.x).abs() * size) as i64).max(1);
    let half_h = (((outer.y - inner.y).abs() * size) as i64).max(1);
    let u = middle.x as i64;
    let v = middle.y as i64;

    Roi::clipped(
        u - half_w,
        v - half_h,
        u + half_w,
        v + half_h,
        image_width,
        image_height,
    )
}

/// Median gray level inside `window`, feeding every sample to `stats`.
fn window_median(gray: &GrayImage, window: &Roi, stats: &mut TrackingStatistics) -> Option<u8> {
    if window.is_empty() {
        return None;
    }

    let mut histogram = [0u32; 256];
    for y in window.y..window.y + window.height {
        for x in window.x..window.x + window.width {
            let value = gray.get_pixel(x, y).0[0];
            histogram[value as usize] += 1;
            stats.push_checkpoint(value);
        }
    }

    let n = window.area() as u32;
    let rank = n.div_ceil(2);
    let mut cumulative = 0;
    for (value, count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative >= rank {
            return Some(value as u8);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarkerConfig;
    use image::Luma;
    use nalgebra::UnitQuaternion;

    fn config() -> TrackerConfig {
        TrackerConfig {
            marker: MarkerConfig::square(0.03, 0.04, 0.05),
            ..Default::default()
        }
    }

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0)
    }

    fn pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, 0.5),
        }
    }

    /// Dark band between the projected inner (±40 px) and outer (±50 px) squares.
    fn marker_image(band: u8) -> GrayImage {
        GrayImage::from_fn(640, 480, |x, y| {
            let dx = (x as i64 - 320).abs();
            let dy = (y as i64 - 240).abs();
            let d = dx.max(dy);
            if (40..50).contains(&d) {
                Luma([band])
            } else {
                Luma([255])
            }
        })
    }

    fn run(check: &mut HealthCheck, cov: Option<Matrix6<f64>>, gray: &GrayImage) -> HealthVerdict {
        let config = config();
        let model = MarkerModel::from_config(&config).unwrap();
        let pose = pose();
        let cam = camera();
        let input = HealthInput {
            iteration: 1,
            pose: &pose,
            covariance: cov.as_ref(),
            gray,
            camera: &cam,
            model: &model,
            dynamic_range: None,
        };
        let mut stats = TrackingStatistics::new();
        check.evaluate::<Vec<u8>>(&input, &mut stats, None)
    }

    #[test]
    fn test_no_checks_configured_passes() {
        let mut check = HealthCheck::from_config(&config());
        let cov = Matrix6::from_diagonal_element(1e9);
        assert!(run(&mut check, Some(cov), &marker_image(0)).passed());
    }

    #[test]
    fn test_variance_limit_fails_regardless_of_other_checks() {
        let mut cfg = config();
        cfg.var_limit = Some(1e-3);
        cfg.hinkley = Some([1e9, 0.0]);
        let mut check = HealthCheck::from_config(&cfg);

        let mut cov = Matrix6::from_diagonal_element(1e-5);
        cov[(3, 3)] = 2e-3;
        let verdict = run(&mut check, Some(cov), &marker_image(0));
        assert!(matches!(
            verdict.failed,
            Some(FailedCheck::VarianceLimit { dof: 3, .. })
        ));
        // Hinkley detectors were not fed
        assert!(check.change_points().unwrap().detectors().iter().all(|d| d.samples() == 0));
    }

    #[test]
    fn test_missing_covariance_skips_variance_checks() {
        let mut cfg = config();
        cfg.var_limit = Some(1e-3);
        let mut check = HealthCheck::from_config(&cfg);
        assert!(run(&mut check, None, &marker_image(0)).passed());
    }

    #[test]
    fn test_hinkley_jump_fails() {
        let mut cfg = config();
        cfg.hinkley = Some([1e-3, 1e-5]);
        let mut check = HealthCheck::from_config(&cfg);
        let image = marker_image(0);

        for _ in 0..20 {
            let verdict = run(&mut check, Some(Matrix6::from_diagonal_element(1e-5)), &image);
            assert!(verdict.passed());
        }
        let mut cov = Matrix6::from_diagonal_element(1e-5);
        cov[(0, 0)] = 1e-1;
        let verdict = run(&mut check, Some(cov), &image);
        assert!(matches!(
            verdict.failed,
            Some(FailedCheck::ChangePoint { dof: 0, .. })
        ));
    }

    #[test]
    fn test_checkpoints_on_dark_band_pass() {
        let mut cfg = config();
        cfg.recovery.enabled = true;
        let mut check = HealthCheck::from_config(&cfg);
        assert!(run(&mut check, None, &marker_image(20)).passed());
    }

    #[test]
    fn test_checkpoints_off_band_fail() {
        let mut cfg = config();
        cfg.recovery.enabled = true;
        let mut check = HealthCheck::from_config(&cfg);

        let verdict = run(&mut check, None, &marker_image(200));
        assert!(matches!(
            verdict.failed,
            Some(FailedCheck::Checkpoint {
                index: 0,
                median: 200,
                threshold: 100
            })
        ));
    }

    #[test]
    fn test_logged_checkpoints_do_not_fail() {
        let mut cfg = config();
        cfg.logging.log_checkpoints = true;
        let mut check = HealthCheck::from_config(&cfg);
        assert!(run(&mut check, None, &marker_image(200)).passed());
    }

    #[test]
    fn test_checkpoint_window_minimum_size() {
        let p = Point2::new(100.4, 50.7);
        let window = checkpoint_window(&p, &p, &p, 0.5, 640, 480);
        assert!(window.width >= 1 && window.height >= 1);
        assert_eq!((window.x, window.y, window.width, window.height), (99, 49, 2, 2));
    }

    #[test]
    fn test_checkpoint_window_clipped() {
        let middle = Point2::new(2.0, 478.0);
        let inner = Point2::new(0.0, 470.0);
        let outer = Point2::new(20.0, 490.0);
        let window = checkpoint_window(&middle, &inner, &outer, 0.5, 640, 480);
        assert_eq!(window.x, 0);
        assert_eq!(window.y + window.height, 480);
    }

    #[test]
    fn test_log_row_written_on_early_failure() {
        let mut cfg = config();
        cfg.var_limit = Some(1e-3);
        cfg.logging.log_pose = true;
        let model = MarkerModel::from_config(&cfg).unwrap();
        let mut check = HealthCheck::from_config(&cfg);
        let mut log = VarLog::from_writer(Vec::new(), check.log_columns(&model)).unwrap();

        let pose = pose();
        let cam = camera();
        let gray = marker_image(0);
        let cov = Matrix6::from_diagonal_element(1.0);
        let input = HealthInput {
            iteration: 9,
            pose: &pose,
            covariance: Some(&cov),
            gray: &gray,
            camera: &cam,
            model: &model,
            dynamic_range: None,
        };
        let mut stats = TrackingStatistics::new();
        assert!(!check.evaluate(&input, &mut stats, Some(&mut log)).passed());

        let text = String::from_utf8(log.into_inner().unwrap()).unwrap();
        let row = text.lines().nth(2).unwrap();
        // iteration + six variances, pose columns never reached
        assert_eq!(row.split('\t').count(), 7);
        assert!(row.starts_with("9\t1\t"));
        assert_eq!(stats.var.count(), 6);
    }

    #[test]
    fn test_nan_covariance_fails() {
        let mut cfg = config();
        cfg.var_limit = Some(1e-3);
        let mut check = HealthCheck::from_config(&cfg);

        let mut cov = Matrix6::from_diagonal_element(1e-5);
        cov[(2, 2)] = f64::NAN;
        let verdict = run(&mut check, Some(cov), &marker_image(0));
        assert_eq!(verdict.failed, Some(FailedCheck::NonFiniteVariance { dof: 2 }));
    }

    #[test]
    fn test_nan_frame_does_not_disable_change_points() {
        let mut cfg = config();
        cfg.var_limit = Some(1e-3);
        cfg.hinkley = Some([1e-3, 1e-6]);
        let mut check = HealthCheck::from_config(&cfg);
        let image = marker_image(0);

        for _ in 0..10 {
            assert!(run(&mut check, Some(Matrix6::from_diagonal_element(1e-5)), &image).passed());
        }

        let verdict = run(&mut check, Some(Matrix6::from_diagonal_element(f64::NAN)), &image);
        assert_eq!(verdict.failed, Some(FailedCheck::NonFiniteVariance { dof: 0 }));
        assert!(check.change_points().unwrap().detectors().iter().all(|d| d.samples() == 10));

        // sustained 50x step, still under the variance limit
        let jumps = (0..10)
            .map(|_| run(&mut check, Some(Matrix6::from_diagonal_element(5e-4)), &image))
            .filter(|v| matches!(v.failed, Some(FailedCheck::ChangePoint { .. })))
            .count();
        assert!(jumps >= 1);
    }
}
