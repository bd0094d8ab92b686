//! Tracker configuration: marker geometry, detection, health-check and
//! diagnostic options.
//!
//! Loaded from JSON; every field has a default so a file only lists what it
//! changes. Optional checks are enabled by the presence of their parameters.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::TrackingError;

/// 3D marker point sets, clockwise, in marker coordinates (meters).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Outer boundary of the dark band.
    pub outer: Vec<[f64; 3]>,
    /// Inner boundary of the dark band.
    pub inner: Vec<[f64; 3]>,
    /// The four flashcode extremity points.
    pub flashcode: Vec<[f64; 3]>,
}

impl MarkerConfig {
    /// Square marker centered on the origin in the `z = 0` plane.
    pub fn square(flashcode_half: f64, inner_half: f64, outer_half: f64) -> Self {
        let corners = |h: f64| vec![[-h, -h, 0.0], [h, -h, 0.0], [h, h, 0.0], [-h, h, 0.0]];
        Self {
            outer: corners(outer_half),
            inner: corners(inner_half),
            flashcode: corners(flashcode_half),
        }
    }

    pub fn outer_points(&self) -> Vec<Vector3<f64>> {
        to_vectors(&self.outer)
    }

    pub fn inner_points(&self) -> Vec<Vector3<f64>> {
        to_vectors(&self.inner)
    }

    pub fn flashcode_points(&self) -> Vec<Vector3<f64>> {
        to_vectors(&self.flashcode)
    }
}

fn to_vectors(points: &[[f64; 3]]) -> Vec<Vector3<f64>> {
    points.iter().map(|p| Vector3::new(p[0], p[1], p[2])).collect()
}

/// Ad-hoc recovery: checkpoint sampling on the marker's dark band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Fail the health check when a checkpoint window is too bright.
    pub enabled: bool,
    /// Blend weight of `outer` when deriving the checkpoint (middle) points.
    pub ratio: f64,
    /// Sampling half-window, as a fraction of the projected inner/outer gap.
    pub size: f64,
    /// Median intensity above which a checkpoint is off the dark band.
    pub threshold: u8,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ratio: 0.5,
            size: 0.5,
            threshold: 100,
        }
    }
}

/// Diagnostic log options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Variance file; diagnostics are off when unset.
    pub var_file: Option<PathBuf>,
    pub log_pose: bool,
    pub log_checkpoints: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub marker: MarkerConfig,
    /// Full-frame detection timeout.
    pub detector_timeout_ms: u64,
    /// Per-DOF covariance limit.
    pub var_limit: Option<f64>,
    /// Hinkley `[alpha, delta]`.
    pub hinkley: Option<[f64; 2]>,
    /// Search range multiplier applied to the mean inner/outer pixel gap.
    pub mbt_dynamic_range: Option<f64>,
    /// Tracker iterations on the initialization image after a new pose.
    pub mbt_convergence_steps: u32,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
    /// Treat the frame source as selected without a `select-input` event.
    pub auto_select_input: bool,
    /// Initial pose rejection threshold (normalized-plane RMS).
    pub max_pose_rms: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            marker: MarkerConfig::default(),
            detector_timeout_ms: 1000,
            var_limit: None,
            hinkley: None,
            mbt_dynamic_range: None,
            mbt_convergence_steps: 100,
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
            auto_select_input: true,
            max_pose_rms: 0.02,
        }
    }
}

impl TrackerConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.marker;
        if m.outer.len() < 4 {
            return Err(invalid_marker(format!(
                "need at least 4 outer points, got {}",
                m.outer.len()
            )));
        }
        if m.inner.len() != m.outer.len() {
            return Err(invalid_marker(format!(
                "inner and outer point counts differ ({} vs {})",
                m.inner.len(),
                m.outer.len()
            )));
        }
        if m.flashcode.len() != 4 {
            return Err(invalid_marker(format!(
                "flashcode needs exactly 4 points, got {}",
                m.flashcode.len()
            )));
        }
        let all_points = m.outer.iter().chain(&m.inner).chain(&m.flashcode);
        if all_points.flatten().any(|v| !v.is_finite()) {
            return Err(invalid_marker("non-finite coordinate".to_string()));
        }

        if let Some(limit) = self.var_limit {
            if !(limit.is_finite() && limit > 0.0) {
                return Err(invalid_config(format!("variance limit must be positive, got {limit}")));
            }
        }
        if let Some([alpha, delta]) = self.hinkley {
            if !(alpha.is_finite() && alpha >= 0.0 && delta.is_finite() && delta >= 0.0) {
                return Err(invalid_config(format!(
                    "hinkley alpha/delta must be non-negative, got {alpha}/{delta}"
                )));
            }
        }
        if let Some(range) = self.mbt_dynamic_range {
            if !(range.is_finite() && range > 0.0) {
                return Err(invalid_config(format!("dynamic range must be positive, got {range}")));
            }
        }
        if !(self.recovery.size.is_finite() && self.recovery.size > 0.0) {
            return Err(invalid_config(format!(
                "recovery size must be positive, got {}",
                self.recovery.size
            )));
        }
        if !self.recovery.ratio.is_finite() {
            return Err(invalid_config("recovery ratio must be finite".to_string()));
        }
        if !(self.max_pose_rms.is_finite() && self.max_pose_rms > 0.0) {
            return Err(invalid_config(format!(
                "max pose rms must be positive, got {}",
                self.max_pose_rms
            )));
        }
        Ok(())
    }

    pub fn using_var_limit(&self) -> bool {
        self.var_limit.is_some()
    }

    pub fn hinkley_params(&self) -> Option<(f64, f64)> {
        self.hinkley.map(|[alpha, delta]| (alpha, delta))
    }

    /// Checkpoints are projected when used for recovery or for logging.
    pub fn using_checkpoints(&self) -> bool {
        self.recovery.enabled || self.logging.log_checkpoints
    }

    /// Log the active options.
    pub fn log_summary(&self) {
        info!(
            outer = self.marker.outer.len(),
            inner = self.marker.inner.len(),
            "marker model"
        );
        info!(timeout_ms = self.detector_timeout_ms, "flashcode detector");
        match self.var_limit {
            Some(limit) => info!(limit, "variance limit check enabled"),
            None => info!("variance limit check disabled"),
        }
        match self.hinkley_params() {
            Some((alpha, delta)) => info!(alpha, delta, "hinkley check enabled"),
            None => info!("hinkley check disabled"),
        }
        if self.recovery.enabled {
            info!(
                ratio = self.recovery.ratio,
                size = self.recovery.size,
                threshold = self.recovery.threshold,
                "ad-hoc recovery enabled"
            );
        }
        if let Some(range) = self.mbt_dynamic_range {
            info!(multiplier = range, "dynamic tracker range enabled");
        }
        if let Some(path) = &self.logging.var_file {
            info!("Using variance file: {}", path.display());
        }
    }
}

fn invalid_marker(msg: String) -> anyhow::Error {
    TrackingError::InvalidMarker(msg).into()
}

fn invalid_config(msg: String) -> anyhow::Error {
    TrackingError::InvalidConfig(msg).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> TrackerConfig {
        TrackerConfig {
            marker: MarkerConfig::square(0.03, 0.035, 0.05),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.detector_timeout_ms, 1000);
        assert_eq!(config.mbt_convergence_steps, 100);
        assert_eq!(config.recovery.threshold, 100);
        assert!(!config.using_var_limit());
        assert!(config.hinkley_params().is_none());
        assert!(!config.using_checkpoints());
    }

    #[test]
    fn test_square_marker_is_valid() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_rejects_mismatched_inner_outer() {
        let mut config = valid();
        config.marker.inner.pop();

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrackingError>(),
            Some(TrackingError::InvalidMarker(_))
        ));
    }

    #[test]
    fn test_rejects_bad_flashcode() {
        let mut config = valid();
        config.marker.flashcode.push([0.0, 0.0, 0.0]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_negative_hinkley() {
        let mut config = valid();
        config.hinkley = Some([-1.0, 0.1]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "marker": {{
                    "outer": [[-0.05,-0.05,0],[0.05,-0.05,0],[0.05,0.05,0],[-0.05,0.05,0]],
                    "inner": [[-0.03,-0.03,0],[0.03,-0.03,0],[0.03,0.03,0],[-0.03,0.03,0]],
                    "flashcode": [[-0.02,-0.02,0],[0.02,-0.02,0],[0.02,0.02,0],[-0.02,0.02,0]]
                }},
                "hinkley": [0.5, 0.01],
                "recovery": {{ "enabled": true, "threshold": 80 }}
            }}"#
        )
        .unwrap();

        let config = TrackerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.hinkley_params(), Some((0.5, 0.01)));
        assert!(config.recovery.enabled);
        assert_eq!(config.recovery.threshold, 80);
        assert_eq!(config.recovery.ratio, 0.5);
        assert_eq!(config.detector_timeout_ms, 1000);
        assert!(config.using_checkpoints());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(TrackerConfig::from_file("/nonexistent/config.json").is_err());
    }
}
