//! Marker geometry and the flashcode 3D–2D correspondence set.

use anyhow::Result;
use nalgebra::{Point2, Vector3};

use crate::config::TrackerConfig;
use crate::error::TrackingError;
use crate::geometry::{CameraModel, Correspondence};

/// Number of flashcode extremity points.
pub const FLASHCODE_CORNERS: usize = 4;

/// 3D reference points of the tracked target.
///
/// `outer[i]`, `inner[i]` and `middle[i]` describe the same landmark; the
/// three sets have the same length for the whole session.
#[derive(Debug, Clone)]
pub struct MarkerModel {
    outer: Vec<Vector3<f64>>,
    inner: Vec<Vector3<f64>>,
    /// Checkpoints on the dark band, derived from `outer` and `inner`.
    middle: Vec<Vector3<f64>>,
}

impl MarkerModel {
    /// `ratio` is the weight of `outer` in the checkpoint blend.
    pub fn new(outer: Vec<Vector3<f64>>, inner: Vec<Vector3<f64>>, ratio: f64) -> Result<Self> {
        if outer.len() < 4 || outer.len() != inner.len() {
            return Err(TrackingError::InvalidMarker(format!(
                "outer/inner must have the same length >= 4 (got {}/{})",
                outer.len(),
                inner.len()
            ))
            .into());
        }

        let middle = outer
            .iter()
            .zip(inner.iter())
            .map(|(o, i)| o * ratio + i * (1.0 - ratio))
            .collect();

        Ok(Self {
            outer,
            inner,
            middle,
        })
    }

    pub fn from_config(config: &TrackerConfig) -> Result<Self> {
        Self::new(
            config.marker.outer_points(),
            config.marker.inner_points(),
            config.recovery.ratio,
        )
    }

    pub fn outer(&self) -> &[Vector3<f64>] {
        &self.outer
    }

    pub fn inner(&self) -> &[Vector3<f64>] {
        &self.inner
    }

    pub fn middle(&self) -> &[Vector3<f64>] {
        &self.middle
    }

    /// Number of landmarks.
    pub fn len(&self) -> usize {
        self.outer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outer.is_empty()
    }
}

/// Flashcode extremity points paired with their latest detection.
#[derive(Debug, Clone)]
pub struct FlashcodeCorrespondence {
    points: Vec<Vector3<f64>>,
    /// Normalized image coordinates, same order as `points`.
    observed: Option<Vec<Point2<f64>>>,
    /// Normalized center of the detected polygon.
    center: Option<Point2<f64>>,
}

impl FlashcodeCorrespondence {
    pub fn new(points: Vec<Vector3<f64>>) -> Result<Self> {
        if points.len() != FLASHCODE_CORNERS {
            return Err(TrackingError::InvalidMarker(format!(
                "flashcode needs exactly {FLASHCODE_CORNERS} points, got {}",
                points.len()
            ))
            .into());
        }
        Ok(Self {
            points,
            observed: None,
            center: None,
        })
    }

    pub fn from_config(config: &TrackerConfig) -> Result<Self> {
        Self::new(config.marker.flashcode_points())
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    /// Assign a detected polygon (pixels, clockwise, same winding as the
    /// model) 1:1 to the flashcode points.
    ///
    /// Returns `false` and keeps the previous observation when the polygon
    /// does not have exactly one corner per model point.
    pub fn update(&mut self, polygon: &[Point2<f64>], camera: &CameraModel) -> bool {
        if polygon.len() != self.points.len() {
            return false;
        }

        let n = polygon.len() as f64;
        let center_px = Point2::new(
            polygon.iter().map(|p| p.x).sum::<f64>() / n,
            polygon.iter().map(|p| p.y).sum::<f64>() / n,
        );
        self.center = Some(camera.pixel_to_normalized(&center_px));
        self.observed = Some(polygon.iter().map(|p| camera.pixel_to_normalized(p)).collect());
        true
    }

    pub fn observed(&self) -> Option<&[Point2<f64>]> {
        self.observed.as_deref()
    }

    pub fn center(&self) -> Option<Point2<f64>> {
        self.center
    }

    /// Correspondences for pose estimation; empty before the first detection.
    pub fn correspondences(&self) -> Vec<Correspondence> {
        match &self.observed {
            Some(observed) => self
                .points
                .iter()
                .zip(observed.iter())
                .map(|(object, normalized)| Correspondence {
                    object: *object,
                    normalized: *normalized,
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarkerConfig;
    use approx::assert_relative_eq;

    fn config() -> TrackerConfig {
        TrackerConfig {
            marker: MarkerConfig::square(0.03, 0.04, 0.05),
            ..Default::default()
        }
    }

    #[test]
    fn test_middle_points_blend_outer_and_inner() {
        let model = MarkerModel::from_config(&config()).unwrap();
        assert_eq!(model.middle().len(), model.len());
        assert_relative_eq!(model.middle()[0], Vector3::new(-0.045, -0.045, 0.0), epsilon = 1e-12);

        let outer_heavy = MarkerModel::new(
            config().marker.outer_points(),
            config().marker.inner_points(),
            1.0,
        )
        .unwrap();
        assert_relative_eq!(outer_heavy.middle()[2], outer_heavy.outer()[2]);
    }

    #[test]
    fn test_rejects_mismatched_sets() {
        let mut inner = config().marker.inner_points();
        inner.pop();
        assert!(MarkerModel::new(config().marker.outer_points(), inner, 0.5).is_err());
    }

    #[test]
    fn test_update_from_polygon() {
        let cam = CameraModel::new(500.0, 500.0, 320.0, 240.0);
        let mut flashcode = FlashcodeCorrespondence::from_config(&config()).unwrap();
        assert!(flashcode.correspondences().is_empty());

        let polygon = [
            Point2::new(300.0, 220.0),
            Point2::new(340.0, 220.0),
            Point2::new(340.0, 260.0),
            Point2::new(300.0, 260.0),
        ];
        assert!(flashcode.update(&polygon, &cam));

        let corr = flashcode.correspondences();
        assert_eq!(corr.len(), 4);
        assert_relative_eq!(corr[1].normalized, Point2::new(0.04, -0.04), epsilon = 1e-12);
        assert_relative_eq!(flashcode.center().unwrap(), Point2::new(0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_update_rejects_wrong_corner_count() {
        let cam = CameraModel::new(500.0, 500.0, 320.0, 240.0);
        let mut flashcode = FlashcodeCorrespondence::from_config(&config()).unwrap();
        assert!(!flashcode.update(&[Point2::new(1.0, 1.0); 3], &cam));
        assert!(flashcode.observed().is_none());
    }
}
