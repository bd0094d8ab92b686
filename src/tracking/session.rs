//! Mutable context carried through the tracking lifecycle.
//!
//! Guards and actions of the state machine live here as methods; the
//! external collaborators are passed in by the [`Tracker`](super::Tracker)
//! that owns both.

use std::fs::File;
use std::time::Duration;

use anyhow::Result;
use image::{imageops, GrayImage, RgbaImage};
use nalgebra::Point2;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::TrackingError;
use crate::geometry::{CameraModel, SE3};
use crate::health::{FailedCheck, HealthCheck, HealthInput, HealthVerdict, TrackingStatistics};
use crate::io::VarLog;
use crate::tracking::collaborators::{FiducialDetector, ModelTracker, PoseEstimator};
use crate::tracking::event::Frame;
use crate::tracking::marker::{FlashcodeCorrespondence, MarkerModel};
use crate::tracking::roi::{project_points, ModelProjection, Roi};

pub struct TrackingSession {
    config: TrackerConfig,
    camera: Option<CameraModel>,
    /// Current model pose `cMo`.
    pose: Option<SE3>,
    /// Working image and its gray derivative. `gray` is only set once the
    /// frame has been prepared for pose estimation or tracking.
    image: Option<RgbaImage>,
    gray: Option<GrayImage>,
    frame_index: u64,
    iteration: u64,
    roi: Option<Roi>,
    dynamic_range: Option<u32>,
    model: MarkerModel,
    flashcode: FlashcodeCorrespondence,
    health: HealthCheck,
    statistics: TrackingStatistics,
    varlog: Option<VarLog>,
    input_selected: bool,
}

impl TrackingSession {
    /// Build the marker model and health policy, and open the diagnostic log
    /// when one is configured.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let model = MarkerModel::from_config(&config)?;
        let flashcode = FlashcodeCorrespondence::from_config(&config)?;
        let health = HealthCheck::from_config(&config);

        let varlog = match &config.logging.var_file {
            Some(path) => Some(VarLog::create(path, health.log_columns(&model))?),
            None => None,
        };

        Ok(Self {
            config,
            camera: None,
            pose: None,
            image: None,
            gray: None,
            frame_index: 0,
            iteration: 0,
            roi: None,
            dynamic_range: None,
            model,
            flashcode,
            health,
            statistics: TrackingStatistics::new(),
            varlog,
            input_selected: false,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn camera(&self) -> Option<&CameraModel> {
        self.camera.as_ref()
    }

    pub fn pose(&self) -> Option<&SE3> {
        self.pose.as_ref()
    }

    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    /// Number of frames loaded since the session started, detection frames
    /// included. This is the first column of the variance file.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn dynamic_range(&self) -> Option<u32> {
        self.dynamic_range
    }

    pub fn model(&self) -> &MarkerModel {
        &self.model
    }

    pub fn flashcode(&self) -> &FlashcodeCorrespondence {
        &self.flashcode
    }

    pub fn health(&self) -> &HealthCheck {
        &self.health
    }

    pub fn statistics(&self) -> &TrackingStatistics {
        &self.statistics
    }

    pub fn select_input(&mut self) {
        self.input_selected = true;
    }

    pub fn input_selected(&self) -> bool {
        self.input_selected || self.config.auto_select_input
    }

    /// Replace the working image with a new frame.
    pub fn load_frame(&mut self, frame: Frame) {
        self.iteration += 1;
        self.frame_index = frame.index;
        self.camera = Some(frame.camera);
        self.image = Some(frame.image);
        self.gray = None;
    }

    /// Derive the single-channel image used by pose estimation and tracking.
    pub fn prepare_working_image(&mut self) {
        self.gray = self.image.as_ref().map(imageops::grayscale);
    }

    fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.config.detector_timeout_ms)
    }

    /// Guard `flashcode_detected`: search the whole frame.
    pub fn detect_full<D: FiducialDetector + ?Sized>(&mut self, detector: &mut D) -> bool {
        let Some(image) = self.image.as_ref() else {
            return false;
        };
        let timeout = self.detector_timeout();
        debug!(
            frame = self.frame_index,
            timeout_ms = timeout.as_millis() as u64,
            "full-frame flashcode detection"
        );

        if !detector.detect(image, timeout, Point2::new(0, 0)) {
            return false;
        }
        self.record_detection(&detector.polygon())
    }

    /// Guard `flashcode_redetected`: search the last ROI only, with a timeout
    /// scaled by its share of the frame.
    pub fn detect_in_roi<D: FiducialDetector + ?Sized>(&mut self, detector: &mut D) -> bool {
        let (Some(image), Some(roi)) = (self.image.as_ref(), self.roi) else {
            return false;
        };
        if roi.is_empty() {
            debug!(frame = self.frame_index, "empty ROI, skipping re-detection");
            return false;
        }

        let (width, height) = image.dimensions();
        let timeout = roi.scaled_timeout(self.detector_timeout(), width, height);
        debug!(
            frame = self.frame_index,
            x = roi.x,
            y = roi.y,
            width = roi.width,
            height = roi.height,
            timeout_ms = timeout.as_millis() as u64,
            "ROI flashcode re-detection"
        );

        let region = imageops::crop_imm(image, roi.x, roi.y, roi.width, roi.height).to_image();
        if !detector.detect(&region, timeout, Point2::new(roi.x, roi.y)) {
            return false;
        }
        self.record_detection(&detector.polygon())
    }

    /// Action: store the detected corners and prepare the working image.
    fn record_detection(&mut self, polygon: &[Point2<f64>]) -> bool {
        let Some(camera) = self.camera else {
            return false;
        };
        if !self.flashcode.update(polygon, &camera) {
            warn!(
                corners = polygon.len(),
                "detector returned an unexpected polygon, ignoring detection"
            );
            return false;
        }
        self.prepare_working_image();
        true
    }

    /// Guard `model_detected`: initial pose from the flashcode corners, then
    /// hand-off to the model tracker.
    ///
    /// Returns an error when no working image has been prepared; that is a
    /// misuse by the host, not a tracking failure.
    pub fn estimate_initial_pose<P, M>(&mut self, estimator: &P, tracker: &mut M) -> Result<bool>
    where
        P: PoseEstimator + ?Sized,
        M: ModelTracker + ?Sized,
    {
        let (Some(image), Some(gray), Some(camera)) = (&self.image, &self.gray, self.camera) else {
            return Err(TrackingError::UninitializedImage.into());
        };
        if image.width() == 0 || image.height() == 0 || gray.width() == 0 || gray.height() == 0 {
            return Err(TrackingError::UninitializedImage.into());
        }

        let Some(pose) = estimator.estimate(&self.flashcode.correspondences()) else {
            debug!("initial pose estimation failed");
            return Ok(false);
        };

        if let Err(err) = tracker.init(gray, &camera, &pose, self.config.mbt_convergence_steps) {
            warn!("model tracker initialization failed: {err:#}");
            return Ok(false);
        }

        let t = pose.translation;
        info!(x = t.x, y = t.y, z = t.z, "initial pose found");
        if self.config.using_checkpoints() {
            let middle = project_points(self.model.middle(), &pose, &camera);
            debug!(
                visible = middle.iter().flatten().count(),
                total = middle.len(),
                "checkpoints projected"
            );
        }

        self.pose = Some(pose);
        self.update_projection(tracker);
        Ok(true)
    }

    /// Guard `mbt_success`: run the model tracker on the working image and
    /// judge the result.
    pub fn check_tracking<M: ModelTracker + ?Sized>(&mut self, tracker: &mut M) -> HealthVerdict {
        let (Some(gray), Some(camera)) = (self.gray.as_ref(), self.camera) else {
            return HealthVerdict::fail(FailedCheck::Tracker("no working image".to_string()));
        };

        let output = match tracker.track(gray, &camera) {
            Ok(output) => output,
            Err(err) => {
                debug!("model tracking failed: {err:#}");
                return HealthVerdict::fail(FailedCheck::Tracker(format!("{err:#}")));
            }
        };

        let input = HealthInput {
            iteration: self.iteration,
            pose: &output.pose,
            covariance: output.covariance.as_ref(),
            gray,
            camera: &camera,
            model: &self.model,
            dynamic_range: self.dynamic_range,
        };
        let verdict = self
            .health
            .evaluate::<File>(&input, &mut self.statistics, self.varlog.as_mut());

        self.pose = Some(output.pose);
        verdict
    }

    /// Action `track_model`: project the model under the current pose, store
    /// the ROI and resize the tracker's search range.
    pub fn update_projection<M: ModelTracker + ?Sized>(&mut self, tracker: &mut M) {
        let (Some(pose), Some(camera), Some(image)) = (&self.pose, &self.camera, &self.image) else {
            return;
        };

        let projection = ModelProjection::new(&self.model, pose, camera);
        let (width, height) = image.dimensions();
        self.roi = Some(projection.roi(width, height));

        if let Some(multiplier) = self.config.mbt_dynamic_range {
            if let Some(band) = projection.mean_band_width() {
                let range = (band * multiplier) as u32;
                self.dynamic_range = Some(range);
                tracker.set_search_range(range);
            }
        }
    }

    /// Flush and close the diagnostic log.
    pub fn close_log(&mut self) -> Result<()> {
        if let Some(log) = self.varlog.take() {
            let rows = log.rows();
            log.into_inner()?;
            info!(rows, "variance file closed");
        }
        Ok(())
    }
}
