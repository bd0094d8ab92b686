//! Lifecycle state machine: detect flashcode → initial pose → model tracking
//! → recovery.
//!
//! Events are processed one at a time to completion. A successful detection
//! raises `PoseReady` internally, so detection and pose initialization happen
//! within the same `process` call.

use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::geometry::PlanarPoseEstimator;
use crate::health::HealthVerdict;
use crate::tracking::collaborators::{FiducialDetector, ModelTracker, PoseEstimator};
use crate::tracking::event::{EventKind, TrackingEvent};
use crate::tracking::result::{StepResult, TimingStats, Transition};
use crate::tracking::session::TrackingSession;
use crate::tracking::TrackingState;

/// Main tracking structure.
pub struct Tracker<D, M, P = PlanarPoseEstimator> {
    state: TrackingState,
    session: TrackingSession,
    detector: D,
    model_tracker: M,
    estimator: P,
}

impl<D: FiducialDetector, M: ModelTracker> Tracker<D, M, PlanarPoseEstimator> {
    pub fn new(config: TrackerConfig, detector: D, model_tracker: M) -> Result<Self> {
        let estimator = PlanarPoseEstimator::with_max_rms(config.max_pose_rms);
        Self::with_estimator(config, detector, model_tracker, estimator)
    }
}

impl<D, M, P> Tracker<D, M, P>
where
    D: FiducialDetector,
    M: ModelTracker,
    P: PoseEstimator,
{
    pub fn with_estimator(
        config: TrackerConfig,
        detector: D,
        model_tracker: M,
        estimator: P,
    ) -> Result<Self> {
        config.log_summary();
        Ok(Self {
            state: TrackingState::default(),
            session: TrackingSession::new(config)?,
            detector,
            model_tracker,
            estimator,
        })
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn session(&self) -> &TrackingSession {
        &self.session
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }

    pub fn model_tracker(&self) -> &M {
        &self.model_tracker
    }

    pub fn model_tracker_mut(&mut self) -> &mut M {
        &mut self.model_tracker
    }

    /// Process one event to completion.
    ///
    /// Errors are fatal for the session (see
    /// [`TrackingError::UninitializedImage`](crate::error::TrackingError)); the
    /// state is left where the failing guard ran.
    pub fn process(&mut self, event: TrackingEvent) -> Result<StepResult> {
        let t_start = Instant::now();
        let mut timing = TimingStats::zero();
        let mut verdict = None;
        let mut transitions = Vec::new();

        let mut pending = Some(event);
        while let Some(event) = pending.take() {
            let from = self.state;
            let trigger = event.kind();
            let Some(to) = self.transition(event, &mut timing, &mut verdict)? else {
                continue;
            };

            if from != to {
                info!("{} -> {} ({:?})", from, to, trigger);
            } else {
                debug!("{} -> {} ({:?})", from, to, trigger);
            }
            self.state = to;
            transitions.push(Transition { from, to, trigger });

            if to == TrackingState::DetectModel && trigger != EventKind::PoseReady {
                pending = Some(TrackingEvent::PoseReady);
            }
        }

        timing.total_ms = elapsed_ms(t_start);
        Ok(StepResult {
            state: self.state,
            transitions,
            pose: self.session.pose().cloned(),
            verdict,
            roi: self.session.roi(),
            timing,
        })
    }

    pub fn shutdown(&mut self) -> Result<StepResult> {
        self.process(TrackingEvent::Shutdown)
    }

    /// Transition function. Returns `None` when the event does not apply to
    /// the current state.
    fn transition(
        &mut self,
        event: TrackingEvent,
        timing: &mut TimingStats,
        verdict: &mut Option<HealthVerdict>,
    ) -> Result<Option<TrackingState>> {
        use TrackingState::*;

        let next = match (self.state, event) {
            (Finished, _) => return Ok(None),

            (_, TrackingEvent::Shutdown) => {
                if let Err(err) = self.session.close_log() {
                    warn!("{err:#}");
                }
                Finished
            }

            (WaitingForInput, TrackingEvent::SelectInput) => {
                self.session.select_input();
                DetectFlashcode
            }

            (WaitingForInput, TrackingEvent::InputReady(_)) => {
                if self.session.input_selected() {
                    DetectFlashcode
                } else {
                    WaitingForInput
                }
            }

            (DetectFlashcode, TrackingEvent::InputReady(frame)) => {
                self.session.load_frame(frame);
                let t = Instant::now();
                let detected = self.session.detect_full(&mut self.detector);
                timing.detect_ms += elapsed_ms(t);

                if detected {
                    DetectModel
                } else {
                    DetectFlashcode
                }
            }

            (DetectModel, TrackingEvent::PoseReady) => {
                let t = Instant::now();
                let found = self
                    .session
                    .estimate_initial_pose(&self.estimator, &mut self.model_tracker);
                timing.pose_ms += elapsed_ms(t);

                if found? {
                    TrackModel
                } else {
                    DetectFlashcode
                }
            }

            (TrackModel, TrackingEvent::InputReady(frame)) => {
                self.session.load_frame(frame);
                self.session.prepare_working_image();
                if self.track(timing, verdict) {
                    TrackModel
                } else {
                    ReDetectFlashcode
                }
            }

            (ReDetectFlashcode, TrackingEvent::InputReady(frame)) => {
                self.session.load_frame(frame);
                let t = Instant::now();
                let detected = self.session.detect_in_roi(&mut self.detector);
                timing.detect_ms += elapsed_ms(t);

                if detected {
                    DetectModel
                } else {
                    self.session.prepare_working_image();
                    if self.track(timing, verdict) {
                        TrackModel
                    } else {
                        DetectFlashcode
                    }
                }
            }

            (state, event) => {
                debug!("{:?} ignored in {}", event.kind(), state);
                return Ok(None);
            }
        };
        Ok(Some(next))
    }

    /// `mbt_success` guard followed by the `track_model` action when it passes.
    fn track(&mut self, timing: &mut TimingStats, verdict: &mut Option<HealthVerdict>) -> bool {
        let t = Instant::now();
        let result = self.session.check_tracking(&mut self.model_tracker);
        let passed = result.passed();
        if passed {
            self.session.update_projection(&mut self.model_tracker);
        } else if let Some(failed) = &result.failed {
            info!(iteration = self.session.iteration(), "tracking rejected: {}", failed);
        }
        timing.track_ms += elapsed_ms(t);

        *verdict = Some(result);
        passed
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
