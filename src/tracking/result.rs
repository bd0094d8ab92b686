//! What happened while processing one event.

use crate::geometry::SE3;
use crate::health::HealthVerdict;
use crate::tracking::event::EventKind;
use crate::tracking::roi::Roi;
use crate::tracking::TrackingState;

/// One state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TrackingState,
    pub to: TrackingState,
    pub trigger: EventKind,
}

/// Summary of one `Tracker::process` call.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// State after the event (and any internal completion event).
    pub state: TrackingState,
    /// Transitions taken, in order. Self-loops are included.
    pub transitions: Vec<Transition>,
    /// Current model pose `cMo`, once one has been estimated.
    pub pose: Option<SE3>,
    /// Health verdict, when a health check ran.
    pub verdict: Option<HealthVerdict>,
    /// Region used for the next re-detection.
    pub roi: Option<Roi>,
    pub timing: TimingStats,
}

impl StepResult {
    /// States visited, starting with the state before the event.
    pub fn path(&self) -> Vec<TrackingState> {
        let mut path: Vec<TrackingState> = self.transitions.iter().map(|t| t.from).take(1).collect();
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

/// Timing breakdown for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingStats {
    pub total_ms: f64,
    pub detect_ms: f64,
    pub pose_ms: f64,
    pub track_ms: f64,
}

impl TimingStats {
    pub fn zero() -> Self {
        Self::default()
    }
}
