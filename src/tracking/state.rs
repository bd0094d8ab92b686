//! Lifecycle states of the flashcode-assisted tracker.

use std::fmt;

/// State of the tracking lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingState {
    /// No frame source selected yet.
    WaitingForInput,
    /// Searching the full frame for the flashcode.
    DetectFlashcode,
    /// Flashcode found, waiting for the initial pose.
    DetectModel,
    /// Model-based tracking.
    TrackModel,
    /// Tracking judged unhealthy, searching the last ROI.
    ReDetectFlashcode,
    /// Shut down. Absorbing.
    Finished,
}

impl TrackingState {
    pub const ALL: [TrackingState; 6] = [
        TrackingState::WaitingForInput,
        TrackingState::DetectFlashcode,
        TrackingState::DetectModel,
        TrackingState::TrackModel,
        TrackingState::ReDetectFlashcode,
        TrackingState::Finished,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackingState::Finished)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrackingState::WaitingForInput => "WaitingForInput",
            TrackingState::DetectFlashcode => "DetectFlashcode",
            TrackingState::DetectModel => "DetectModel",
            TrackingState::TrackModel => "TrackModel",
            TrackingState::ReDetectFlashcode => "ReDetectFlashcode",
            TrackingState::Finished => "Finished",
        }
    }
}

impl Default for TrackingState {
    fn default() -> Self {
        Self::WaitingForInput
    }
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
