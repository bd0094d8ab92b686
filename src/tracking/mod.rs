//! Tracking lifecycle: flashcode detection, initial pose, model tracking and
//! recovery.
//!
//! - `tracker`: the state machine and its transition function
//! - `session`: the mutable context, guards and actions
//! - `marker`, `roi`: marker geometry and its projection
//! - `collaborators`: detector / pose estimator / model tracker contracts

pub mod collaborators;
pub mod event;
pub mod marker;
pub mod result;
pub mod roi;
pub mod session;
pub mod state;
pub mod tracker;

pub use collaborators::{FiducialDetector, ModelTracker, PoseEstimator, TrackOutput};
pub use event::{EventKind, Frame, TrackingEvent};
pub use marker::{FlashcodeCorrespondence, MarkerModel};
pub use result::{StepResult, TimingStats, Transition};
pub use roi::{ModelProjection, Roi};
pub use session::TrackingSession;
pub use state::TrackingState;
pub use tracker::Tracker;
