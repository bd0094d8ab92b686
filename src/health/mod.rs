//! Tracking health: change-point detection, running statistics and the
//! per-frame health policy.

pub mod hinkley;
pub mod policy;
pub mod statistics;

pub use hinkley::{ChangePointBank, Hinkley, DOF};
pub use policy::{FailedCheck, HealthCheck, HealthInput, HealthVerdict};
pub use statistics::{RunningStats, StatisticsSummary, TrackingStatistics};
