use thiserror::Error;

/// Non-recoverable failures. Recoverable outcomes (detection, pose and health
/// failures) are guard results, never errors.
#[derive(Debug, Error, PartialEq)]
pub enum TrackingError {
    /// Initial pose estimation was invoked before a working image was set.
    #[error("uninitialized image")]
    UninitializedImage,
    #[error("invalid marker: {0}")]
    InvalidMarker(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
