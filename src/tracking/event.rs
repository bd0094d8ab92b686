//! Events consumed by the tracker.

use image::RgbaImage;

use crate::geometry::CameraModel;

/// One captured image with the intrinsics it was taken with.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub image: RgbaImage,
    pub camera: CameraModel,
}

impl Frame {
    pub fn new(index: u64, image: RgbaImage, camera: CameraModel) -> Self {
        Self {
            index,
            image,
            camera,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TrackingEvent {
    /// A new frame arrived from the source.
    InputReady(Frame),
    /// The host selected a frame source.
    SelectInput,
    /// Flashcode correspondences are ready for initial pose estimation.
    /// Raised internally right after a successful detection.
    PoseReady,
    Shutdown,
}

/// Event discriminant, kept in transition reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    InputReady,
    SelectInput,
    PoseReady,
    Shutdown,
}

impl TrackingEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TrackingEvent::InputReady(_) => EventKind::InputReady,
            TrackingEvent::SelectInput => EventKind::SelectInput,
            TrackingEvent::PoseReady => EventKind::PoseReady,
            TrackingEvent::Shutdown => EventKind::Shutdown,
        }
    }
}
