//! Model tracker returning a scripted pose and covariance.

use std::collections::VecDeque;

use anyhow::{bail, Result};
use image::GrayImage;
use nalgebra::Matrix6;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geometry::{CameraModel, SE3};
use crate::tracking::collaborators::{ModelTracker, TrackOutput};

/// What the next `track` call does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackStep {
    /// Ground-truth pose with the nominal variance.
    Nominal,
    /// Ground-truth pose with every variance set to the given value.
    Spike(f64),
    /// Report an error.
    Fail,
}

#[derive(Debug, Clone)]
pub struct ScriptedModelTracker {
    truth: SE3,
    variance: f64,
    noise: Option<(StdRng, f64)>,
    script: VecDeque<TrackStep>,
    initialized: bool,
    init_calls: usize,
    track_calls: usize,
    search_ranges: Vec<u32>,
}

impl ScriptedModelTracker {
    pub fn new(variance: f64) -> Self {
        Self {
            truth: SE3::identity(),
            variance,
            noise: None,
            script: VecDeque::new(),
            initialized: false,
            init_calls: 0,
            track_calls: 0,
            search_ranges: Vec::new(),
        }
    }

    /// Multiply each variance by `1 + u`, `u` uniform in `[-amplitude, amplitude]`.
    pub fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise = Some((StdRng::seed_from_u64(seed), amplitude.abs()));
        self
    }

    /// Pose returned by the next `track` calls.
    pub fn set_truth(&mut self, pose: SE3) {
        self.truth = pose;
    }

    pub fn push(&mut self, step: TrackStep) {
        self.script.push_back(step);
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls
    }

    pub fn track_calls(&self) -> usize {
        self.track_calls
    }

    pub fn search_ranges(&self) -> &[u32] {
        &self.search_ranges
    }

    fn sample(&mut self, base: f64) -> f64 {
        match &mut self.noise {
            Some((rng, amplitude)) if *amplitude > 0.0 => {
                base * (1.0 + rng.gen_range(-*amplitude..=*amplitude))
            }
            _ => base,
        }
    }
}

impl ModelTracker for ScriptedModelTracker {
    fn init(
        &mut self,
        _gray: &GrayImage,
        _camera: &CameraModel,
        _pose: &SE3,
        _convergence_steps: u32,
    ) -> Result<()> {
        self.initialized = true;
        self.init_calls += 1;
        Ok(())
    }

    fn track(&mut self, _gray: &GrayImage, _camera: &CameraModel) -> Result<TrackOutput> {
        if !self.initialized {
            bail!("model tracker used before initialization");
        }
        self.track_calls += 1;

        let base = match self.script.pop_front().unwrap_or(TrackStep::Nominal) {
            TrackStep::Nominal => self.variance,
            TrackStep::Spike(value) => value,
            TrackStep::Fail => bail!("not enough edge sites matched"),
        };

        let mut covariance = Matrix6::zeros();
        for i in 0..6 {
            covariance[(i, i)] = self.sample(base);
        }
        Ok(TrackOutput {
            pose: self.truth.clone(),
            covariance: Some(covariance),
        })
    }

    fn set_search_range(&mut self, range_px: u32) {
        self.search_ranges.push(range_px);
    }
}
