//! Hinkley cumulative-sum test for abrupt upward shifts in a scalar stream.
//!
//! For a stream `s_k` with running mean `m_k`:
//!
//! ```text
//! T_k = Σ (s_i - m_{i-1} - δ/2)
//! N_k = min_{i≤k} T_i
//! jump  ⇔  T_k - N_k > α
//! ```
//!
//! `m_{i-1}` is the mean of the samples before `s_i` (the first sample is its
//! own reference). After a jump the detector restarts from scratch so the new
//! level becomes the reference. Non-finite samples are ignored.

use nalgebra::Vector6;

/// Number of pose degrees of freedom monitored.
pub const DOF: usize = 6;

/// One-sided upward-jump detector.
#[derive(Debug, Clone)]
pub struct Hinkley {
    /// Jump threshold `α`.
    alpha: f64,
    /// Half the minimal jump magnitude, `δ/2`.
    dmin2: f64,
    n_signal: u64,
    mean: f64,
    tk: f64,
    nk: f64,
}

impl Hinkley {
    pub fn new(alpha: f64, delta: f64) -> Self {
        Self {
            alpha,
            dmin2: delta / 2.0,
            n_signal: 0,
            mean: 0.0,
            tk: 0.0,
            nk: 0.0,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn delta(&self) -> f64 {
        self.dmin2 * 2.0
    }

    /// Number of samples since construction or the last detected jump.
    pub fn samples(&self) -> u64 {
        self.n_signal
    }

    /// Feed one sample. Returns `true` when an upward jump is detected.
    pub fn feed(&mut self, signal: f64) -> bool {
        if !signal.is_finite() {
            return false;
        }

        self.n_signal += 1;
        if self.n_signal == 1 {
            self.mean = signal;
        }

        self.tk += signal - self.mean - self.dmin2;
        if self.tk < self.nk {
            self.nk = self.tk;
        }

        let jump = self.tk - self.nk > self.alpha;
        if jump {
            self.reset();
        } else {
            self.mean += (signal - self.mean) / self.n_signal as f64;
        }
        jump
    }

    fn reset(&mut self) {
        self.n_signal = 0;
        self.mean = 0.0;
        self.tk = 0.0;
        self.nk = 0.0;
    }
}

/// One detector per pose DOF, all sharing the same `(α, δ)`.
#[derive(Debug, Clone)]
pub struct ChangePointBank {
    detectors: [Hinkley; DOF],
}

impl ChangePointBank {
    pub fn new(alpha: f64, delta: f64) -> Self {
        Self {
            detectors: std::array::from_fn(|_| Hinkley::new(alpha, delta)),
        }
    }

    /// Feed the six covariance diagonal values in DOF order.
    ///
    /// Stops at the first DOF signalling a jump and returns its index; later
    /// detectors are not fed for this frame. A frame with a non-finite value
    /// is not fed at all.
    pub fn feed(&mut self, values: &Vector6<f64>) -> Option<usize> {
        if values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        self.detectors
            .iter_mut()
            .zip(values.iter())
            .position(|(detector, value)| detector.feed(*value))
    }

    pub fn detectors(&self) -> &[Hinkley; DOF] {
        &self.detectors
    }
}
