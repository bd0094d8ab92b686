//! Running diagnostics over the scalar streams seen by the health check.
//!
//! Purely observational: nothing here feeds a tracking decision.

use nalgebra::Vector6;
use serde::Serialize;

use crate::health::hinkley::DOF;

/// Axis labels in covariance-diagonal order.
pub const AXIS_NAMES: [&str; DOF] = ["x", "y", "z", "wx", "wy", "wz"];

/// Online quantile estimate using the P² algorithm (Jain & Chlamtac, 1985).
///
/// Constant memory: five markers whose heights track the minimum, the
/// `p/2`, `p`, `(1+p)/2` quantiles, and the maximum.
#[derive(Debug, Clone)]
pub struct P2Quantile {
    p: f64,
    count: usize,
    /// Marker heights.
    q: [f64; 5],
    /// Actual marker positions (1-based).
    n: [f64; 5],
    /// Desired marker positions.
    desired: [f64; 5],
    increments: [f64; 5],
}

impl P2Quantile {
    pub fn new(p: f64) -> Self {
        let p = p.clamp(0.0, 1.0);
        Self {
            p,
            count: 0,
            q: [0.0; 5],
            n: [1.0, 2.0, 3.0, 4.0, 5.0],
            desired: [1.0, 1.0 + 2.0 * p, 1.0 + 4.0 * p, 3.0 + 2.0 * p, 5.0],
            increments: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
        }
    }

    pub fn median() -> Self {
        Self::new(0.5)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn push(&mut self, x: f64) {
        if self.count < 5 {
            self.q[self.count] = x;
            self.count += 1;
            if self.count == 5 {
                self.q.sort_by(f64::total_cmp);
            }
            return;
        }
        self.count += 1;

        // Cell containing x, extending the extremes if needed
        let k = if x < self.q[0] {
            self.q[0] = x;
            0
        } else if x >= self.q[4] {
            self.q[4] = x;
            3
        } else {
            (0..4).find(|&i| x < self.q[i + 1]).unwrap_or(3)
        };

        for i in (k + 1)..5 {
            self.n[i] += 1.0;
        }
        for i in 0..5 {
            self.desired[i] += self.increments[i];
        }

        for i in 1..4 {
            let d = self.desired[i] - self.n[i];
            if (d >= 1.0 && self.n[i + 1] - self.n[i] > 1.0)
                || (d <= -1.0 && self.n[i - 1] - self.n[i] < -1.0)
            {
                let d = d.signum();
                let candidate = self.parabolic(i, d);
                self.q[i] = if self.q[i - 1] < candidate && candidate < self.q[i + 1] {
                    candidate
                } else {
                    self.linear(i, d)
                };
                self.n[i] += d;
            }
        }
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let (q, n) = (&self.q, &self.n);
        q[i] + d / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + d) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - d) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let j = if d > 0.0 { i + 1 } else { i - 1 };
        self.q[i] + d * (self.q[j] - self.q[i]) / (self.n[j] - self.n[i])
    }

    /// Current quantile estimate; exact while fewer than five samples were seen.
    pub fn estimate(&self) -> Option<f64> {
        match self.count {
            0 => None,
            c if c < 5 => {
                let mut seen = self.q[..c].to_vec();
                seen.sort_by(f64::total_cmp);
                let pos = self.p * (c - 1) as f64;
                let lo = pos.floor() as usize;
                let hi = pos.ceil() as usize;
                Some(seen[lo] + (seen[hi] - seen[lo]) * (pos - lo as f64))
            }
            _ => Some(self.q[2]),
        }
    }
}

/// Median, mean, and max of one stream.
#[derive(Debug, Clone)]
pub struct RunningStats {
    count: usize,
    sum: f64,
    max: f64,
    median: P2Quantile,
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            max: f64::NEG_INFINITY,
            median: P2Quantile::median(),
        }
    }

    pub fn push(&mut self, x: f64) {
        self.count += 1;
        self.sum += x;
        self.max = self.max.max(x);
        self.median.push(x);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn median(&self) -> Option<f64> {
        self.median.estimate()
    }

    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            count: self.count,
            median: self.median(),
            mean: self.mean(),
            max: self.max(),
        }
    }
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one stream, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub count: usize,
    pub median: Option<f64>,
    pub mean: Option<f64>,
    pub max: Option<f64>,
}

/// Snapshot of all streams.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSummary {
    pub variance: StreamSummary,
    pub axes: Vec<(String, StreamSummary)>,
    pub checkpoints: StreamSummary,
}

/// Accumulators for covariance samples and checkpoint intensities.
#[derive(Debug, Clone, Default)]
pub struct TrackingStatistics {
    /// All covariance-diagonal samples pooled together.
    pub var: RunningStats,
    /// One stream per DOF.
    pub axes: [RunningStats; DOF],
    /// Grayscale values sampled inside checkpoint windows.
    pub checkpoints: RunningStats,
}

impl TrackingStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_covariance(&mut self, diagonal: &Vector6<f64>) {
        for (axis, value) in self.axes.iter_mut().zip(diagonal.iter()) {
            if !value.is_finite() {
                continue;
            }
            self.var.push(*value);
            axis.push(*value);
        }
    }

    pub fn push_checkpoint(&mut self, intensity: u8) {
        self.checkpoints.push(f64::from(intensity));
    }

    pub fn summary(&self) -> StatisticsSummary {
        StatisticsSummary {
            variance: self.var.summary(),
            axes: AXIS_NAMES
                .iter()
                .zip(self.axes.iter())
                .map(|(name, stats)| (name.to_string(), stats.summary()))
                .collect(),
            checkpoints: self.checkpoints.summary(),
        }
    }
}
