//! Path quality metrics and traffic allocation.
//!
//! Each bonded path is scored on five metrics:
//! - **latency**: mean of recent one-way latency samples
//! - **jitter**: packet delay variance (standard deviation of the same samples)
//! - **loss**: ratio of QoS-sampled packets never acknowledged
//! - **error**: ratio of packets that failed validation
//! - **speed**: user-declared link speed relative to the bond total
//!
//! Raw values are mapped to (0, 1] with `1 / e^(4x)` where `x` is the value
//! normalized against an acceptable ceiling. Scores are then expressed relative
//! to the best path in the bond, weighted, and turned into an allocation out of
//! 255.

use std::collections::VecDeque;

use crate::bond::BondError;

/// Sum of all path allocations in a bond.
pub const ALLOCATION_TOTAL: u32 = 255;

/// Number of quality metrics.
pub const METRIC_COUNT: usize = 5;

/// Bounded window of samples with mean and standard deviation.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    /// Population standard deviation
    pub fn stddev(&self) -> f32 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|s| (s - mean) * (s - mean))
            .sum::<f32>()
            / self.samples.len() as f32;
        variance.sqrt()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Relative importance of each metric. Always sums to 1 (within 0.01).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityWeights(pub(crate) [f32; METRIC_COUNT]);

impl QualityWeights {
    /// Validate and build a weight vector ordered latency, jitter, loss, error, speed.
    pub fn new(weights: [f32; METRIC_COUNT]) -> Result<Self, BondError> {
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(BondError::InvalidWeights {
                sum: weights.iter().sum(),
            });
        }
        let sum: f32 = weights.iter().sum();
        if sum <= 0.99 || sum >= 1.01 {
            return Err(BondError::InvalidWeights { sum });
        }
        Ok(Self(weights))
    }

    /// Build from a slice, requiring exactly five entries.
    pub fn from_slice(weights: &[f32]) -> Result<Self, BondError> {
        let arr: [f32; METRIC_COUNT] =
            weights.try_into().map_err(|_| BondError::WrongWeightCount {
                expected: METRIC_COUNT,
                actual: weights.len(),
            })?;
        Self::new(arr)
    }

    pub fn as_array(&self) -> [f32; METRIC_COUNT] {
        self.0
    }

    pub fn latency(&self) -> f32 {
        self.0[0]
    }

    pub fn jitter(&self) -> f32 {
        self.0[1]
    }

    pub fn loss(&self) -> f32 {
        self.0[2]
    }

    pub fn error(&self) -> f32 {
        self.0[3]
    }

    pub fn speed(&self) -> f32 {
        self.0[4]
    }
}

/// Ceilings beyond which a metric scores as badly as it can.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityLimits {
    /// ms
    pub max_latency: f32,
    /// ms
    pub max_jitter: f32,
    pub max_loss_ratio: f32,
    pub max_error_ratio: f32,
}

impl Default for QualityLimits {
    fn default() -> Self {
        Self {
            max_latency: 100.0,
            max_jitter: 50.0,
            max_loss_ratio: 0.10,
            max_error_ratio: 0.10,
        }
    }
}

/// Raw measurements of one path.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PathMeasurement {
    pub latency: f32,
    pub jitter: f32,
    pub loss_ratio: f32,
    pub error_ratio: f32,
    /// Relative speed in 0..=1
    pub speed: f32,
}

impl PathMeasurement {
    /// Per-metric scores in (0, 1], higher is better.
    pub fn scores(&self, limits: &QualityLimits) -> [f32; METRIC_COUNT] {
        [
            metric_score(self.latency, limits.max_latency),
            metric_score(self.jitter, limits.max_jitter),
            metric_score(self.loss_ratio, limits.max_loss_ratio),
            metric_score(self.error_ratio, limits.max_error_ratio),
            self.speed.clamp(0.0, 1.0),
        ]
    }
}

/// Clamp `value` into [min, max] and rescale to [0, 1].
pub fn normalize(value: f32, min: f32, max: f32) -> f32 {
    if max <= min || !value.is_finite() {
        return 0.0;
    }
    ((value - min) / (max - min)).clamp(0.0, 1.0)
}

/// `1 / e^(4x)` of the normalized value.
pub fn metric_score(value: f32, ceiling: f32) -> f32 {
    1.0 / (4.0 * normalize(value, 0.0, ceiling)).exp()
}

/// Exponentially weighted moving average.
pub fn ewma(previous: f32, sample: f32, alpha: f32) -> f32 {
    alpha * sample + (1.0 - alpha) * previous
}

/// Element-wise maximum over a set of score vectors.
pub fn score_maxima(scores: &[[f32; METRIC_COUNT]]) -> [f32; METRIC_COUNT] {
    let mut maxima = [0.0f32; METRIC_COUNT];
    for s in scores {
        for (m, v) in maxima.iter_mut().zip(s.iter()) {
            *m = m.max(*v);
        }
    }
    maxima
}

/// Quality of one path relative to the best observed value of each metric.
pub fn weighted_quality(
    scores: &[f32; METRIC_COUNT],
    maxima: &[f32; METRIC_COUNT],
    weights: &QualityWeights,
) -> f32 {
    scores
        .iter()
        .zip(maxima.iter())
        .zip(weights.as_array().iter())
        .map(|((s, m), w)| if *m > 0.0 { w * (s / m) } else { 0.0 })
        .sum()
}

/// Turn relative qualities into allocations that sum to exactly 255.
///
/// Each share is rounded up, then the excess is taken back one unit at a time
/// from the largest allocations. When no path has any quality the 255 units
/// are split evenly.
pub fn allocations(qualities: &[f32]) -> Vec<u8> {
    let n = qualities.len();
    if n == 0 {
        return Vec::new();
    }
    let total: f32 = qualities.iter().filter(|q| q.is_finite() && **q > 0.0).sum();
    let mut alloc: Vec<u32> = if total <= 0.0 {
        let base = ALLOCATION_TOTAL / n as u32;
        let extra = (ALLOCATION_TOTAL % n as u32) as usize;
        (0..n).map(|i| base + u32::from(i < extra)).collect()
    } else {
        qualities
            .iter()
            .map(|q| {
                let q = if q.is_finite() { q.max(0.0) } else { 0.0 };
                ((q / total) * ALLOCATION_TOTAL as f32).ceil().min(ALLOCATION_TOTAL as f32) as u32
            })
            .collect()
    };

    let mut sum: u32 = alloc.iter().sum();
    while sum > ALLOCATION_TOTAL {
        if let Some(largest) = index_of_max(&alloc) {
            alloc[largest] -= 1;
        }
        sum -= 1;
    }
    if sum < ALLOCATION_TOTAL {
        if let Some(largest) = index_of_max(&alloc) {
            alloc[largest] += ALLOCATION_TOTAL - sum;
        }
    }
    alloc.into_iter().map(|a| a as u8).collect()
}

fn index_of_max(values: &[u32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
        .map(|(i, _)| i)
}
