//! Eviction policy for the registry's periodic expiry sweep.
//!
//! When lease renewals stop arriving for many instances at once, the cause
//! is more often a sick network than dead instances. The eviction strategy
//! bounds how many registrations one sweep may expire: if the registry is
//! already missing more than its tolerated fraction of expected members,
//! eviction pauses entirely (self-preservation).

use serde::Deserialize;
use serde::Serialize;

/// Strategy allowing a sweep to evict at most a configured percentage of
/// the expected registry size, less whatever is already missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentageDropEvictionStrategy {
    drop_ratio: f64,
}

impl PercentageDropEvictionStrategy {
    /// Build from an integer percentage in `0..=100`.
    pub fn new(allowed_percentage_drop: u32) -> Self {
        debug_assert!(
            allowed_percentage_drop <= 100,
            "allowed drop percentage must be within 0..=100, got {}",
            allowed_percentage_drop
        );
        Self {
            drop_ratio: f64::from(allowed_percentage_drop) / 100.0,
        }
    }

    /// Number of registrations the current sweep may expire.
    ///
    /// `expected` is the registry size the strategy believes healthy
    /// (typically a [`RenewalAverage`] of recent counts), `actual` the size
    /// right now. Truncation toward zero is intentional.
    pub fn allowed_to_evict(&self, expected: u32, actual: u32) -> u32 {
        let max_allowed = (self.drop_ratio * f64::from(expected)) as i64;
        let current_deficit = i64::from(expected) - i64::from(actual);
        let delta = max_allowed - current_deficit;
        delta.max(0) as u32
    }
}

/// Exponentially weighted moving average of observed registration counts.
///
/// Supplies the `expected` input to the eviction strategy: updated once per
/// sweep interval with the count of currently registered instances, it
/// converges on the steady-state registry size while damping transient
/// dips that should not relax the eviction bound.
#[derive(Debug, Clone)]
pub struct RenewalAverage {
    smoothing: f64,
    value: Option<f64>,
}

impl RenewalAverage {
    /// Create an average keeping `smoothing` weight on history per update.
    pub fn new(smoothing: f64) -> Self {
        debug_assert!(
            (0.0..1.0).contains(&smoothing),
            "smoothing factor must be within [0, 1), got {}",
            smoothing
        );
        Self {
            smoothing,
            value: None,
        }
    }

    /// Fold one observed registration count into the average.
    pub fn observe(&mut self, count: u32) {
        let count = f64::from(count);
        self.value = Some(match self.value {
            None => count,
            Some(prev) => self.smoothing * prev + (1.0 - self.smoothing) * count,
        });
    }

    /// Current expected registry size, rounded to the nearest count.
    /// Zero until the first observation.
    pub fn expected_size(&self) -> u32 {
        self.value.map(|v| v.round() as u32).unwrap_or(0)
    }
}

impl Default for RenewalAverage {
    fn default() -> Self {
        Self::new(0.75)
    }
}
