//! Randomness and adaptive scaling for baseline sampling.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform draws in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

#[derive(Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Deterministic draws for tests and replays.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        SeededRandom {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.rng.lock().gen_range(0.0..1.0)
    }
}

/// Always returns the same draw.
#[derive(Debug)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("sampling scale unavailable: {0}")]
pub struct ScaleError(pub String);

/// Per-project multiplier applied to the baseline sample rate, typically below 1.0 to damp
/// sampling under load.
#[async_trait]
pub trait SamplingScale: Send + Sync {
    async fn scale(&self, project_id: &str) -> Result<f64, ScaleError>;
}

#[derive(Debug)]
pub struct FixedScale(pub f64);

impl Default for FixedScale {
    fn default() -> Self {
        FixedScale(1.0)
    }
}

#[async_trait]
impl SamplingScale for FixedScale {
    async fn scale(&self, _project_id: &str) -> Result<f64, ScaleError> {
        Ok(self.0)
    }
}

/// Effective sampling probability, clamped to `[0, 1]`.
pub fn effective_rate(baseline: f64, scale: f64) -> f64 {
    let scale = if scale.is_finite() { scale.max(0.0) } else { 1.0 };
    (baseline * scale).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_draws_are_replayable() {
        let a = SeededRandom::new(7);
        let b = SeededRandom::new(7);
        let draws_a: Vec<f64> = (0..5).map(|_| a.next_f64()).collect();
        let draws_b: Vec<f64> = (0..5).map(|_| b.next_f64()).collect();
        assert_eq!(draws_a, draws_b);
        assert!(draws_a.iter().all(|d| (0.0..1.0).contains(d)));
    }

    #[test]
    fn test_rate_is_clamped() {
        assert_eq!(effective_rate(0.05, 2.0), 0.1);
        assert_eq!(effective_rate(0.5, 4.0), 1.0);
        assert_eq!(effective_rate(0.05, -1.0), 0.0);
        assert_eq!(effective_rate(0.05, f64::NAN), 0.05);
    }
}
