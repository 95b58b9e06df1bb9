//! Telemetry samplers.
//!
//! A sampler decides per request whether detailed telemetry is recorded.
//! The decision is made once at pipeline entry and published on the
//! request context.
//!
//! | Strategy | Decision | `update_rate` |
//! |---|---|---|
//! | Always | always `true` | no-op |
//! | Never | always `false` | no-op |
//! | Probabilistic | `random < rate` | `rate ∈ [0, 1]` |
//! | RateLimiting | at most `max_per_second` per 1 s window | `rate > 0` |
//! | Adaptive | `random < current` | `current ∈ [min, max]` |

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Load above which the adaptive sampler drops to its minimum rate.
pub const HIGH_LOAD: f64 = 0.8;

/// Load below which the adaptive sampler rises to its maximum rate.
pub const LOW_LOAD: f64 = 0.3;

const WINDOW: Duration = Duration::from_secs(1);

/// Invalid sampler parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplerError {
    /// A rate was outside the range the sampler accepts.
    #[error("sampling rate {rate} is outside [{min}, {max}]")]
    InvalidRate {
        /// The rejected value.
        rate: f64,
        /// Lowest accepted value.
        min: f64,
        /// Highest accepted value.
        max: f64,
    },

    /// Adaptive bounds with `min > max` or outside `[0, 1]`.
    #[error("invalid adaptive bounds: min {min}, max {max}")]
    InvalidBounds {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
}

fn check_rate(rate: f64, min: f64, max: f64) -> Result<f64, SamplerError> {
    if rate.is_finite() && (min..=max).contains(&rate) {
        Ok(rate)
    } else {
        Err(SamplerError::InvalidRate { rate, min, max })
    }
}

/// Samples each request with a fixed probability.
pub struct ProbabilisticSampler {
    rate: RwLock<f64>,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for ProbabilisticSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbabilisticSampler")
            .field("rate", &self.rate())
            .finish_non_exhaustive()
    }
}

impl ProbabilisticSampler {
    /// Creates a sampler with the given rate, seeded from the OS.
    pub fn new(rate: f64) -> Result<Self, SamplerError> {
        Self::with_rng(rate, StdRng::from_os_rng())
    }

    /// Creates a sampler with a fixed seed.
    pub fn with_seed(rate: f64, seed: u64) -> Result<Self, SamplerError> {
        Self::with_rng(rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(rate: f64, rng: StdRng) -> Result<Self, SamplerError> {
        Ok(Self {
            rate: RwLock::new(check_rate(rate, 0.0, 1.0)?),
            rng: Mutex::new(rng),
        })
    }

    /// Draws a sampling decision.
    pub fn should_sample(&self) -> bool {
        let rate = *self.rate.read();
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.rng.lock().random::<f64>() < rate
    }

    /// Returns the sampling probability.
    pub fn rate(&self) -> f64 {
        *self.rate.read()
    }

    /// Replaces the sampling probability.
    pub fn update_rate(&self, rate: f64) -> Result<(), SamplerError> {
        *self.rate.write() = check_rate(rate, 0.0, 1.0)?;
        Ok(())
    }
}

#[derive(Debug)]
struct Window {
    start: Instant,
    count: u32,
}

/// Admits at most `max_per_second` decisions per one-second window.
#[derive(Debug)]
pub struct RateLimitingSampler {
    max_per_second: RwLock<u32>,
    window: Mutex<Window>,
}

impl RateLimitingSampler {
    /// Creates a sampler admitting `max_per_second` requests per second.
    pub fn new(max_per_second: u32) -> Result<Self, SamplerError> {
        Self::new_at(max_per_second, Instant::now())
    }

    /// Creates a sampler whose first window starts at `now`.
    pub fn new_at(max_per_second: u32, now: Instant) -> Result<Self, SamplerError> {
        check_rate(f64::from(max_per_second), 1.0, f64::from(u32::MAX))?;
        Ok(Self {
            max_per_second: RwLock::new(max_per_second),
            window: Mutex::new(Window {
                start: now,
                count: 0,
            }),
        })
    }

    /// Draws a sampling decision now.
    pub fn should_sample(&self) -> bool {
        self.should_sample_at(Instant::now())
    }

    /// Draws a sampling decision at `now`.
    pub fn should_sample_at(&self, now: Instant) -> bool {
        let max = *self.max_per_second.read();
        let mut window = self.window.lock();
        if now.saturating_duration_since(window.start) >= WINDOW {
            window.start = now;
            window.count = 0;
        }
        if window.count >= max {
            return false;
        }
        window.count += 1;
        true
    }

    /// Returns the per-second budget.
    pub fn rate(&self) -> f64 {
        f64::from(*self.max_per_second.read())
    }

    /// Replaces the per-second budget. Fractions are truncated.
    pub fn update_rate(&self, rate: f64) -> Result<(), SamplerError> {
        let rate = check_rate(rate, 1.0, f64::from(u32::MAX))?;
        *self.max_per_second.write() = rate as u32;
        Ok(())
    }
}

/// Probabilistic sampler whose rate follows an external load signal.
#[derive(Debug)]
pub struct AdaptiveSampler {
    inner: ProbabilisticSampler,
    min: f64,
    max: f64,
}

impl AdaptiveSampler {
    /// Creates a sampler starting at `base` and bounded by `[min, max]`.
    pub fn new(base: f64, min: f64, max: f64) -> Result<Self, SamplerError> {
        Self::with_rng(base, min, max, StdRng::from_os_rng())
    }

    /// Creates a sampler with a fixed seed.
    pub fn with_seed(base: f64, min: f64, max: f64, seed: u64) -> Result<Self, SamplerError> {
        Self::with_rng(base, min, max, StdRng::seed_from_u64(seed))
    }

    fn with_rng(base: f64, min: f64, max: f64, rng: StdRng) -> Result<Self, SamplerError> {
        if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max {
            return Err(SamplerError::InvalidBounds { min, max });
        }
        check_rate(base, min, max)?;
        Ok(Self {
            inner: ProbabilisticSampler::with_rng(base, rng)?,
            min,
            max,
        })
    }

    /// Draws a sampling decision against the current rate.
    pub fn should_sample(&self) -> bool {
        self.inner.should_sample()
    }

    /// Returns the current rate.
    pub fn rate(&self) -> f64 {
        self.inner.rate()
    }

    /// Returns the `(min, max)` bounds.
    pub const fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Sets the current rate, which must lie within the bounds.
    pub fn update_rate(&self, rate: f64) -> Result<(), SamplerError> {
        check_rate(rate, self.min, self.max)?;
        self.inner.update_rate(rate)
    }

    /// Moves the rate in response to a load reading in `[0, 1]`.
    ///
    /// Readings outside the range are clamped. Returns the new rate.
    pub fn adjust_for_load(&self, load: f64) -> f64 {
        let load = if load.is_nan() { 1.0 } else { load.clamp(0.0, 1.0) };
        let rate = if load > HIGH_LOAD {
            self.min
        } else if load < LOW_LOAD {
            self.max
        } else {
            (self.max - self.min).mul_add((HIGH_LOAD - load) / (HIGH_LOAD - LOW_LOAD), self.min)
        };
        let rate = rate.clamp(self.min, self.max);
        *self.inner.rate.write() = rate;
        tracing::debug!(load, rate, "adaptive sampling rate adjusted");
        rate
    }
}

/// A sampling strategy.
#[derive(Debug, Default)]
pub enum Sampler {
    /// Samples every request.
    #[default]
    Always,
    /// Samples nothing.
    Never,
    /// Samples with a fixed probability.
    Probabilistic(ProbabilisticSampler),
    /// Samples up to a per-second budget.
    RateLimiting(RateLimitingSampler),
    /// Samples with a load-driven probability.
    Adaptive(AdaptiveSampler),
}

impl Sampler {
    /// Probabilistic sampler at `rate`.
    pub fn probabilistic(rate: f64) -> Result<Self, SamplerError> {
        ProbabilisticSampler::new(rate).map(Self::Probabilistic)
    }

    /// Rate-limiting sampler with a per-second budget.
    pub fn rate_limiting(max_per_second: u32) -> Result<Self, SamplerError> {
        RateLimitingSampler::new(max_per_second).map(Self::RateLimiting)
    }

    /// Adaptive sampler starting at `base` within `[min, max]`.
    pub fn adaptive(base: f64, min: f64, max: f64) -> Result<Self, SamplerError> {
        AdaptiveSampler::new(base, min, max).map(Self::Adaptive)
    }

    /// Returns the strategy name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::Probabilistic(_) => "probabilistic",
            Self::RateLimiting(_) => "rate_limiting",
            Self::Adaptive(_) => "adaptive",
        }
    }

    /// Draws a sampling decision.
    pub fn should_sample(&self) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Probabilistic(s) => s.should_sample(),
            Self::RateLimiting(s) => s.should_sample(),
            Self::Adaptive(s) => s.should_sample(),
        }
    }

    /// Returns the strategy's rate: a probability, or a per-second budget
    /// for rate limiting.
    pub fn rate(&self) -> f64 {
        match self {
            Self::Always => 1.0,
            Self::Never => 0.0,
            Self::Probabilistic(s) => s.rate(),
            Self::RateLimiting(s) => s.rate(),
            Self::Adaptive(s) => s.rate(),
        }
    }

    /// Replaces the strategy's rate. A no-op for Always and Never.
    pub fn update_rate(&self, rate: f64) -> Result<(), SamplerError> {
        match self {
            Self::Always | Self::Never => Ok(()),
            Self::Probabilistic(s) => s.update_rate(rate),
            Self::RateLimiting(s) => s.update_rate(rate),
            Self::Adaptive(s) => s.update_rate(rate),
        }
    }
}
