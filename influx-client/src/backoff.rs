//! Backoff policies used to quarantine failing hosts.
//!
//! Strategies are immutable values: `next()` and `reset()` hand back a new
//! strategy and leave the receiver untouched, so one template can be shared
//! by every host in a pool.

use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;

/// A policy for increasing delays after consecutive failures.
pub trait BackoffStrategy: Debug + Send + Sync {
    /// Delay to wait before the next attempt. Re-sampled on every call.
    fn delay(&self) -> Duration;

    /// Strategy representing one more observed failure.
    fn next(&self) -> Box<dyn BackoffStrategy>;

    /// Strategy representing the zero-failure state.
    fn reset(&self) -> Box<dyn BackoffStrategy>;
}

// ------------------------------------------------------------------ //
//  Exponential backoff                                                //
// ------------------------------------------------------------------ //

/// Tuning knobs for [`ExponentialBackoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialOptions {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on any computed delay.
    pub max: Duration,
    /// Maximum number of doublings randomly subtracted from the exponent.
    pub jitter: f64,
}

impl Default for ExponentialOptions {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(300),
            max: Duration::from_secs(10),
            jitter: 1.0,
        }
    }
}

/// `delay = min(max, initial * 2^max(0, n - round(rand * jitter)))`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    options: ExponentialOptions,
    counter: u32,
}

impl ExponentialBackoff {
    pub fn new(options: ExponentialOptions) -> Self {
        Self {
            options,
            counter: 0,
        }
    }

    /// Number of consecutive failures this strategy represents.
    pub fn attempts(&self) -> u32 {
        self.counter
    }

    pub fn options(&self) -> ExponentialOptions {
        self.options
    }

    fn delay_with_offset(&self, offset: u32) -> Duration {
        let exponent = self.counter.saturating_sub(offset).min(63);
        let initial = self.options.initial.as_millis() as u64;
        let max = self.options.max.as_millis() as u64;
        let millis = initial.saturating_mul(1u64 << exponent).min(max);
        Duration::from_millis(millis)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(ExponentialOptions::default())
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self) -> Duration {
        let jitter = self.options.jitter.max(0.0);
        let offset = if jitter > 0.0 {
            (rand::thread_rng().gen::<f64>() * jitter).round() as u32
        } else {
            0
        };
        self.delay_with_offset(offset)
    }

    fn next(&self) -> Box<dyn BackoffStrategy> {
        Box::new(Self {
            options: self.options,
            counter: self.counter.saturating_add(1),
        })
    }

    fn reset(&self) -> Box<dyn BackoffStrategy> {
        Box::new(Self::new(self.options))
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
