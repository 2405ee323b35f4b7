use std::time::Duration;

///
/// Redis expires keys with millisecond precision, plus one millisecond of slack for small TTLs.
///
pub const DEFAULT_CLOCK_RESOLUTION: Duration = Duration::from_millis(2);

pub const DEFAULT_DRIFT_FACTOR: f64 = 0.01;

///
/// Conservative model of how much of a TTL a holder may actually rely on.
///
/// The drift allowance is `ttl * drift_factor + clock_resolution`, where `drift_factor` is the
/// assumed relative clock skew across the endpoints over the lifetime of the lock.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftModel {
    pub drift_factor: f64,
    pub clock_resolution: Duration,
}

impl Default for DriftModel {
    fn default() -> Self {
        Self {
            drift_factor: DEFAULT_DRIFT_FACTOR,
            clock_resolution: DEFAULT_CLOCK_RESOLUTION,
        }
    }
}

impl DriftModel {
    pub fn new(drift_factor: f64, clock_resolution: Duration) -> Self {
        Self {
            drift_factor,
            clock_resolution,
        }
    }

    pub fn drift_allowance(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.drift_factor) + self.clock_resolution
    }

    ///
    /// Remaining validity of a lock requested for `ttl` whose acquisition round took `elapsed`.
    ///
    /// Saturates at zero; a zero result means the acquisition must be treated as failed.
    ///
    pub fn compute_validity(&self, ttl: Duration, elapsed: Duration) -> Duration {
        ttl.saturating_sub(elapsed)
            .saturating_sub(self.drift_allowance(ttl))
    }
}
