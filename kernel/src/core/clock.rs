//! Time conversion for the simulation
//!
//! The kernel counts virtual time in integer ticks. Callers usually think in
//! floating-point "time units"; a `Clock` converts between the two using a
//! ticks-per-unit-time factor. It holds no current time itself: the current
//! tick belongs to the (possibly shared) timeline.

use crate::core::error::SimError;
use serde::{Deserialize, Serialize};

/// Converts between simulation time and ticks
///
/// # Example
/// ```
/// use des_kernel::Clock;
///
/// let clock = Clock::new(10.0).unwrap(); // 10 ticks per unit of time
/// assert_eq!(clock.ticks(2.5), 25);
/// assert_eq!(clock.time(25), 2.5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Clock {
    /// Number of ticks in one unit of simulation time
    ticks_per_unit_time: f64,
}

impl Clock {
    /// Create a new Clock
    ///
    /// # Arguments
    /// * `ticks_per_unit_time` - Must be finite and strictly positive
    pub fn new(ticks_per_unit_time: f64) -> Result<Self, SimError> {
        if !ticks_per_unit_time.is_finite() || ticks_per_unit_time <= 0.0 {
            return Err(SimError::InvalidArgument(format!(
                "ticks_per_unit_time must be finite and positive, got {}",
                ticks_per_unit_time
            )));
        }
        Ok(Self { ticks_per_unit_time })
    }

    /// Ticks per unit of simulation time
    pub fn ticks_per_unit_time(&self) -> f64 {
        self.ticks_per_unit_time
    }

    /// Convert a time to ticks, rounding to the nearest tick
    ///
    /// # Example
    /// ```
    /// use des_kernel::Clock;
    ///
    /// let clock = Clock::new(4.0).unwrap();
    /// assert_eq!(clock.ticks(1.1), 4);
    /// assert_eq!(clock.ticks(1.2), 5);
    /// ```
    pub fn ticks(&self, time: f64) -> i64 {
        (time * self.ticks_per_unit_time).round() as i64
    }

    /// Convert a time to ticks, rounding up
    pub fn ticks_ceil(&self, time: f64) -> i64 {
        (time * self.ticks_per_unit_time).ceil() as i64
    }

    /// Convert a time to ticks, rounding down
    pub fn ticks_floor(&self, time: f64) -> i64 {
        (time * self.ticks_per_unit_time).floor() as i64
    }

    /// Convert ticks to simulation time
    pub fn time(&self, ticks: i64) -> f64 {
        ticks as f64 / self.ticks_per_unit_time
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            ticks_per_unit_time: 1.0,
        }
    }
}
