//! CPU bandwidth and CPU time
//!
//! Two quantities drive every decision the governor makes:
//!
//! - [`Bandwidth`] is a *rate*: CPU-milliseconds a workspace may consume per
//!   wall-clock second. `Bandwidth(6000)` is six full CPUs.
//! - [`CpuTime`] is an *amount*: CPU time a workspace has consumed since its
//!   container started, as accounted by the kernel.
//!
//! # Kernel representation
//!
//! ```text
//! quota / period            bandwidth
//! ───────────────           ──────────
//! 60000µs / 10ms    ──►     6000 (6 CPUs)
//! 50000µs / 100ms   ──►      500 (half a CPU)
//! ```
//!
//! Conversions divide microseconds by milliseconds rather than seconds by
//! seconds so that everything stays in integer arithmetic.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quantity::Quantity;

/// CPU-milliseconds consumable per wall-clock second.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Bandwidth(pub u64);

/// Errors produced while deriving a bandwidth
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BandwidthError {
    /// Usage appeared to go backwards, e.g. after a counter reset
    #[error("invalid usage: t1 ({t1}) is smaller than t0 ({t0})")]
    InvalidUsage { t0: CpuTime, t1: CpuTime },
}

impl Bandwidth {
    /// Bandwidth granted by a CFS quota/period pair. A zero period yields zero.
    pub fn from_quota_and_period(quota: Duration, period: Duration) -> Self {
        let period_ms = period.as_millis();
        if period_ms == 0 {
            return Bandwidth(0);
        }
        Bandwidth((quota.as_micros() / period_ms) as u64)
    }

    /// Bandwidth from a CPU resource quantity: its milli-value is the bandwidth.
    ///
    /// `"500m"` is 500, `"2"` is 2000. Negative quantities clamp to zero.
    pub fn from_quantity(quantity: &Quantity) -> Self {
        Bandwidth(quantity.milli_value().max(0) as u64)
    }

    /// Realized consumption rate between two usage samples taken `dt` apart.
    pub fn from_usage(t0: CpuTime, t1: CpuTime, dt: Duration) -> Result<Self, BandwidthError> {
        if t1 < t0 {
            return Err(BandwidthError::InvalidUsage { t0, t1 });
        }
        let dt_ms = dt.as_millis();
        if dt_ms == 0 {
            return Ok(Bandwidth(0));
        }
        let consumed_us = (t1 - t0).as_micros() as u128;
        Ok(Bandwidth((consumed_us / dt_ms) as u64))
    }

    /// The CFS quota that grants this bandwidth for the given period.
    ///
    /// Inverse of [`Bandwidth::from_quota_and_period`].
    pub fn quota(self, period: Duration) -> Duration {
        let period_ms = period.as_millis() as u64;
        Duration::from_micros(self.0.saturating_mul(period_ms))
    }

    /// CPU time consumed when this bandwidth is sustained for `dt`.
    pub fn integrate(self, dt: Duration) -> CpuTime {
        let dt_ms = dt.as_millis() as i64;
        CpuTime::from_micros((self.0 as i64).saturating_mul(dt_ms))
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.0)
    }
}

impl Add for Bandwidth {
    type Output = Bandwidth;

    fn add(self, rhs: Bandwidth) -> Bandwidth {
        Bandwidth(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Bandwidth {
    fn add_assign(&mut self, rhs: Bandwidth) {
        *self = *self + rhs;
    }
}

/// Cumulative CPU time in nanoseconds.
///
/// Signed so that budgets can be subtracted past zero while walking buckets.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CpuTime(pub i64);

impl CpuTime {
    pub const ZERO: CpuTime = CpuTime(0);

    pub fn from_nanos(nanos: i64) -> Self {
        CpuTime(nanos)
    }

    pub fn from_micros(micros: i64) -> Self {
        CpuTime(micros.saturating_mul(1_000))
    }

    pub fn from_duration(d: Duration) -> Self {
        CpuTime(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn as_micros(self) -> i64 {
        self.0 / 1_000
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for CpuTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-{:?}", Duration::from_nanos(self.0.unsigned_abs()))
        } else {
            write!(f, "{:?}", Duration::from_nanos(self.0 as u64))
        }
    }
}

impl Add for CpuTime {
    type Output = CpuTime;

    fn add(self, rhs: CpuTime) -> CpuTime {
        CpuTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for CpuTime {
    fn add_assign(&mut self, rhs: CpuTime) {
        *self = *self + rhs;
    }
}

impl Sub for CpuTime {
    type Output = CpuTime;

    fn sub(self, rhs: CpuTime) -> CpuTime {
        CpuTime(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for CpuTime {
    fn sub_assign(&mut self, rhs: CpuTime) {
        *self = *self - rhs;
    }
}

impl Sum for CpuTime {
    fn sum<I: Iterator<Item = CpuTime>>(iter: I) -> CpuTime {
        iter.fold(CpuTime::ZERO, Add::add)
    }
}
