//! Governor configuration
//!
//! Loaded once at startup from a JSON file:
//!
//! ```json
//! {
//!   "enabled": true,
//!   "totalBandwidth": "12",
//!   "limit": "2",
//!   "burstLimit": "6",
//!   "controlPeriod": "15s",
//!   "cgroupBasePath": "/sys/fs/cgroup",
//!   "buckets": [{"budget": "5m", "limit": "6"}, {"budget": "5m", "limit": "4"}],
//!   "tickBudget": "2s",
//!   "metricsAddr": "0.0.0.0:9500",
//!   "workspaceCgroupParent": "workspaces"
//! }
//! ```
//!
//! Bandwidths are CPU quantities (`"2"` = two CPUs, `"500m"` = half a CPU).
//! Durations are literals such as `"15s"`, `"250ms"` or `"1m30s"`. A bucket's
//! `budget` is the CPU time a workspace may spend at that bucket's `limit`.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpulimit::{Bandwidth, Bucket, CpuTime, ResourceLimiter};
use crate::quantity::Quantity;

/// Annotation that overrides a workspace's base limit
pub const MIN_LIMIT_ANNOTATION: &str = "workspace.cpu/min-limit";

/// Annotation that overrides a workspace's burst limit
pub const BURST_LIMIT_ANNOTATION: &str = "workspace.cpu/burst-limit";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cpugovernor/config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    #[serde(with = "duration_literal")]
    pub budget: Duration,
    pub limit: Quantity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorConfig {
    #[serde(default)]
    pub enabled: bool,

    /// CPU capacity this node hands out
    pub total_bandwidth: Quantity,
    /// Base limit per workspace
    pub limit: Quantity,
    /// Limit granted to throttled workspaces while capacity is spare
    pub burst_limit: Quantity,

    #[serde(default = "default_control_period", with = "duration_literal")]
    pub control_period: Duration,

    #[serde(default = "default_cgroup_base_path")]
    pub cgroup_base_path: PathBuf,

    /// Replaces the fixed base limit with a usage-dependent ladder
    #[serde(default)]
    pub buckets: Vec<BucketConfig>,

    /// Upper bound on kernel file I/O per tick
    #[serde(default, with = "optional_duration_literal")]
    pub tick_budget: Option<Duration>,

    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,

    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Cgroup whose children are the workspaces, relative to the base path
    #[serde(default = "default_workspace_cgroup_parent")]
    pub workspace_cgroup_parent: String,
}

fn default_control_period() -> Duration {
    Duration::from_secs(15)
}

fn default_cgroup_base_path() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_workspace_cgroup_parent() -> String {
    "workspaces".to_string()
}

impl GovernorConfig {
    /// Reads and validates the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_period.is_zero() {
            return Err(ConfigError::Invalid("controlPeriod must be positive".into()));
        }
        if self.total_bandwidth.milli_value() <= 0 {
            return Err(ConfigError::Invalid("totalBandwidth must be positive".into()));
        }
        if self.limit.is_negative() || self.burst_limit.is_negative() {
            return Err(ConfigError::Invalid("limits must not be negative".into()));
        }
        if self.burst_limit.milli_value() < self.limit.milli_value() {
            return Err(ConfigError::Invalid(format!(
                "burstLimit {} is lower than limit {}",
                self.burst_limit, self.limit
            )));
        }
        if self.tick_budget.is_some_and(|b| b.is_zero()) {
            return Err(ConfigError::Invalid("tickBudget must be positive".into()));
        }
        if let Some(bucket) = self.buckets.iter().find(|b| b.limit.is_negative()) {
            return Err(ConfigError::Invalid(format!(
                "bucket limit {} must not be negative",
                bucket.limit
            )));
        }
        Ok(())
    }

    pub fn total_bandwidth(&self) -> Bandwidth {
        Bandwidth::from_quantity(&self.total_bandwidth)
    }

    /// Builds the base and the burst limiter.
    ///
    /// Both consult the workspace's annotation first and fall back to the
    /// configured default.
    pub fn limiters(&self) -> (ResourceLimiter, ResourceLimiter) {
        let default = if self.buckets.is_empty() {
            ResourceLimiter::fixed(Bandwidth::from_quantity(&self.limit))
        } else {
            let buckets = self
                .buckets
                .iter()
                .map(|b| {
                    Bucket::new(
                        CpuTime::from_duration(b.budget),
                        Bandwidth::from_quantity(&b.limit),
                    )
                })
                .collect();
            ResourceLimiter::per_workspace(ResourceLimiter::clamping_bucket(buckets))
        };

        let base = ResourceLimiter::composite(vec![
            ResourceLimiter::annotation(MIN_LIMIT_ANNOTATION),
            default,
        ]);
        let burst = ResourceLimiter::composite(vec![
            ResourceLimiter::annotation(BURST_LIMIT_ANNOTATION),
            ResourceLimiter::fixed(Bandwidth::from_quantity(&self.burst_limit)),
        ]);
        (base, burst)
    }
}

/// Parses a duration literal: one or more `<number><unit>` pairs with units
/// `ns`, `us`, `ms`, `s`, `m`, `h`. A bare `"0"` is zero.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(invalid()),
        };

        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        let int: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let frac: u128 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| invalid())?
        };
        let frac_scale = 10u128
            .checked_pow(frac_part.len() as u32)
            .ok_or_else(invalid)?;

        let nanos = int
            .checked_mul(unit_nanos)
            .and_then(|n| n.checked_add(frac.checked_mul(unit_nanos)? / frac_scale))
            .ok_or_else(invalid)?;
        total = total.checked_add(nanos).ok_or_else(invalid)?;
        rest = tail;
    }

    u64::try_from(total)
        .map(Duration::from_nanos)
        .map_err(|_| invalid())
}

/// Formats a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    match d.as_nanos() {
        0 => "0s".to_string(),
        n if n % 1_000_000_000 == 0 => format!("{}s", n / 1_000_000_000),
        n if n % 1_000_000 == 0 => format!("{}ms", n / 1_000_000),
        n if n % 1_000 == 0 => format!("{}us", n / 1_000),
        n => format!("{n}ns"),
    }
}

mod duration_literal {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let literal = String::deserialize(deserializer)?;
        super::parse_duration(&literal).map_err(serde::de::Error::custom)
    }
}

mod optional_duration_literal {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.serialize_some(&super::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|literal| super::parse_duration(&literal).map_err(serde::de::Error::custom))
            .transpose()
    }
}
