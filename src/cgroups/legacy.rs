//! cgroup v1 CPU controller files
//!
//! ```text
//! /sys/fs/cgroup/cpu/<cgroup>/
//! ├── cpuacct.usage       ← cumulative CPU time in nanoseconds
//! ├── cpu.cfs_period_us   ← CFS period in microseconds, usually 100000
//! ├── cpu.cfs_quota_us    ← runtime per period in microseconds, -1 = unlimited
//! └── cpu.stat            ← nr_periods / nr_throttled / throttled_time
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::cfs::{parse_value, read_file, read_flat_keyed, CfsError};
use crate::cpulimit::{Bandwidth, CpuTime};

#[derive(Debug, Clone)]
pub struct LegacyCfsController {
    path: PathBuf,
}

impl LegacyCfsController {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn usage(&self) -> Result<CpuTime, CfsError> {
        let file = self.path.join("cpuacct.usage");
        let nanos: i64 = parse_value(&file, &read_file(&file)?)?;
        Ok(CpuTime::from_nanos(nanos))
    }

    pub fn nr_throttled(&self) -> Result<u64, CfsError> {
        read_flat_keyed(&self.path.join("cpu.stat"), "nr_throttled")
    }

    fn period(&self) -> Result<Duration, CfsError> {
        let file = self.path.join("cpu.cfs_period_us");
        let micros: u64 = parse_value(&file, &read_file(&file)?)?;
        Ok(Duration::from_micros(micros))
    }

    /// Current quota, `None` when unlimited
    fn quota(&self) -> Result<Option<Duration>, CfsError> {
        let file = self.path.join("cpu.cfs_quota_us");
        let raw = read_file(&file)?;
        match raw.trim() {
            "-1" | "max" => Ok(None),
            value => {
                let micros: u64 = parse_value(&file, value)?;
                Ok(Some(Duration::from_micros(micros)))
            }
        }
    }

    pub fn set_limit(&self, limit: Bandwidth) -> Result<bool, CfsError> {
        let period = self.period()?;
        let target = limit.quota(period);
        if self.quota()? == Some(target) {
            return Ok(false);
        }

        let file = self.path.join("cpu.cfs_quota_us");
        fs::write(&file, target.as_micros().to_string()).map_err(|e| CfsError::from_io(&file, e))?;
        Ok(true)
    }
}
