//! cgroup v2 CPU controller files
//!
//! ```text
//! /sys/fs/cgroup/                     ← base, cgroup2 mount
//! ├── cgroup.subtree_control          ← must list "cpu" for children
//! └── workspaces/
//!     ├── cgroup.subtree_control
//!     └── <workspace>/
//!         ├── cpu.max                 ← "200000 100000" = 2 CPUs, "max 100000" = unlimited
//!         └── cpu.stat                ← usage_usec / nr_throttled / throttled_usec
//! ```
//!
//! In cgroups v2 a child can only use a controller its parent enabled in
//! `cgroup.subtree_control`, so construction walks from the base down to the
//! workspace's parent and adds `+cpu` wherever it is missing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::cfs::{is_gone_io, parse_value, read_file, read_flat_keyed, CfsError};
use crate::cpulimit::{Bandwidth, CpuTime};

#[derive(Debug, Clone)]
pub struct UnifiedCfsController {
    path: PathBuf,
}

impl UnifiedCfsController {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn usage(&self) -> Result<CpuTime, CfsError> {
        let micros = read_flat_keyed(&self.path.join("cpu.stat"), "usage_usec")?;
        Ok(CpuTime::from_micros(micros as i64))
    }

    pub fn nr_throttled(&self) -> Result<u64, CfsError> {
        read_flat_keyed(&self.path.join("cpu.stat"), "nr_throttled")
    }

    /// Current `(quota, period)`; quota is `None` when unlimited.
    fn cpu_max(&self) -> Result<(Option<Duration>, Duration), CfsError> {
        let file = self.path.join("cpu.max");
        let raw = read_file(&file)?;
        let mut fields = raw.split_whitespace();
        let (Some(quota), Some(period)) = (fields.next(), fields.next()) else {
            return Err(CfsError::Parse {
                path: file,
                value: raw.trim().to_string(),
            });
        };

        let period = Duration::from_micros(parse_value(&file, period)?);
        let quota = match quota {
            "max" => None,
            value => Some(Duration::from_micros(parse_value(&file, value)?)),
        };
        Ok((quota, period))
    }

    pub fn set_limit(&self, limit: Bandwidth) -> Result<bool, CfsError> {
        let (quota, period) = self.cpu_max()?;
        let target = limit.quota(period);
        if quota == Some(target) {
            return Ok(false);
        }

        let file = self.path.join("cpu.max");
        let value = format!("{} {}", target.as_micros(), period.as_micros());
        fs::write(&file, &value).map_err(|source| self.write_error(file, value, source))?;
        Ok(true)
    }

    fn write_error(&self, file: PathBuf, value: String, source: io::Error) -> CfsError {
        if is_gone_io(&source) {
            return CfsError::CgroupGone { path: self.path.clone() };
        }
        // usually an ancestor with a stricter limit
        CfsError::WriteLimit {
            path: file,
            quota: value,
            parent_quota: self.parent_quota(),
            source,
        }
    }

    fn parent_quota(&self) -> String {
        let Some(parent) = self.path.parent() else {
            return "unknown".to_string();
        };
        match fs::read_to_string(parent.join("cpu.max")) {
            Ok(raw) => raw.trim().to_string(),
            Err(e) => format!("unknown ({e})"),
        }
    }

    /// Enables the cpu controller on every ancestor between `base` and this
    /// cgroup. Directories without a `cgroup.subtree_control` file are skipped.
    pub fn enable_cpu_controller(&self, base: &Path) -> Result<(), CfsError> {
        let Ok(relative) = self.path.strip_prefix(base) else {
            return Ok(());
        };

        let mut dir = base.to_path_buf();
        let mut ancestors = vec![dir.clone()];
        let components: Vec<_> = relative.components().collect();
        for component in components.iter().take(components.len().saturating_sub(1)) {
            dir.push(component);
            ancestors.push(dir.clone());
        }

        for ancestor in ancestors {
            let control = ancestor.join("cgroup.subtree_control");
            let enabled = match fs::read_to_string(&control) {
                Ok(enabled) => enabled,
                Err(e) if is_gone_io(&e) => {
                    debug!(path = %control.display(), "no subtree_control, skipping");
                    continue;
                }
                Err(source) => return Err(CfsError::Io { path: control, source }),
            };
            if enabled.split_whitespace().any(|c| c == "cpu") {
                continue;
            }
            fs::write(&control, "+cpu").map_err(|source| CfsError::Io {
                path: control.clone(),
                source,
            })?;
            debug!(path = %control.display(), "enabled cpu controller");
        }
        Ok(())
    }
}
