//! CFS bandwidth control for a single workspace cgroup
//!
//! The kernel exposes the same three knobs under two different file layouts,
//! depending on which cgroup hierarchy is mounted at the base path:
//!
//! ```text
//!                      legacy (v1)                     unified (v2)
//! usage          cpu/<cg>/cpuacct.usage (ns)     <cg>/cpu.stat usage_usec
//! limit          cpu/<cg>/cpu.cfs_quota_us       <cg>/cpu.max "quota period"
//!                cpu/<cg>/cpu.cfs_period_us
//! nr_throttled   cpu/<cg>/cpu.stat               <cg>/cpu.stat
//! ```
//!
//! [`CfsController`] hides the difference. A workspace whose container exited
//! between two reads surfaces as [`CfsError::CgroupGone`] so callers can skip it
//! quietly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC};
use thiserror::Error;

use super::legacy::LegacyCfsController;
use super::unified::UnifiedCfsController;
use crate::cpulimit::{Bandwidth, CpuTime};

#[derive(Debug, Error)]
pub enum CfsError {
    #[error("cgroup {} no longer exists", path.display())]
    CgroupGone { path: PathBuf },

    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {} from {value:?}", path.display())]
    Parse { path: PathBuf, value: String },

    #[error(
        "cannot write quota {quota} to {} (parent quota: {parent_quota}): {source}",
        path.display()
    )]
    WriteLimit {
        path: PathBuf,
        quota: String,
        parent_quota: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot detect cgroup hierarchy at {}: {source}", path.display())]
    Hierarchy {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

impl CfsError {
    /// Whether the cgroup disappeared, i.e. the workspace container exited.
    pub fn is_gone(&self) -> bool {
        matches!(self, CfsError::CgroupGone { .. })
    }

    pub(crate) fn from_io(path: &Path, source: io::Error) -> Self {
        if is_gone_io(&source) {
            CfsError::CgroupGone {
                path: path.to_path_buf(),
            }
        } else {
            CfsError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Reads of a removed cgroup fail with ENOENT, or ENODEV once the kernel has
/// started tearing it down.
pub(crate) fn is_gone_io(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::NotFound {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == nix::libc::ENODEV || code == nix::libc::ESRCH
    )
}

pub(crate) fn read_file(path: &Path) -> Result<String, CfsError> {
    fs::read_to_string(path).map_err(|e| CfsError::from_io(path, e))
}

pub(crate) fn parse_value<T: std::str::FromStr>(path: &Path, raw: &str) -> Result<T, CfsError> {
    raw.trim().parse().map_err(|_| CfsError::Parse {
        path: path.to_path_buf(),
        value: raw.trim().to_string(),
    })
}

/// Reads `key` from a flat-keyed file such as `cpu.stat`.
pub(crate) fn read_flat_keyed(path: &Path, key: &str) -> Result<u64, CfsError> {
    let content = read_file(path)?;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some(key) {
            let value = parts.next().unwrap_or_default();
            return parse_value(path, value);
        }
    }
    Err(CfsError::Parse {
        path: path.to_path_buf(),
        value: format!("no {key} entry"),
    })
}

/// Which cgroup hierarchy is mounted at the base path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupHierarchy {
    Legacy,
    Unified,
}

impl CgroupHierarchy {
    /// Inspects the filesystem mounted at `base`.
    pub fn detect(base: &Path) -> Result<Self, CfsError> {
        let stat = statfs(base).map_err(|source| CfsError::Hierarchy {
            path: base.to_path_buf(),
            source,
        })?;
        if stat.filesystem_type() == CGROUP2_SUPER_MAGIC {
            Ok(CgroupHierarchy::Unified)
        } else {
            Ok(CgroupHierarchy::Legacy)
        }
    }

    /// Directory of the workspace cgroup `cgroup` below `base`.
    pub fn cgroup_dir(self, base: &Path, cgroup: &str) -> PathBuf {
        let cgroup = cgroup.trim_start_matches('/');
        match self {
            CgroupHierarchy::Legacy => base.join("cpu").join(cgroup),
            CgroupHierarchy::Unified => base.join(cgroup),
        }
    }
}

/// Reads usage and throttling of one cgroup and sets its CPU bandwidth limit
#[derive(Debug, Clone)]
pub enum CfsController {
    Legacy(LegacyCfsController),
    Unified(UnifiedCfsController),
}

impl CfsController {
    /// Builds the controller for the workspace cgroup `cgroup`, relative to the
    /// hierarchy root at `base`.
    pub fn new(base: &Path, hierarchy: CgroupHierarchy, cgroup: &str) -> Result<Self, CfsError> {
        let dir = hierarchy.cgroup_dir(base, cgroup);
        match hierarchy {
            CgroupHierarchy::Legacy => Ok(CfsController::Legacy(LegacyCfsController::new(dir))),
            CgroupHierarchy::Unified => {
                let controller = UnifiedCfsController::new(dir);
                controller.enable_cpu_controller(base)?;
                Ok(CfsController::Unified(controller))
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            CfsController::Legacy(c) => c.path(),
            CfsController::Unified(c) => c.path(),
        }
    }

    /// CPU time consumed by the cgroup since it was created.
    pub fn usage(&self) -> Result<CpuTime, CfsError> {
        match self {
            CfsController::Legacy(c) => c.usage(),
            CfsController::Unified(c) => c.usage(),
        }
    }

    /// Number of CFS periods in which the cgroup was throttled.
    pub fn nr_throttled(&self) -> Result<u64, CfsError> {
        match self {
            CfsController::Legacy(c) => c.nr_throttled(),
            CfsController::Unified(c) => c.nr_throttled(),
        }
    }

    /// Applies `limit`. Returns false if the kernel already had that quota.
    pub fn set_limit(&self, limit: Bandwidth) -> Result<bool, CfsError> {
        match self {
            CfsController::Legacy(c) => c.set_limit(limit),
            CfsController::Unified(c) => c.set_limit(limit),
        }
    }
}
