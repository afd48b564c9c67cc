//! CFS bandwidth control on Linux cgroups
//!
//! Supports both the legacy (v1) and the unified (v2) hierarchy. Which one is
//! in use is detected once from the filesystem mounted at the base path.
//!
//! # Example Usage
//!
//! ```ignore
//! use cpugovernor::cgroups::{CfsController, CgroupHierarchy};
//!
//! let base = Path::new("/sys/fs/cgroup");
//! let hierarchy = CgroupHierarchy::detect(base)?;
//! let cfs = CfsController::new(base, hierarchy, "workspaces/ws-1")?;
//!
//! let usage = cfs.usage()?;
//! let changed = cfs.set_limit(Bandwidth(2000))?;   // 2 CPUs
//! ```

pub mod cfs;
pub mod legacy;
pub mod unified;

pub use cfs::{CfsController, CfsError, CgroupHierarchy};
pub use legacy::LegacyCfsController;
pub use unified::UnifiedCfsController;
