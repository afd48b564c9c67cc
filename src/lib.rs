//! cpugovernor - per-node CPU bandwidth governor for workspace containers
//!
//! Every control period the governor reads CPU usage and throttling of all
//! workspace cgroups on the node, then hands out CFS bandwidth limits in
//! priority order. Workspaces throttled in the last period get a burst limit
//! while the node has capacity to spare.
//!
//! # Modules
//!
//! - `cpulimit` - bandwidth arithmetic, workspace history, limiters, the distributor
//! - `cgroups` - CFS controllers for cgroup v1 and v2
//! - `dispatch` - workspace lifecycle glue and cgroup discovery
//! - `config` - JSON configuration
//! - `metrics` - Prometheus metrics
//! - `exporter` - `/metrics` HTTP endpoint
//! - `tracing` - log and span export setup
//!
//! # Quick Start
//!
//! ```ignore
//! use cpugovernor::{Distributor, DispatchListener, GovernorConfig};
//!
//! let config = GovernorConfig::load(path)?;
//! let (limiter, burst_limiter) = config.limiters();
//! let listener = Arc::new(DispatchListener::new(base, hierarchy, runtime));
//!
//! let distributor = Distributor::new(
//!     listener.clone(),
//!     listener,
//!     limiter,
//!     burst_limiter,
//!     config.total_bandwidth(),
//! );
//! distributor.run(config.control_period, shutdown).await;
//! ```

pub mod cgroups;
pub mod config;
pub mod cpulimit;
pub mod dispatch;
pub mod exporter;
pub mod metrics;
pub mod quantity;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use config::GovernorConfig;
pub use cpulimit::{Bandwidth, CpuTime, Distributor, ResourceLimiter};
pub use dispatch::DispatchListener;
