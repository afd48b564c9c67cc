//! Node-wide CPU bandwidth distribution
//!
//! Every workspace on a node gets a CFS bandwidth limit from a priority-ordered
//! control loop. Workspaces that hit their limit in the last period may receive
//! a higher burst limit while the node has spare capacity.
//!
//! ```text
//! Bandwidth   milli-CPU per second: 6000 = six full CPUs
//! CpuTime     cumulative CPU time in nanoseconds
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use cpugovernor::cpulimit::{Bandwidth, Distributor, ResourceLimiter};
//!
//! let distributor = Distributor::new(
//!     listener.clone(),                                 // WorkspaceSource
//!     listener,                                         // LimitSink
//!     ResourceLimiter::fixed(Bandwidth(2000)),
//!     ResourceLimiter::fixed(Bandwidth(6000)),
//!     Bandwidth(12000),
//! );
//! tokio::spawn(distributor.run(Duration::from_secs(15), cancel));
//! ```

pub mod bandwidth;
pub mod distributor;
pub mod history;
pub mod limiter;

pub use bandwidth::{Bandwidth, BandwidthError, CpuTime};
pub use distributor::{
    Distributor, DistributorDebug, DistributorError, LimitSink, SourceError, WorkspaceSource,
};
pub use history::{Workspace, WorkspaceHistory};
pub use limiter::{Bucket, ClampingBucketLimiter, LimitError, PerWorkspaceLimiter, ResourceLimiter};
