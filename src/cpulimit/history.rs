//! Per-workspace rolling state
//!
//! The distributor sees workspaces as a stream of snapshots, one per control
//! period. [`WorkspaceHistory`] folds that stream into what the limiters need:
//!
//! ```text
//! tick:          1          2          3          4
//! snapshot:   usage=10   usage=25   usage=40   usage=70
//!             thr=0      thr=0      thr=4      thr=6
//!                │
//!                └─► usage_t0 = 10
//!
//! usage():       0          15         30         60
//! throttle_lag:  0          0          0          4
//! throttled():   false      false      false      true
//! ```
//!
//! A lag of 0 means "no lag yet": the counter has to be non-zero one period
//! before a change in it counts as throttling during the last period.

use std::collections::HashMap;

use super::bandwidth::{Bandwidth, CpuTime};

/// One workspace as seen by a single tick. Never mutated after creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workspace {
    pub id: String,
    /// Cumulative number of CFS periods in which the workspace was throttled
    pub nr_throttled: u64,
    /// CPU time consumed since container start
    pub usage: CpuTime,
    /// Priority class; lower values are served first
    pub qos: i32,
    pub annotations: HashMap<String, String>,
}

/// Rolling state for one tracked workspace
#[derive(Debug, Clone, Default)]
pub struct WorkspaceHistory {
    pub id: String,
    /// Most recent snapshot
    pub last_update: Option<Workspace>,
    /// Usage at first sighting
    pub usage_t0: CpuTime,
    /// `nr_throttled` as of the snapshot before `last_update`
    pub throttle_lag: u64,
    /// Last limit assigned by the distributor
    pub limit: Bandwidth,
}

impl WorkspaceHistory {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Folds a new snapshot into the history.
    pub fn update(&mut self, ws: Workspace) {
        match &self.last_update {
            None => self.usage_t0 = ws.usage,
            Some(prev) => self.throttle_lag = prev.nr_throttled,
        }
        self.last_update = Some(ws);
    }

    /// CPU time consumed since the workspace was first seen.
    pub fn usage(&self) -> CpuTime {
        match &self.last_update {
            Some(ws) => ws.usage - self.usage_t0,
            None => CpuTime::ZERO,
        }
    }

    /// Whether the workspace was throttled during the last control period.
    pub fn throttled(&self) -> bool {
        match &self.last_update {
            Some(ws) if self.throttle_lag != 0 => self.throttle_lag != ws.nr_throttled,
            _ => false,
        }
    }

    pub fn qos(&self) -> i32 {
        self.last_update.as_ref().map(|ws| ws.qos).unwrap_or_default()
    }

    pub fn annotations(&self) -> Option<&HashMap<String, String>> {
        self.last_update.as_ref().map(|ws| &ws.annotations)
    }
}
