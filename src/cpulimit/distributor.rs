//! Distributor - the node-wide CPU bandwidth control loop
//!
//! Once per control period the distributor pulls a full snapshot of all
//! workspaces, folds it into their histories and hands out limits in priority
//! order, granting bursts out of whatever capacity is left over.
//!
//! # One tick
//!
//! ```text
//! ┌──────────┐  snapshot   ┌───────────────┐   order by (qos, usage)
//! │  Source  │ ──────────► │   histories   │ ─────────────────────────┐
//! └──────────┘             │ (create / gc) │                          │
//!                          └───────────────┘                          ▼
//!                                        ┌───────────────────────────────────┐
//!                                        │ for each workspace:               │
//!                                        │   limit = Limiter                 │
//!                                        │   if spare capacity && throttled: │
//!                                        │     limit = BurstLimiter          │
//!                                        │     used += limit                 │
//!                                        └───────────────┬───────────────────┘
//!                                                        │ (id, limit, burst)
//!                                                        ▼
//!                                                   ┌──────────┐
//!                                                   │   Sink   │
//!                                                   └──────────┘
//! ```
//!
//! A granted burst is added to the used bandwidth right away, assuming the
//! workspace will consume all of it. Lower-priority workspaces evaluated later
//! in the same tick therefore see less spare capacity than may really exist.
//! This favours stability over perfect utilisation.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use super::bandwidth::{Bandwidth, CpuTime};
use super::history::{Workspace, WorkspaceHistory};
use super::limiter::ResourceLimiter;
use crate::metrics::GovernorMetrics;

/// Failure to enumerate workspaces at all
#[derive(Debug, Error)]
#[error("cannot list workspaces: {0}")]
pub struct SourceError(pub String);

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("tick task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("tick panicked: {0}")]
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Produces the complete current set of workspaces
pub trait WorkspaceSource: Send {
    fn snapshot(&mut self) -> Result<Vec<Workspace>, SourceError>;
}

/// Receives limit decisions
pub trait LimitSink: Send {
    fn apply(&mut self, id: &str, limit: Bandwidth, burst: bool);
}

impl<F> WorkspaceSource for F
where
    F: FnMut() -> Result<Vec<Workspace>, SourceError> + Send,
{
    fn snapshot(&mut self) -> Result<Vec<Workspace>, SourceError> {
        self()
    }
}

impl<F> LimitSink for F
where
    F: FnMut(&str, Bandwidth, bool) + Send,
{
    fn apply(&mut self, id: &str, limit: Bandwidth, burst: bool) {
        self(id, limit, burst)
    }
}

/// What a tick decided, for gauges and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributorDebug {
    pub bandwidth_avail: Bandwidth,
    pub bandwidth_used: Bandwidth,
    pub bandwidth_burst: Bandwidth,
}

pub struct Distributor<S, K> {
    source: S,
    sink: K,

    history: HashMap<String, Box<WorkspaceHistory>>,
    limiter: ResourceLimiter,
    burst_limiter: ResourceLimiter,

    /// Bandwidth available on this node
    pub total_bandwidth: Bandwidth,
    /// Sum of all workspace usage at the previous tick
    last_tick_usage: CpuTime,

    metrics: Option<GovernorMetrics>,
}

impl<S, K> Distributor<S, K>
where
    S: WorkspaceSource,
    K: LimitSink,
{
    pub fn new(
        source: S,
        sink: K,
        limiter: ResourceLimiter,
        burst_limiter: ResourceLimiter,
        total_bandwidth: Bandwidth,
    ) -> Self {
        Self {
            source,
            sink,
            history: HashMap::new(),
            limiter,
            burst_limiter,
            total_bandwidth,
            last_tick_usage: CpuTime::ZERO,
            metrics: None,
        }
    }

    /// Publishes each tick's debug record as gauges.
    pub fn with_metrics(mut self, metrics: GovernorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn history(&self, id: &str) -> Option<&WorkspaceHistory> {
        self.history.get(id).map(Box::as_ref)
    }

    pub fn tracked(&self) -> usize {
        self.history.len()
    }

    pub fn last_tick_usage(&self) -> CpuTime {
        self.last_tick_usage
    }

    /// Forgets all workspace history; the next tick re-baselines.
    pub fn reset(&mut self) {
        for id in self.history.keys() {
            self.limiter.forget(id);
            self.burst_limiter.forget(id);
        }
        self.history.clear();
        self.last_tick_usage = CpuTime::ZERO;
        info!("cpu limit distributor reset");
    }

    /// Runs one control period. `dt` is the time since the previous tick.
    pub fn tick(&mut self, dt: Duration) -> Result<DistributorDebug, DistributorError> {
        self.tick_until(dt, None)
    }

    fn tick_until(
        &mut self,
        dt: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<DistributorDebug, DistributorError> {
        let snapshot = self.source.snapshot()?;

        let mut seen = HashSet::with_capacity(snapshot.len());
        for ws in snapshot {
            let id = ws.id.clone();
            self.history
                .entry(id.clone())
                .or_insert_with(|| Box::new(WorkspaceHistory::new(id.clone())))
                .update(ws);
            seen.insert(id);
        }
        let gone: Vec<String> = self
            .history
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            self.history.remove(&id);
            self.limiter.forget(&id);
            self.burst_limiter.forget(&id);
            debug!(workspace_id = %id, "dropped history of vanished workspace");
        }

        let total_usage: CpuTime = self.history.values().map(|h| h.usage()).sum();
        let mut order: Vec<(i32, CpuTime, String)> = self
            .history
            .values()
            .map(|h| (h.qos(), h.usage(), h.id.clone()))
            .collect();
        order.sort();

        let mut record = DistributorDebug {
            bandwidth_avail: self.total_bandwidth,
            ..Default::default()
        };

        if self.last_tick_usage == CpuTime::ZERO {
            // first tick: no rate to compare against yet
            self.last_tick_usage = total_usage;
            return Ok(record);
        }

        let mut total_bandwidth = match Bandwidth::from_usage(self.last_tick_usage, total_usage, dt)
        {
            Ok(bw) => bw,
            Err(e) => {
                warn!(error = %e, "aggregate usage went backwards, assuming no consumption");
                Bandwidth(0)
            }
        };
        self.last_tick_usage = total_usage;

        let mut burst_bandwidth = Bandwidth(0);
        for (_, _, id) in &order {
            let Some(history) = self.history.get_mut(id) else {
                continue;
            };

            let mut limit = match self.limiter.limit(history) {
                Ok(limit) => limit,
                Err(e) => {
                    warn!(workspace_id = %id, error = %e, "cannot compute CPU limit");
                    continue;
                }
            };

            let mut burst = false;
            if total_bandwidth < self.total_bandwidth && history.throttled() {
                match self.burst_limiter.limit(history) {
                    Ok(burst_limit) => {
                        limit = burst_limit;
                        burst = true;
                        total_bandwidth += burst_limit;
                        burst_bandwidth += burst_limit;
                    }
                    Err(e) => {
                        warn!(
                            workspace_id = %id,
                            error = %e,
                            "cannot compute burst limit, keeping base limit"
                        );
                    }
                }
            }
            history.limit = limit;

            if cancel.is_some_and(CancellationToken::is_cancelled) {
                debug!("distributor cancelled mid-tick");
                break;
            }
            self.sink.apply(id, limit, burst);
        }

        record.bandwidth_used = total_bandwidth;
        record.bandwidth_burst = burst_bandwidth;
        Ok(record)
    }
}

impl<S, K> Distributor<S, K>
where
    S: WorkspaceSource + 'static,
    K: LimitSink + 'static,
{
    /// Drives [`Distributor::tick`] every `period` until `cancel` fires.
    ///
    /// Ticks run on the blocking pool since sources and sinks do kernel file
    /// I/O. A failed or panicking tick is logged and retried on the next
    /// period.
    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick of a tokio interval completes immediately
        interval.tick().await;

        let mut distributor = self;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("cpu limit distributor shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }

            let tick_cancel = cancel.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let tick_id = Uuid::now_v7();
                let span = info_span!("cpulimit_tick", tick_id = %tick_id);
                let res = span.in_scope(|| {
                    panic::catch_unwind(AssertUnwindSafe(|| {
                        distributor.tick_until(period, Some(&tick_cancel))
                    }))
                    .unwrap_or_else(|payload| {
                        Err(DistributorError::Panicked(panic_message(payload.as_ref())))
                    })
                });
                (distributor, res)
            })
            .await;

            let (returned, res) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %DistributorError::from(e), "cpu limit distributor stopped");
                    return;
                }
            };
            distributor = returned;

            match res {
                Ok(dbg) => {
                    if let Some(metrics) = &distributor.metrics {
                        metrics.observe_tick(&dbg, distributor.history.len());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cpu limit distributor tick failed");
                    if let Some(metrics) = &distributor.metrics {
                        metrics.tick_errors.inc();
                    }
                }
            }
        }
    }
}
