//! Prometheus metrics for the CPU governor
//!
//! Unlike a process-global registry, [`GovernorMetrics`] registers into the
//! [`Registry`] it is given and is then handed to the dispatch listener and the
//! distributor. Cloning is cheap: every metric is reference counted.
//!
//! ```text
//! cpulimit_workspaces_added_total{qos}       workspaces registered
//! cpulimit_workspaces_removed_total{qos}     workspaces whose lifetime ended
//! cpulimit_workspaces_throttled_total{qos}   throttle counter increases seen
//! cpulimit_workspaces_burst_total{qos}       burst limits applied
//! cpulimit_workspaces_cputime_seconds{qos}   cumulative CPU time per class
//! cpulimit_workspaces                        tracked workspaces
//! cpulimit_bandwidth_{available,used,burst}  last tick's DistributorDebug
//! cpulimit_tick_errors_total                 ticks aborted by the source
//! ```

use prometheus::{GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::cpulimit::DistributorDebug;

#[derive(Clone)]
pub struct GovernorMetrics {
    pub workspaces_added: IntCounterVec,
    pub workspaces_removed: IntCounterVec,
    pub workspaces_throttled: IntCounterVec,
    pub workspaces_burst: IntCounterVec,
    pub workspaces_cputime: GaugeVec,
    pub workspaces: IntGauge,

    pub bandwidth_available: IntGauge,
    pub bandwidth_used: IntGauge,
    pub bandwidth_burst: IntGauge,
    pub tick_errors: IntCounter,
}

impl GovernorMetrics {
    /// Creates all metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let per_qos = |name: &str, help: &str| IntCounterVec::new(Opts::new(name, help), &["qos"]);

        let metrics = Self {
            workspaces_added: per_qos(
                "cpulimit_workspaces_added_total",
                "Workspaces registered with the CPU governor",
            )?,
            workspaces_removed: per_qos(
                "cpulimit_workspaces_removed_total",
                "Workspaces removed from the CPU governor",
            )?,
            workspaces_throttled: per_qos(
                "cpulimit_workspaces_throttled_total",
                "Control periods in which a workspace was throttled",
            )?,
            workspaces_burst: per_qos(
                "cpulimit_workspaces_burst_total",
                "Burst limits applied to workspaces",
            )?,
            workspaces_cputime: GaugeVec::new(
                Opts::new(
                    "cpulimit_workspaces_cputime_seconds",
                    "Cumulative CPU time of tracked workspaces per QoS class",
                ),
                &["qos"],
            )?,
            workspaces: IntGauge::new(
                "cpulimit_workspaces",
                "Workspaces tracked by the CPU governor",
            )?,
            bandwidth_available: IntGauge::new(
                "cpulimit_bandwidth_available",
                "CPU bandwidth available on this node (milli-CPU)",
            )?,
            bandwidth_used: IntGauge::new(
                "cpulimit_bandwidth_used",
                "CPU bandwidth consumed during the last control period (milli-CPU)",
            )?,
            bandwidth_burst: IntGauge::new(
                "cpulimit_bandwidth_burst",
                "CPU bandwidth granted as burst during the last control period (milli-CPU)",
            )?,
            tick_errors: IntCounter::new(
                "cpulimit_tick_errors_total",
                "Control periods aborted because workspaces could not be listed",
            )?,
        };

        registry.register(Box::new(metrics.workspaces_added.clone()))?;
        registry.register(Box::new(metrics.workspaces_removed.clone()))?;
        registry.register(Box::new(metrics.workspaces_throttled.clone()))?;
        registry.register(Box::new(metrics.workspaces_burst.clone()))?;
        registry.register(Box::new(metrics.workspaces_cputime.clone()))?;
        registry.register(Box::new(metrics.workspaces.clone()))?;
        registry.register(Box::new(metrics.bandwidth_available.clone()))?;
        registry.register(Box::new(metrics.bandwidth_used.clone()))?;
        registry.register(Box::new(metrics.bandwidth_burst.clone()))?;
        registry.register(Box::new(metrics.tick_errors.clone()))?;

        Ok(metrics)
    }

    /// Publishes a tick's debug record.
    pub fn observe_tick(&self, record: &DistributorDebug, tracked: usize) {
        self.bandwidth_available.set(record.bandwidth_avail.0 as i64);
        self.bandwidth_used.set(record.bandwidth_used.0 as i64);
        self.bandwidth_burst.set(record.bandwidth_burst.0 as i64);
        self.workspaces.set(tracked as i64);
    }
}

/// Label value for a QoS class
pub fn qos_label(qos: i32) -> String {
    qos.to_string()
}
