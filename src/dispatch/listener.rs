//! Dispatch listener - connects workspace lifecycle events to the distributor
//!
//! The listener keeps one CFS controller per running workspace and serves as
//! both ends of the control loop:
//!
//! ```text
//!  lifecycle events                        Distributor
//!  ───────────────                         ───────────
//!  workspace_added   ──┐                ┌── WorkspaceSource::snapshot
//!  workspace_updated ──┼──► workspaces ─┤     reads usage / nr_throttled
//!  lifetime ends     ──┘   (RwLock)     └── LimitSink::apply
//!                                              writes the CFS quota
//! ```
//!
//! A snapshot copies the controllers out under the read lock, reads the
//! kernel files without holding any lock, and writes the per-workspace
//! counters back under the write lock.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::cgroups::{CfsController, CfsError, CgroupHierarchy};
use crate::cpulimit::{Bandwidth, CpuTime, LimitSink, SourceError, Workspace, WorkspaceSource};
use crate::metrics::{qos_label, GovernorMetrics};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot resolve cgroup of container {container_id}: {reason}")]
    Runtime { container_id: String, reason: String },

    #[error(transparent)]
    Cfs(#[from] CfsError),

    #[error("cannot scan {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves a container to its cgroup, relative to the hierarchy root
pub trait ContainerRuntime: Send + Sync {
    fn container_cgroup_path(&self, container_id: &str) -> Result<String, DispatchError>;
}

/// Workspace metadata as delivered by the orchestration layer
#[derive(Debug, Clone, Default)]
pub struct WorkspaceInfo {
    pub instance_id: String,
    pub container_id: String,
    pub qos: i32,
    pub annotations: HashMap<String, String>,
}

struct TrackedWorkspace {
    cfs: CfsController,
    /// Logging context for everything concerning this workspace
    span: Span,
    qos: i32,
    annotations: HashMap<String, String>,
    /// Identifies this registration, so a stale removal task cannot remove a
    /// re-added workspace
    registration: Uuid,
    /// Counters of the last successful read; `None` until the first one
    last: Option<Counters>,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    usage: CpuTime,
    nr_throttled: u64,
}

#[derive(Default)]
struct ListenerState {
    workspaces: HashMap<String, TrackedWorkspace>,
    /// Workspaces not read during the last snapshot because the tick budget ran out
    starved: HashSet<String>,
}

/// What a snapshot needs of one workspace, copied out of the lock before any
/// kernel file is touched
struct ReadTarget {
    id: String,
    registration: Uuid,
    cfs: CfsController,
    span: Span,
    qos: i32,
    annotations: HashMap<String, String>,
    last: Option<Counters>,
}

/// One workspace's kernel counters, written back under the write lock
struct Reading {
    id: String,
    registration: Uuid,
    counters: Counters,
}

pub struct DispatchListener {
    base: PathBuf,
    hierarchy: CgroupHierarchy,
    runtime: Arc<dyn ContainerRuntime>,
    state: RwLock<ListenerState>,
    tick_budget: Option<Duration>,
    metrics: Option<GovernorMetrics>,
}

impl DispatchListener {
    pub fn new(
        base: impl Into<PathBuf>,
        hierarchy: CgroupHierarchy,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            base: base.into(),
            hierarchy,
            runtime,
            state: RwLock::new(ListenerState::default()),
            tick_budget: None,
            metrics: None,
        }
    }

    /// Stops reading kernel files for further workspaces once a snapshot has
    /// taken longer than `budget`.
    pub fn with_tick_budget(mut self, budget: Duration) -> Self {
        self.tick_budget = Some(budget);
        self
    }

    pub fn with_metrics(mut self, metrics: GovernorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workspaces
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workspaces
            .contains_key(id)
    }

    /// Registers a workspace. It is removed again once `lifetime` is cancelled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn workspace_added(
        self: &Arc<Self>,
        info: WorkspaceInfo,
        lifetime: CancellationToken,
    ) -> Result<(), DispatchError> {
        let cgroup = self.runtime.container_cgroup_path(&info.container_id)?;
        let cfs = CfsController::new(&self.base, self.hierarchy, &cgroup)?;

        let span = info_span!(
            "workspace",
            workspace_id = %info.instance_id,
            container_id = %info.container_id,
            qos = info.qos,
        );
        span.in_scope(|| info!(path = %cfs.path().display(), "workspace added to cpu limiting"));

        let registration = Uuid::now_v7();
        let id = info.instance_id.clone();
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let previous = state.workspaces.insert(
                id.clone(),
                TrackedWorkspace {
                    cfs,
                    span,
                    qos: info.qos,
                    annotations: info.annotations,
                    registration,
                    last: None,
                },
            );
            if previous.is_some() {
                warn!(workspace_id = %id, "workspace registered twice, replacing controller");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .workspaces_added
                .with_label_values(&[qos_label(info.qos).as_str()])
                .inc();
        }

        let listener: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            lifetime.cancelled().await;
            if let Some(listener) = listener.upgrade() {
                listener.remove_registration(&id, registration);
            }
        });
        Ok(())
    }

    /// Refreshes the annotations and QoS class of a registered workspace.
    pub fn workspace_updated(&self, info: WorkspaceInfo) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.workspaces.get_mut(&info.instance_id) {
            Some(ws) => {
                ws.annotations = info.annotations;
                ws.qos = info.qos;
            }
            None => {
                debug!(workspace_id = %info.instance_id, "update for unknown workspace ignored")
            }
        }
    }

    /// Drops a workspace. Returns false if it was not registered.
    pub fn workspace_removed(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.starved.remove(id);
            state.workspaces.remove(id)
        };
        self.finish_removal(removed)
    }

    fn remove_registration(&self, id: &str, registration: Uuid) {
        let removed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let current = state
                .workspaces
                .get(id)
                .is_some_and(|ws| ws.registration == registration);
            if current {
                state.starved.remove(id);
                state.workspaces.remove(id)
            } else {
                None
            }
        };
        self.finish_removal(removed);
    }

    fn finish_removal(&self, removed: Option<TrackedWorkspace>) -> bool {
        let Some(ws) = removed else {
            return false;
        };
        ws.span.in_scope(|| info!("workspace removed from cpu limiting"));
        if let Some(metrics) = &self.metrics {
            metrics
                .workspaces_removed
                .with_label_values(&[qos_label(ws.qos).as_str()])
                .inc();
        }
        true
    }

    /// Reads usage and throttling of every registered workspace.
    ///
    /// Workspaces whose cgroup vanished are left out. Once the tick budget is
    /// spent, the remaining workspaces are reported with their previous
    /// counters, or left out if they were never read, and are read first next
    /// time. At least one workspace is read per call.
    pub fn read_workspaces(&self) -> Result<Vec<Workspace>, SourceError> {
        let targets = self.read_targets();
        let start = Instant::now();
        let mut readings = Vec::new();
        let mut starved = HashSet::new();
        let mut snapshot = Vec::new();

        for target in targets {
            let over_budget = !readings.is_empty()
                && self.tick_budget.is_some_and(|budget| start.elapsed() > budget);
            if over_budget {
                starved.insert(target.id.clone());
                if let Some(last) = target.last {
                    snapshot.push(target.into_workspace(last));
                }
                continue;
            }

            let Some(counters) = read_counters(&target) else {
                continue;
            };
            readings.push(Reading {
                id: target.id.clone(),
                registration: target.registration,
                counters,
            });
            snapshot.push(target.into_workspace(counters));
        }

        if !starved.is_empty() {
            warn!(
                skipped = starved.len(),
                budget_ms = self.tick_budget.map(|b| b.as_millis() as u64).unwrap_or_default(),
                "tick budget exhausted, deferring remaining workspaces"
            );
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for reading in readings {
            let Some(ws) = state.workspaces.get_mut(&reading.id) else {
                continue;
            };
            if ws.registration != reading.registration {
                continue;
            }
            let previous = ws.last.map(|c| c.nr_throttled).unwrap_or_default();
            if reading.counters.nr_throttled > previous && previous != 0 {
                if let Some(metrics) = &self.metrics {
                    metrics
                        .workspaces_throttled
                        .with_label_values(&[qos_label(ws.qos).as_str()])
                        .inc();
                }
            }
            ws.last = Some(reading.counters);
        }
        state.starved = starved;

        if let Some(metrics) = &self.metrics {
            let mut per_qos: HashMap<i32, CpuTime> = HashMap::new();
            for ws in state.workspaces.values() {
                if let Some(last) = ws.last {
                    *per_qos.entry(ws.qos).or_default() += last.usage;
                }
            }
            metrics.workspaces_cputime.reset();
            for (qos, usage) in per_qos {
                metrics
                    .workspaces_cputime
                    .with_label_values(&[qos_label(qos).as_str()])
                    .set(usage.as_secs_f64());
            }
        }

        Ok(snapshot)
    }

    /// Copies out every workspace, starved ones first, then by id.
    fn read_targets(&self) -> Vec<ReadTarget> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut targets: Vec<_> = state
            .workspaces
            .iter()
            .map(|(id, ws)| ReadTarget {
                id: id.clone(),
                registration: ws.registration,
                cfs: ws.cfs.clone(),
                span: ws.span.clone(),
                qos: ws.qos,
                annotations: ws.annotations.clone(),
                last: ws.last,
            })
            .collect();
        targets.sort_by(|a, b| {
            let a_starved = state.starved.contains(&a.id);
            let b_starved = state.starved.contains(&b.id);
            b_starved.cmp(&a_starved).then_with(|| a.id.cmp(&b.id))
        });
        targets
    }

    /// Writes `limit` to the workspace's cgroup.
    ///
    /// Workspaces that are no longer registered, or were not read in the last
    /// snapshot, are left alone.
    pub fn apply_limit(&self, id: &str, limit: Bandwidth, burst: bool) {
        let (cfs, span, qos) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let Some(ws) = state.workspaces.get(id) else {
                debug!(workspace_id = %id, "limit for removed workspace ignored");
                return;
            };
            if state.starved.contains(id) {
                return;
            }
            (ws.cfs.clone(), ws.span.clone(), ws.qos)
        };

        let _enter = span.enter();
        match cfs.set_limit(limit) {
            Ok(true) => info!(limit = %limit, burst, "new cpu limit"),
            Ok(false) => {}
            Err(e) if e.is_gone() => debug!("cgroup gone, cannot set limit"),
            Err(e) => warn!(error = %e, limit = %limit, "cannot set cpu limit"),
        }
        if burst {
            if let Some(metrics) = &self.metrics {
                metrics
                    .workspaces_burst
                    .with_label_values(&[qos_label(qos).as_str()])
                    .inc();
            }
        }
    }
}

impl ReadTarget {
    fn into_workspace(self, counters: Counters) -> Workspace {
        Workspace {
            id: self.id,
            nr_throttled: counters.nr_throttled,
            usage: counters.usage,
            qos: self.qos,
            annotations: self.annotations,
        }
    }
}

/// Reads the kernel counters of one workspace. `None` if it cannot be used
/// this tick.
fn read_counters(target: &ReadTarget) -> Option<Counters> {
    let _enter = target.span.enter();
    let usage = match target.cfs.usage() {
        Ok(usage) => usage,
        Err(e) if e.is_gone() => {
            debug!("cgroup gone, skipping workspace");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "cannot read cpu usage");
            return None;
        }
    };
    let nr_throttled = match target.cfs.nr_throttled() {
        Ok(n) => n,
        Err(e) if e.is_gone() => {
            debug!("cgroup gone, skipping workspace");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "cannot read throttle count");
            target.last.map(|c| c.nr_throttled).unwrap_or_default()
        }
    };
    Some(Counters {
        usage,
        nr_throttled,
    })
}

impl WorkspaceSource for Arc<DispatchListener> {
    fn snapshot(&mut self) -> Result<Vec<Workspace>, SourceError> {
        self.read_workspaces()
    }
}

impl LimitSink for Arc<DispatchListener> {
    fn apply(&mut self, id: &str, limit: Bandwidth, burst: bool) {
        self.apply_limit(id, limit, burst)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use prometheus::Registry;

    use super::*;

    struct FlatRuntime;

    impl ContainerRuntime for FlatRuntime {
        fn container_cgroup_path(&self, container_id: &str) -> Result<String, DispatchError> {
            if container_id.is_empty() {
                return Err(DispatchError::Runtime {
                    container_id: String::new(),
                    reason: "no container".to_string(),
                });
            }
            Ok(format!("workspaces/{container_id}"))
        }
    }

    fn fake_v1_base(containers: &[(&str, u64, u64)]) -> PathBuf {
        let base = std::env::temp_dir().join(format!("cpugovernor-dispatch-{}", Uuid::now_v7()));
        for (container, usage_ns, nr_throttled) in containers {
            let dir = base.join("cpu/workspaces").join(container);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("cpuacct.usage"), usage_ns.to_string()).unwrap();
            let stat = format!("nr_periods 10\nnr_throttled {nr_throttled}\n");
            fs::write(dir.join("cpu.stat"), stat).unwrap();
            fs::write(dir.join("cpu.cfs_period_us"), "100000").unwrap();
            fs::write(dir.join("cpu.cfs_quota_us"), "-1").unwrap();
        }
        base
    }

    fn info(id: &str, container: &str, qos: i32) -> WorkspaceInfo {
        WorkspaceInfo {
            instance_id: id.to_string(),
            container_id: container.to_string(),
            qos,
            ..Default::default()
        }
    }

    fn listener(base: &PathBuf) -> Arc<DispatchListener> {
        Arc::new(DispatchListener::new(base, CgroupHierarchy::Legacy, Arc::new(FlatRuntime)))
    }

    #[tokio::test]
    async fn test_snapshot_reads_counters() {
        let base = fake_v1_base(&[("c1", 2_000_000_000, 4)]);
        let listener = listener(&base);
        listener
            .workspace_added(info("ws-1", "c1", 1), CancellationToken::new())
            .unwrap();

        let snapshot = listener.read_workspaces().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "ws-1");
        assert_eq!(snapshot[0].usage, CpuTime::from_nanos(2_000_000_000));
        assert_eq!(snapshot[0].nr_throttled, 4);
        assert_eq!(snapshot[0].qos, 1);

        fs::remove_dir_all(base).unwrap();
    }

    #[tokio::test]
    async fn test_vanished_cgroup_is_skipped() {
        let base = fake_v1_base(&[("c1", 1_000, 0), ("c2", 1_000, 0)]);
        let listener = listener(&base);
        let lifetime = CancellationToken::new();
        listener.workspace_added(info("ws-1", "c1", 0), lifetime.clone()).unwrap();
        listener.workspace_added(info("ws-2", "c2", 0), lifetime).unwrap();

        fs::remove_dir_all(base.join("cpu/workspaces/c1")).unwrap();
        let snapshot = listener.read_workspaces().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "ws-2");

        // limits for a vanished cgroup are dropped quietly
        listener.apply_limit("ws-1", Bandwidth(1000), false);

        fs::remove_dir_all(base).unwrap();
    }

    #[tokio::test]
    async fn test_apply_limit_writes_quota() {
        let base = fake_v1_base(&[("c1", 1_000, 0)]);
        let mut sink = listener(&base);
        sink.workspace_added(info("ws-1", "c1", 0), CancellationToken::new())
            .unwrap();

        sink.apply("ws-1", Bandwidth(2000), false);
        let quota = fs::read_to_string(base.join("cpu/workspaces/c1/cpu.cfs_quota_us")).unwrap();
        assert_eq!(quota, "200000");

        // unknown workspace: ignored
        sink.apply("ws-404", Bandwidth(2000), true);

        fs::remove_dir_all(base).unwrap();
    }

    #[tokio::test]
    async fn test_lifetime_end_removes_workspace() {
        let base = fake_v1_base(&[("c1", 1_000, 0)]);
        let registry = Registry::new();
        let metrics = GovernorMetrics::new(&registry).unwrap();
        let listener = Arc::new(
            DispatchListener::new(&base, CgroupHierarchy::Legacy, Arc::new(FlatRuntime))
                .with_metrics(metrics.clone()),
        );
        let lifetime = CancellationToken::new();
        listener.workspace_added(info("ws-1", "c1", 2), lifetime.clone()).unwrap();
        assert!(listener.contains("ws-1"));
        assert_eq!(metrics.workspaces_added.with_label_values(&["2"]).get(), 1);

        lifetime.cancel();
        for _ in 0..100 {
            if listener.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(listener.is_empty());
        assert_eq!(metrics.workspaces_removed.with_label_values(&["2"]).get(), 1);

        fs::remove_dir_all(base).unwrap();
    }

    #[tokio::test]
    async fn test_stale_removal_keeps_readded_workspace() {
        let base = fake_v1_base(&[("c1", 1_000, 0)]);
        let listener = listener(&base);
        let first = CancellationToken::new();
        listener.workspace_added(info("ws-1", "c1", 0), first.clone()).unwrap();
        assert!(listener.workspace_removed("ws-1"));
        assert!(!listener.workspace_removed("ws-1"));

        listener
            .workspace_added(info("ws-1", "c1", 0), CancellationToken::new())
            .unwrap();
        first.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(listener.contains("ws-1"));

        fs::remove_dir_all(base).unwrap();
    }

    #[tokio::test]
    async fn test_update_refreshes_annotations() {
        let base = fake_v1_base(&[("c1", 1_000, 0)]);
        let listener = listener(&base);
        listener
            .workspace_added(info("ws-1", "c1", 0), CancellationToken::new())
            .unwrap();

        let mut updated = info("ws-1", "c1", 0);
        updated
            .annotations
            .insert("workspace.cpu/min-limit".to_string(), "3".to_string());
        listener.workspace_updated(updated);

        let snapshot = listener.read_workspaces().unwrap();
        assert_eq!(
            snapshot[0].annotations.get("workspace.cpu/min-limit").map(String::as_str),
            Some("3")
        );

        fs::remove_dir_all(base).unwrap();
    }

    #[tokio::test]
    async fn test_runtime_error_is_reported() {
        let base = fake_v1_base(&[]);
        let listener = listener(&base);
        let err = listener
            .workspace_added(info("ws-1", "", 0), CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, DispatchError::Runtime { .. }));
        assert!(listener.is_empty());
    }

    fn quota(base: &Path, container: &str) -> String {
        fs::read_to_string(base.join("cpu/workspaces").join(container).join("cpu.cfs_quota_us"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_exhausted_budget_reuses_counters() {
        let base = fake_v1_base(&[("c1", 1_000, 0), ("c2", 2_000, 0)]);
        let listener = Arc::new(
            DispatchListener::new(&base, CgroupHierarchy::Legacy, Arc::new(FlatRuntime))
                .with_tick_budget(Duration::ZERO),
        );
        let lifetime = CancellationToken::new();
        listener.workspace_added(info("ws-1", "c1", 0), lifetime.clone()).unwrap();
        listener.workspace_added(info("ws-2", "c2", 0), lifetime).unwrap();

        // one read per snapshot; ws-2 was never read so it is left out
        let snapshot = listener.read_workspaces().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "ws-1");
        assert_eq!(snapshot[0].usage, CpuTime::from_nanos(1_000));

        // starved workspaces keep their kernel limit
        listener.apply_limit("ws-1", Bandwidth(1000), false);
        listener.apply_limit("ws-2", Bandwidth(1000), false);
        assert_eq!(quota(&base, "c1"), "100000");
        assert_eq!(quota(&base, "c2"), "-1");

        // ws-2 goes first now; ws-1 is reported with its previous counters
        fs::write(base.join("cpu/workspaces/c1/cpuacct.usage"), "5000").unwrap();
        let mut snapshot = listener.read_workspaces().unwrap();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].usage, CpuTime::from_nanos(1_000));
        assert_eq!(snapshot[1].usage, CpuTime::from_nanos(2_000));

        listener.apply_limit("ws-1", Bandwidth(3000), false);
        listener.apply_limit("ws-2", Bandwidth(3000), false);
        assert_eq!(quota(&base, "c1"), "100000");
        assert_eq!(quota(&base, "c2"), "300000");

        fs::remove_dir_all(base).unwrap();
    }

    #[tokio::test]
    async fn test_first_snapshot_reports_real_usage() {
        let base = fake_v1_base(&[("c1", 3_600_000_000_000, 7)]);
        let listener = Arc::new(
            DispatchListener::new(&base, CgroupHierarchy::Legacy, Arc::new(FlatRuntime))
                .with_tick_budget(Duration::ZERO),
        );
        listener
            .workspace_added(info("ws-1", "c1", 0), CancellationToken::new())
            .unwrap();

        // a spent budget still reads at least one workspace
        let snapshot = listener.read_workspaces().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].usage, CpuTime::from_nanos(3_600_000_000_000));
        assert_eq!(snapshot[0].nr_throttled, 7);

        fs::remove_dir_all(base).unwrap();
    }
}
