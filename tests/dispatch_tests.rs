//! Integration tests driving the distributor against fake cgroup trees

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cpugovernor::cgroups::CgroupHierarchy;
use cpugovernor::cpulimit::{Bandwidth, Distributor, ResourceLimiter};
use cpugovernor::dispatch::{CgroupDirectoryRuntime, CgroupScanner, DispatchListener};
use cpugovernor::metrics::GovernorMetrics;

const DT: Duration = Duration::from_secs(10);

/// Fake unified hierarchy: `<base>/workspaces/<id>` with the cpu controller
/// not yet delegated.
struct FakeNode {
    base: PathBuf,
}

impl FakeNode {
    fn new() -> Self {
        let base = std::env::temp_dir().join(format!("cpugovernor-node-{}", Uuid::now_v7()));
        fs::create_dir_all(base.join("workspaces")).unwrap();
        fs::write(base.join("cgroup.subtree_control"), "memory\n").unwrap();
        fs::write(base.join("workspaces/cgroup.subtree_control"), "memory\n").unwrap();
        fs::write(base.join("workspaces/cpu.max"), "max 100000\n").unwrap();
        Self { base }
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.base.join("workspaces").join(id)
    }

    fn spawn(&self, id: &str) {
        fs::create_dir_all(self.dir(id)).unwrap();
        self.account(id, Duration::ZERO, 0);
        fs::write(self.dir(id).join("cpu.max"), "max 100000\n").unwrap();
    }

    fn account(&self, id: &str, usage: Duration, nr_throttled: u64) {
        fs::write(
            self.dir(id).join("cpu.stat"),
            format!(
                "usage_usec {}\nuser_usec 0\nsystem_usec 0\n\
                 nr_periods 0\nnr_throttled {nr_throttled}\nthrottled_usec 0\n",
                usage.as_micros()
            ),
        )
        .unwrap();
    }

    fn cpu_max(&self, id: &str) -> String {
        fs::read_to_string(self.dir(id).join("cpu.max"))
            .unwrap()
            .trim()
            .to_string()
    }

    fn listener(&self, registry: &Registry) -> Arc<DispatchListener> {
        Arc::new(
            DispatchListener::new(
                &self.base,
                CgroupHierarchy::Unified,
                Arc::new(CgroupDirectoryRuntime::new("workspaces")),
            )
            .with_metrics(GovernorMetrics::new(registry).unwrap()),
        )
    }

    fn scanner(&self, listener: &Arc<DispatchListener>) -> CgroupScanner {
        CgroupScanner::new(listener.clone(), &self.base, CgroupHierarchy::Unified, "workspaces")
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.base);
    }
}

fn subtree_control(path: &Path) -> String {
    fs::read_to_string(path.join("cgroup.subtree_control")).unwrap()
}

fn counter_value(registry: &Registry, name: &str) -> f64 {
    registry
        .gather()
        .iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric())
        .map(|m| m.get_counter().get_value())
        .sum()
}

/// Test that discovery enables the cpu controller on every ancestor
#[tokio::test]
async fn test_discovery_delegates_cpu_controller() {
    let node = FakeNode::new();
    node.spawn("ws-a");
    let registry = Registry::new();
    let listener = node.listener(&registry);
    let shutdown = CancellationToken::new();

    let mut scanner = node.scanner(&listener);
    assert_eq!(scanner.scan(&shutdown).unwrap(), (1, 0));

    assert!(listener.contains("ws-a"));
    assert_eq!(subtree_control(&node.base), "+cpu");
    assert_eq!(subtree_control(&node.base.join("workspaces")), "+cpu");
    assert_eq!(counter_value(&registry, "cpulimit_workspaces_added_total"), 1.0);
}

/// Test that base limits and bursts end up in cpu.max
#[tokio::test]
async fn test_distributor_writes_cpu_max() {
    let node = FakeNode::new();
    node.spawn("ws-a");
    node.spawn("ws-b");
    let registry = Registry::new();
    let listener = node.listener(&registry);
    let shutdown = CancellationToken::new();
    node.scanner(&listener).scan(&shutdown).unwrap();

    let mut distributor = Distributor::new(
        listener.clone(),
        listener.clone(),
        ResourceLimiter::fixed(Bandwidth(2000)),
        ResourceLimiter::fixed(Bandwidth(6000)),
        Bandwidth(12000),
    );

    // ws-a runs at two CPUs and is throttled from the fourth period on,
    // ws-b idles at a tenth of a CPU
    let throttled = [0, 0, 0, 1, 2];
    for (step, nr_throttled) in throttled.into_iter().enumerate() {
        let elapsed = DT * (step as u32 + 1);
        node.account("ws-a", elapsed * 2, nr_throttled);
        node.account("ws-b", elapsed / 10, 0);

        let record = distributor.tick(DT).unwrap();
        match step {
            0 | 1 => {
                assert_eq!(node.cpu_max("ws-a"), "max 100000");
                assert_eq!(record.bandwidth_used, Bandwidth(0));
            }
            2 | 3 => {
                assert_eq!(node.cpu_max("ws-a"), "200000 100000");
                assert_eq!(node.cpu_max("ws-b"), "200000 100000");
                assert_eq!(record.bandwidth_used, Bandwidth(2100));
            }
            _ => {
                assert_eq!(node.cpu_max("ws-a"), "600000 100000");
                assert_eq!(node.cpu_max("ws-b"), "200000 100000");
                assert_eq!(record.bandwidth_burst, Bandwidth(6000));
            }
        }
    }

    assert_eq!(counter_value(&registry, "cpulimit_workspaces_burst_total"), 1.0);
    assert_eq!(counter_value(&registry, "cpulimit_workspaces_throttled_total"), 1.0);
}

/// Test that a deleted workspace cgroup leaves the distributor
#[tokio::test]
async fn test_removed_cgroup_leaves_distributor() {
    let node = FakeNode::new();
    node.spawn("ws-a");
    node.spawn("ws-b");
    let registry = Registry::new();
    let listener = node.listener(&registry);
    let shutdown = CancellationToken::new();
    let mut scanner = node.scanner(&listener);
    scanner.scan(&shutdown).unwrap();

    let mut distributor = Distributor::new(
        listener.clone(),
        listener.clone(),
        ResourceLimiter::fixed(Bandwidth(1000)),
        ResourceLimiter::fixed(Bandwidth(2000)),
        Bandwidth(4000),
    );
    for step in 1..=3u32 {
        node.account("ws-a", DT * step / 2, 0);
        node.account("ws-b", DT * step / 2, 0);
        distributor.tick(DT).unwrap();
    }
    assert_eq!(distributor.tracked(), 2);

    fs::remove_dir_all(node.dir("ws-b")).unwrap();
    assert_eq!(scanner.scan(&shutdown).unwrap(), (0, 1));

    // removal runs on the listener's lifetime task
    for _ in 0..100 {
        if !listener.contains("ws-b") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!listener.contains("ws-b"));

    distributor.tick(DT).unwrap();
    assert_eq!(distributor.tracked(), 1);
    assert!(distributor.history("ws-b").is_none());
    assert_eq!(counter_value(&registry, "cpulimit_workspaces_removed_total"), 1.0);
}

/// Test that shutting down stops the distributor loop
#[tokio::test]
async fn test_run_stops_on_cancel() {
    let node = FakeNode::new();
    node.spawn("ws-a");
    let registry = Registry::new();
    let listener = node.listener(&registry);
    let shutdown = CancellationToken::new();
    node.scanner(&listener).scan(&shutdown).unwrap();

    let distributor = Distributor::new(
        listener.clone(),
        listener,
        ResourceLimiter::fixed(Bandwidth(1000)),
        ResourceLimiter::fixed(Bandwidth(2000)),
        Bandwidth(4000),
    );
    let handle = tokio::spawn(distributor.run(Duration::from_millis(10), shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

/// Test the legacy layout end to end: quota lands in cpu.cfs_quota_us
#[tokio::test]
async fn test_legacy_hierarchy_quota() {
    let base = std::env::temp_dir().join(format!("cpugovernor-v1-{}", Uuid::now_v7()));
    let dir = base.join("cpu/workspaces/ws-a");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("cpu.cfs_period_us"), "100000\n").unwrap();
    fs::write(dir.join("cpu.cfs_quota_us"), "-1\n").unwrap();
    let account = |usage: Duration| {
        fs::write(dir.join("cpuacct.usage"), format!("{}\n", usage.as_nanos())).unwrap();
        let stat = "nr_periods 0\nnr_throttled 0\nthrottled_time 0\n";
        fs::write(dir.join("cpu.stat"), stat).unwrap();
    };

    let listener = Arc::new(DispatchListener::new(
        &base,
        CgroupHierarchy::Legacy,
        Arc::new(CgroupDirectoryRuntime::new("workspaces")),
    ));
    let mut scanner =
        CgroupScanner::new(listener.clone(), &base, CgroupHierarchy::Legacy, "workspaces");
    assert_eq!(scanner.scan(&CancellationToken::new()).unwrap(), (1, 0));

    let mut distributor = Distributor::new(
        listener.clone(),
        listener,
        ResourceLimiter::fixed(Bandwidth(1500)),
        ResourceLimiter::fixed(Bandwidth(3000)),
        Bandwidth(8000),
    );
    for step in 1..=3u32 {
        account(DT * step);
        distributor.tick(DT).unwrap();
    }

    let quota = fs::read_to_string(dir.join("cpu.cfs_quota_us")).unwrap();
    assert_eq!(quota.trim(), "150000");
    assert_eq!(distributor.history("ws-a").unwrap().limit, Bandwidth(1500));

    fs::remove_dir_all(base).unwrap();
}
