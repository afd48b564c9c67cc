//! Workspace discovery from a cgroup directory
//!
//! Stand-in for an orchestration layer: every child cgroup below a configured
//! parent is treated as one workspace, named after its directory.
//!
//! ```text
//! /sys/fs/cgroup/workspaces/
//! ├── ws-a/      → workspace_added("ws-a")
//! └── ws-b/      → workspace_added("ws-b")
//!                  directory removed → lifetime cancelled → workspace removed
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::listener::{ContainerRuntime, DispatchError, DispatchListener, WorkspaceInfo};
use crate::cgroups::CgroupHierarchy;

/// Maps a container ID to `<parent>/<container ID>`
#[derive(Debug, Clone)]
pub struct CgroupDirectoryRuntime {
    parent: String,
}

impl CgroupDirectoryRuntime {
    pub fn new(parent: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
        }
    }
}

impl ContainerRuntime for CgroupDirectoryRuntime {
    fn container_cgroup_path(&self, container_id: &str) -> Result<String, DispatchError> {
        if container_id.is_empty() || container_id.contains('/') || container_id.starts_with('.') {
            return Err(DispatchError::Runtime {
                container_id: container_id.to_string(),
                reason: "not a cgroup directory name".to_string(),
            });
        }
        let parent = self.parent.trim_matches('/');
        if parent.is_empty() {
            Ok(container_id.to_string())
        } else {
            Ok(format!("{parent}/{container_id}"))
        }
    }
}

/// Periodically lists the child cgroups of a directory and reports changes
pub struct CgroupScanner {
    listener: Arc<DispatchListener>,
    dir: PathBuf,
    /// Lifetime token of every reported workspace
    known: HashMap<String, CancellationToken>,
}

impl CgroupScanner {
    pub fn new(
        listener: Arc<DispatchListener>,
        base: &Path,
        hierarchy: CgroupHierarchy,
        parent: &str,
    ) -> Self {
        Self {
            listener,
            dir: hierarchy.cgroup_dir(base, parent),
            known: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn list_workspaces(&self) -> Result<Vec<String>, DispatchError> {
        let scan_err = |source| DispatchError::Scan {
            path: self.dir.clone(),
            source,
        };

        let mut workspaces = Vec::new();
        if self.dir.exists() {
            for entry in fs::read_dir(&self.dir).map_err(scan_err)? {
                let entry = entry.map_err(scan_err)?;
                if entry.file_type().map_err(scan_err)?.is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        workspaces.push(name.to_string());
                    }
                }
            }
        }
        Ok(workspaces)
    }

    /// Reconciles the listener with the directory once. Returns the number of
    /// added and removed workspaces.
    pub fn scan(&mut self, shutdown: &CancellationToken) -> Result<(usize, usize), DispatchError> {
        let current = self.list_workspaces()?;

        let mut removed = 0;
        self.known.retain(|id, lifetime| {
            if current.contains(id) {
                return true;
            }
            lifetime.cancel();
            removed += 1;
            false
        });

        let mut added = 0;
        for id in current {
            if self.known.contains_key(&id) {
                continue;
            }
            let lifetime = shutdown.child_token();
            let info = WorkspaceInfo {
                instance_id: id.clone(),
                container_id: id.clone(),
                ..Default::default()
            };
            match self.listener.workspace_added(info, lifetime.clone()) {
                Ok(()) => {
                    self.known.insert(id, lifetime);
                    added += 1;
                }
                // retried on the next scan
                Err(e) => warn!(workspace_id = %id, error = %e, "cannot add workspace"),
            }
        }

        if added > 0 || removed > 0 {
            debug!(added, removed, dir = %self.dir.display(), "workspace scan");
        }
        Ok((added, removed))
    }

    /// Starts the background scanner task
    pub fn start(mut self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {}
                }

                if let Err(e) = self.scan(&shutdown) {
                    warn!(error = %e, "workspace scan failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_runtime() {
        let runtime = CgroupDirectoryRuntime::new("/workspaces/");
        assert_eq!(runtime.container_cgroup_path("ws-1").unwrap(), "workspaces/ws-1");
        assert!(runtime.container_cgroup_path("../etc").is_err());
        assert!(runtime.container_cgroup_path("").is_err());

        let flat = CgroupDirectoryRuntime::new("");
        assert_eq!(flat.container_cgroup_path("ws-1").unwrap(), "ws-1");
    }

    #[tokio::test]
    async fn test_scan_reconciles() {
        let base = std::env::temp_dir().join(format!("cpugovernor-scan-{}", uuid::Uuid::now_v7()));
        let parent = base.join("cpu/workspaces");
        fs::create_dir_all(parent.join("ws-a")).unwrap();
        fs::create_dir_all(parent.join("ws-b")).unwrap();
        fs::write(parent.join("cgroup.procs"), "").unwrap();

        let listener = Arc::new(DispatchListener::new(
            &base,
            CgroupHierarchy::Legacy,
            Arc::new(CgroupDirectoryRuntime::new("workspaces")),
        ));
        let mut scanner =
            CgroupScanner::new(listener.clone(), &base, CgroupHierarchy::Legacy, "workspaces");
        let shutdown = CancellationToken::new();

        assert_eq!(scanner.scan(&shutdown).unwrap(), (2, 0));
        assert_eq!(listener.len(), 2);
        assert_eq!(scanner.scan(&shutdown).unwrap(), (0, 0));

        fs::remove_dir(parent.join("ws-a")).unwrap();
        assert_eq!(scanner.scan(&shutdown).unwrap(), (0, 1));
        for _ in 0..100 {
            if !listener.contains("ws-a") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!listener.contains("ws-a"));
        assert!(listener.contains("ws-b"));

        fs::remove_dir_all(base).unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let base = std::env::temp_dir().join(format!("cpugovernor-scan-{}", uuid::Uuid::now_v7()));
        let listener = Arc::new(DispatchListener::new(
            &base,
            CgroupHierarchy::Unified,
            Arc::new(CgroupDirectoryRuntime::new("workspaces")),
        ));
        let mut scanner =
            CgroupScanner::new(listener, &base, CgroupHierarchy::Unified, "workspaces");
        assert_eq!(scanner.scan(&CancellationToken::new()).unwrap(), (0, 0));
    }
}
