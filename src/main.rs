//! cpugovernor daemon
//!
//! Usage: `cpugovernor [CONFIG_PATH]` (default `/etc/cpugovernor/config.json`)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cpugovernor::cgroups::CgroupHierarchy;
use cpugovernor::config::{GovernorConfig, DEFAULT_CONFIG_PATH};
use cpugovernor::dispatch::{CgroupDirectoryRuntime, CgroupScanner, DispatchListener};
use cpugovernor::metrics::GovernorMetrics;
use cpugovernor::tracing::{init_tracing, shutdown_tracing};
use cpugovernor::{exporter, Distributor};

/// How often the workspace cgroup directory is rescanned
const SCAN_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match GovernorConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cpugovernor: {e}");
            std::process::exit(1);
        }
    };

    init_tracing("cpugovernor", config.otlp_endpoint.as_deref())?;

    if !config.enabled {
        info!(config = %config_path.display(), "cpu limiting disabled, exiting");
        shutdown_tracing();
        return Ok(());
    }

    let base = config.cgroup_base_path.clone();
    let hierarchy = match CgroupHierarchy::detect(&base) {
        Ok(hierarchy) => hierarchy,
        Err(e) => {
            error!(error = %e, "cannot detect cgroup hierarchy");
            shutdown_tracing();
            std::process::exit(1);
        }
    };
    info!(base = %base.display(), ?hierarchy, "cgroup hierarchy detected");

    let registry = Registry::new();
    let metrics = GovernorMetrics::new(&registry)?;
    let shutdown = CancellationToken::new();

    let mut listener = DispatchListener::new(
        &base,
        hierarchy,
        Arc::new(CgroupDirectoryRuntime::new(config.workspace_cgroup_parent.clone())),
    )
    .with_metrics(metrics.clone());
    if let Some(budget) = config.tick_budget {
        listener = listener.with_tick_budget(budget);
    }
    let listener = Arc::new(listener);

    let mut scanner = CgroupScanner::new(
        listener.clone(),
        &base,
        hierarchy,
        &config.workspace_cgroup_parent,
    );
    scanner.scan(&shutdown)?;
    info!(
        dir = %scanner.dir().display(),
        workspaces = listener.len(),
        "watching workspace cgroups"
    );
    let scanner_handle = scanner.start(SCAN_PERIOD, shutdown.clone());

    let exporter_handle = config.metrics_addr.map(|addr| {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = exporter::serve(addr, registry, shutdown).await {
                error!(error = %e, %addr, "metrics endpoint failed");
            }
        })
    });

    let (limiter, burst_limiter) = config.limiters();
    let distributor = Distributor::new(
        listener.clone(),
        listener,
        limiter,
        burst_limiter,
        config.total_bandwidth(),
    )
    .with_metrics(metrics);
    info!(
        total_bandwidth = %config.total_bandwidth(),
        limit = %config.limit,
        burst_limit = %config.burst_limit,
        period = ?config.control_period,
        "starting cpu limit distributor"
    );
    let distributor_handle = tokio::spawn(distributor.run(config.control_period, shutdown.clone()));

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    shutdown.cancel();
    distributor_handle.await?;
    scanner_handle.await?;
    if let Some(handle) = exporter_handle {
        handle.await?;
    }

    info!("cpugovernor stopped");
    shutdown_tracing();
    Ok(())
}
