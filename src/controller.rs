//! Process-level wiring: bootstrap, watch, reconcile, clean up
//!
//! The watcher runs as its own task and hands events over a bounded channel
//! to this loop, which is the only owner of the [`PodManager`]. Signal
//! handlers are installed before anything is acquired. On SIGINT or SIGTERM,
//! even in the middle of bootstrap, the watcher is stopped first, then
//! cleanup runs to completion.

use crate::cgroup::FsCgroupResolver;
use crate::config::ShaperConfig;
use crate::ebpf::{ArtifactLayout, ArtifactLoader, Bpftool, ClangCompiler};
use crate::k8s::{K8sClient, PodTracker, PodWatcher};
use crate::metrics::{self, ShaperMetrics};
use crate::reconcile::PodManager;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Build the artifact loader backed by clang, bpftool and the cgroup filesystem
pub fn build_loader(config: &ShaperConfig) -> ArtifactLoader {
    let timeout = config.command_timeout();
    let layout = ArtifactLayout::new(
        config.source_dir.clone(),
        config.build_dir.clone(),
        config.pin_root.clone(),
    );

    ArtifactLoader::new(
        layout,
        Arc::new(ClangCompiler::new(
            config.compiler.clone(),
            config.include_dirs.clone(),
            timeout,
        )),
        Arc::new(Bpftool::new(config.bpftool.clone(), timeout)),
        Arc::new(FsCgroupResolver::with_root(config.cgroup_root.clone())),
    )
}

/// The node this controller manages: configured, or else the host name
pub fn resolve_node_name(config: &ShaperConfig) -> Option<String> {
    if let Some(node) = &config.node_name {
        return Some(node.clone());
    }

    match hostname::get().map(|h| h.into_string()) {
        Ok(Ok(host)) => {
            warn!(
                "No node name configured, using host name '{}'. Set NODE_NAME when not on the host network",
                host
            );
            Some(host)
        }
        _ => {
            warn!("Could not determine node name, managing pods of every node");
            None
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
///
/// The handlers stay installed for the life of the process, so a second
/// signal cannot interrupt cleanup.
pub fn listen_for_shutdown(shutdown: CancellationToken) -> Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
        }))
    }
    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                    info!("Received Ctrl+C, shutting down");
                }
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
        }))
    }
}

pub async fn run(config: ShaperConfig, kubeconfig: Option<&Path>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signals = listen_for_shutdown(shutdown.clone())?;

    let client = K8sClient::connect(kubeconfig).await?;
    let node_name = resolve_node_name(&config);
    let shaper_metrics = ShaperMetrics::new()?;

    let metrics_task = config.metrics_addr.map(|addr| {
        let shaper_metrics = shaper_metrics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(shaper_metrics, addr, shutdown).await {
                error!("Metrics endpoint failed: {}", e);
            }
        })
    });

    let mut manager = PodManager::new(
        build_loader(&config),
        config.reserved_namespaces.clone(),
        shaper_metrics,
    );

    info!(
        "Listing services and pods{}",
        node_name
            .as_deref()
            .map(|n| format!(" on node {}", n))
            .unwrap_or_default()
    );
    let services = client.list_services().await?;
    // Pods still starting have no cgroups yet; the watcher reports them later
    let pods: Vec<_> = client
        .list_pods(node_name.as_deref())
        .await?
        .into_iter()
        .filter(|pod| pod.containers_started())
        .collect();
    manager.bootstrap(&services, &pods, &shutdown).await;

    let (events_tx, mut events_rx) = mpsc::channel(config.event_queue_capacity);
    let watcher = PodWatcher::new(
        client.pods_all(),
        node_name,
        PodTracker::seeded(&pods),
        events_tx,
    );
    let watch_task = tokio::spawn(watcher.run(shutdown.clone()));

    if !shutdown.is_cancelled() {
        info!("podshaper running. Send SIGINT or SIGTERM to exit.");
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events_rx.recv() => match event {
                Some(event) => manager.handle_event(event).await,
                None => {
                    warn!("Pod event stream closed");
                    break;
                }
            }
        }
    }

    // No new events are admitted past this point
    shutdown.cancel();
    drop(events_rx);
    if let Err(e) = watch_task.await {
        error!("Pod watcher task failed: {}", e);
    }

    let report = manager.cleanup().await;
    info!(
        "Released {} pods, swept {} objects",
        report.pods_released, report.objects_swept
    );

    if let Some(task) = metrics_task {
        if let Err(e) = task.await {
            error!("Metrics task failed: {}", e);
        }
    }
    if let Err(e) = signals.await {
        error!("Signal listener failed: {}", e);
    }

    info!("podshaper stopped");
    Ok(())
}
