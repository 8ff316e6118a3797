//! Reconciliation engine
//!
//! Owns the UID -> [`PodRecord`] mapping and drives the artifact loader from
//! pod and service events. Handlers take `&mut self`: the controller feeds
//! events from one queue, so there is exactly one writer.
//!
//! Precedence rules:
//! - Pod-level annotations override a service-derived record for the same UID.
//! - A non-overriding add never replaces an existing record.
//! - A record exists only if every policy of the add was acquired.

mod record;

pub use record::PodRecord;

use crate::ebpf::{AcquireFailure, ArtifactLoader, AttachedArtifact};
use crate::k8s::{PodEvent, PodInfo, ServiceInfo};
use crate::metrics::ShaperMetrics;
use crate::policy::{self, Limits};
use crate::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Whether an add may replace an existing record for the same UID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Pod-level policy: release whatever is recorded, then apply
    Override,
    /// Service-derived policy or a watch event: apply only to unmanaged pods
    KeepExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Admitted,
    /// No policy annotations, or a reserved namespace
    Ignored,
    /// A record already exists and the add may not replace it
    AlreadyManaged,
}

/// Totals reported by [`PodManager::cleanup`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub pods_released: usize,
    pub objects_swept: usize,
}

pub struct PodManager {
    loader: ArtifactLoader,
    reserved_namespaces: Vec<String>,
    // Insertion order is kept so cleanup logs are deterministic
    records: Vec<PodRecord>,
    metrics: ShaperMetrics,
}

impl PodManager {
    pub fn new(
        loader: ArtifactLoader,
        reserved_namespaces: Vec<String>,
        metrics: ShaperMetrics,
    ) -> Self {
        Self {
            loader,
            reserved_namespaces,
            records: Vec::new(),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, uid: &str) -> Option<&PodRecord> {
        self.records.iter().find(|r| r.uid == uid)
    }

    fn is_reserved(&self, namespace: &str) -> bool {
        self.reserved_namespaces.iter().any(|ns| ns == namespace)
    }

    /// Apply the initial listing: service-derived policies first, then
    /// pod-level ones so that a pod's own annotations win.
    ///
    /// Per-pod failures are logged and do not stop the pass. Once `shutdown`
    /// is cancelled no further pod is added; whatever was acquired so far is
    /// left for [`PodManager::cleanup`]. Returns the number of failed adds.
    pub async fn bootstrap(
        &mut self,
        services: &[ServiceInfo],
        pods: &[PodInfo],
        shutdown: &CancellationToken,
    ) -> usize {
        let mut failures = 0;

        for service in services {
            let limits = policy::extract_limits(&service.annotations);
            if limits.is_empty() {
                continue;
            }

            for pod in pods.iter().filter(|pod| service.selects(pod)) {
                if shutdown.is_cancelled() {
                    info!("Bootstrap interrupted, {} pods managed", self.records.len());
                    return failures;
                }
                debug!(
                    "Pod {} inherits limits from service {}/{}",
                    pod.qualified_name(),
                    service.namespace,
                    service.name
                );
                if let Err(e) = self.add_pod(pod, limits.clone(), AddMode::KeepExisting).await {
                    error!("Failed to add pod {}: {}", pod.qualified_name(), e);
                    failures += 1;
                }
            }
        }

        for pod in pods {
            if shutdown.is_cancelled() {
                info!("Bootstrap interrupted, {} pods managed", self.records.len());
                return failures;
            }
            let limits = policy::extract_limits(&pod.annotations);
            if let Err(e) = self.add_pod(pod, limits, AddMode::Override).await {
                error!("Failed to add pod {}: {}", pod.qualified_name(), e);
                failures += 1;
            }
        }

        info!(
            "Bootstrap complete: {} pods managed, {} failed",
            self.records.len(),
            failures
        );
        failures
    }

    /// Admit `pod` with `limits`.
    ///
    /// Annotations are validated before any kernel state is touched. If an
    /// acquisition fails, every artifact this add brought past compilation
    /// is released again and no record is inserted.
    pub async fn add_pod(
        &mut self,
        pod: &PodInfo,
        limits: Limits,
        mode: AddMode,
    ) -> Result<AddOutcome> {
        if limits.is_empty() {
            return Ok(AddOutcome::Ignored);
        }
        if self.is_reserved(&pod.namespace) {
            debug!("Ignoring pod {} in reserved namespace", pod.qualified_name());
            return Ok(AddOutcome::Ignored);
        }

        if self.get(&pod.uid).is_some() && mode == AddMode::KeepExisting {
            debug!("Pod {} is already managed", pod.qualified_name());
            return Ok(AddOutcome::AlreadyManaged);
        }

        let policies = policy::resolve_all(&limits)?;

        if mode == AddMode::Override {
            self.remove_pod(&pod.uid).await;
        }

        let mut acquired: Vec<AttachedArtifact> = Vec::with_capacity(policies.len());
        for policy in &policies {
            match self.loader.acquire(pod, policy).await {
                Ok(artifact) => {
                    self.metrics.record_acquisition(policy.program(), "ok");
                    acquired.push(artifact);
                }
                Err(AcquireFailure { error, partial }) => {
                    self.metrics
                        .record_acquisition(policy.program(), error.kind());
                    acquired.extend(partial);
                    self.roll_back(pod, &acquired).await;
                    return Err(error);
                }
            }
        }

        self.records.push(PodRecord::new(pod, limits, acquired));
        self.metrics.set_managed_pods(self.records.len());
        info!("Added pod: {}", pod.qualified_name());
        Ok(AddOutcome::Admitted)
    }

    /// Watch-delivered add: the pod's own annotations, never overriding.
    pub async fn on_pod_added(&mut self, pod: &PodInfo) -> Result<AddOutcome> {
        let limits = policy::extract_limits(&pod.annotations);
        self.add_pod(pod, limits, AddMode::KeepExisting).await
    }

    /// Release and forget the record for `uid`. Unknown UIDs are a no-op.
    /// Returns whether a record was removed.
    pub async fn remove_pod(&mut self, uid: &str) -> bool {
        let Some(index) = self.records.iter().position(|r| r.uid == uid) else {
            return false;
        };
        let record = self.records.remove(index);

        for artifact in record.programs.values() {
            self.loader.release(artifact).await;
            self.metrics.record_release(&artifact.program);
        }

        self.metrics.set_managed_pods(self.records.len());
        info!("Deleted pod: {}", record.qualified_name());
        true
    }

    pub async fn on_pod_deleted(&mut self, pod: &PodInfo) -> bool {
        self.remove_pod(&pod.uid).await
    }

    /// Apply one watch event, logging rather than returning failures.
    pub async fn handle_event(&mut self, event: PodEvent) {
        match event {
            PodEvent::Added(pod) => {
                self.metrics.record_pod_event("added");
                if let Err(e) = self.on_pod_added(&pod).await {
                    error!("Failed to add pod {}: {}", pod.qualified_name(), e);
                }
            }
            PodEvent::Deleted(pod) => {
                self.metrics.record_pod_event("deleted");
                self.on_pod_deleted(&pod).await;
            }
        }
    }

    /// Release every record, then delete any compiled object still in the
    /// build directory. Runs once, at shutdown.
    pub async fn cleanup(&mut self) -> CleanupReport {
        let uids: Vec<String> = self.records.iter().map(|r| r.uid.clone()).collect();

        let mut report = CleanupReport::default();
        for uid in uids {
            if self.remove_pod(&uid).await {
                report.pods_released += 1;
            }
        }

        report.objects_swept = self.loader.sweep_objects().await;
        if report.objects_swept > 0 {
            warn!(
                "Removed {} untracked objects from {}",
                report.objects_swept,
                self.loader.layout().build_dir.display()
            );
        }

        info!(
            "Cleanup complete: released {} pods",
            report.pods_released
        );
        report
    }

    async fn roll_back(&self, pod: &PodInfo, artifacts: &[AttachedArtifact]) {
        if artifacts.is_empty() {
            return;
        }
        warn!(
            "Rolling back {} artifacts of {}",
            artifacts.len(),
            pod.qualified_name()
        );
        for artifact in artifacts {
            self.loader.release(artifact).await;
            self.metrics.record_release(&artifact.program);
        }
    }
}
