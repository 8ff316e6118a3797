//! Artifact lifecycle: compile, pin, attach, and the inverse teardown
//!
//! Artifact names are deterministic (`<program>_<pod uid>`), so the forward
//! path can always start by clearing whatever a previous run left at the
//! same paths. That makes `acquire` safe to repeat after a crash.

use super::{ArtifactLayout, CgroupResolver, Compiler, KernelLoader, ToolError};
use crate::k8s::{ContainerInfo, PodInfo};
use crate::policy::ShapingPolicy;
use crate::ShaperError;
use podshaper_common::Direction;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A program that has been compiled and pinned, and the cgroups it is
/// attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedArtifact {
    pub program: String,
    pub name: String,
    pub direction: Direction,
    pub cgroups: Vec<PathBuf>,
}

/// Why an acquisition stopped, and what it left behind
#[derive(Debug)]
pub struct AcquireFailure {
    pub error: ShaperError,
    /// Set when the failure came after a successful compile. The artifact
    /// (with the cgroups attached so far) must still be released.
    pub partial: Option<AttachedArtifact>,
}

impl AcquireFailure {
    fn clean(error: ShaperError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

pub struct ArtifactLoader {
    layout: ArtifactLayout,
    compiler: Arc<dyn Compiler>,
    kernel: Arc<dyn KernelLoader>,
    cgroups: Arc<dyn CgroupResolver>,
}

impl ArtifactLoader {
    pub fn new(
        layout: ArtifactLayout,
        compiler: Arc<dyn Compiler>,
        kernel: Arc<dyn KernelLoader>,
        cgroups: Arc<dyn CgroupResolver>,
    ) -> Self {
        Self {
            layout,
            compiler,
            kernel,
            cgroups,
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Bring the artifact for `policy` on `pod` from an unknown state to
    /// attached on every container of the pod.
    ///
    /// Steps run strictly in order: remnant unload, remnant delete, compile,
    /// load, attach per container in declared order. The first failing step
    /// ends the acquisition.
    pub async fn acquire(
        &self,
        pod: &PodInfo,
        policy: &ShapingPolicy,
    ) -> Result<AttachedArtifact, AcquireFailure> {
        let program = policy.program();
        let direction = policy.direction();
        let name = self.layout.artifact(program, &pod.uid);
        let object = self.layout.object(&name);
        let pin = self.layout.pin(&name, direction);

        self.clear_remnants(pod, &name, direction)
            .await
            .map_err(AcquireFailure::clean)?;

        tokio::fs::create_dir_all(&self.layout.build_dir)
            .await
            .map_err(|e| {
                AcquireFailure::clean(ShaperError::Compile {
                    artifact: name.clone(),
                    reason: format!(
                        "cannot create build directory {}: {}",
                        self.layout.build_dir.display(),
                        e
                    ),
                })
            })?;

        debug!("Compiling {} for {} ({})", name, pod.qualified_name(), policy);
        self.compiler
            .compile(&self.layout.source(program), &object, &policy.compile_params())
            .await
            .map_err(|e| {
                AcquireFailure::clean(ShaperError::Compile {
                    artifact: name.clone(),
                    reason: e.to_string(),
                })
            })?;

        let mut artifact = AttachedArtifact {
            program: program.to_string(),
            name: name.clone(),
            direction,
            cgroups: Vec::with_capacity(pod.containers.len()),
        };

        if let Err(e) = self.kernel.load(&object, &self.layout.pin_dir(&name)).await {
            return Err(AcquireFailure {
                error: ShaperError::Load {
                    artifact: name,
                    reason: e.to_string(),
                },
                partial: Some(artifact),
            });
        }

        for container in &pod.containers {
            let cgroup = match self.resolve_cgroup(pod, container).await {
                Ok(cgroup) => cgroup,
                Err(error) => {
                    return Err(AcquireFailure {
                        error,
                        partial: Some(artifact),
                    })
                }
            };

            if let Err(e) = self.kernel.attach(&cgroup, direction, &pin).await {
                return Err(AcquireFailure {
                    error: ShaperError::Attach {
                        artifact: name,
                        container: pod.container_path(container),
                        reason: e.to_string(),
                    },
                    partial: Some(artifact),
                });
            }

            debug!(
                "Attached {} to {} ({})",
                name,
                pod.container_path(container),
                cgroup.display()
            );
            artifact.cgroups.push(cgroup);
        }

        info!(
            "Applied {} on {} ({} containers)",
            policy,
            pod.qualified_name(),
            artifact.cgroups.len()
        );
        Ok(artifact)
    }

    /// Tear an artifact down. Every step is attempted whatever the previous
    /// one returned; failures are logged and never propagated.
    pub async fn release(&self, artifact: &AttachedArtifact) {
        let pin = self.layout.pin(&artifact.name, artifact.direction);

        for cgroup in &artifact.cgroups {
            if let Err(e) = self.kernel.detach(cgroup, artifact.direction, &pin).await {
                warn!(
                    "Failed to detach {} from {}: {}",
                    artifact.name,
                    cgroup.display(),
                    e
                );
            }
        }

        match self.kernel.unload(&pin).await {
            Ok(()) | Err(ToolError::NotFound) => {}
            Err(e) => warn!("Failed to unload {}: {}", pin.display(), e),
        }

        let object = self.layout.object(&artifact.name);
        match tokio::fs::remove_file(&object).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", object.display(), e),
        }

        debug!("Released {}", artifact.name);
    }

    /// Delete every compiled object in the build directory. Returns how many
    /// were removed.
    pub async fn sweep_objects(&self) -> usize {
        let build_dir = &self.layout.build_dir;
        let mut entries = match tokio::fs::read_dir(build_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Cannot read build directory {}: {}", build_dir.display(), e);
                }
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error while reading {}: {}", build_dir.display(), e);
                    break;
                }
            };

            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("o") {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed leftover object {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
            }
        }

        removed
    }

    async fn clear_remnants(
        &self,
        pod: &PodInfo,
        name: &str,
        direction: Direction,
    ) -> Result<(), ShaperError> {
        let pin = self.layout.pin(name, direction);

        // A remnant may still be attached; its attachments survive the unlink.
        if self.kernel.pinned(&pin).await {
            self.detach_remnant(pod, name, direction, &pin).await;
        }

        match self.kernel.unload(&pin).await {
            Ok(()) => info!("Removed remnant pin {}", pin.display()),
            Err(ToolError::NotFound) => {}
            Err(e) => {
                return Err(ShaperError::RemnantCleanup {
                    artifact: name.to_string(),
                    reason: format!("unload {}: {}", pin.display(), e),
                })
            }
        }

        let object = self.layout.object(name);
        match tokio::fs::remove_file(&object).await {
            Ok(()) => info!("Removed remnant object {}", object.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ShaperError::RemnantCleanup {
                    artifact: name.to_string(),
                    reason: format!("delete {}: {}", object.display(), e),
                })
            }
        }

        Ok(())
    }

    /// Best effort: a container restarted since the crash has a new cgroup
    /// the remnant was never attached to.
    async fn detach_remnant(
        &self,
        pod: &PodInfo,
        name: &str,
        direction: Direction,
        pin: &Path,
    ) {
        for container in &pod.containers {
            let Ok(cgroup) = self.resolve_cgroup(pod, container).await else {
                continue;
            };
            match self.kernel.detach(&cgroup, direction, pin).await {
                Ok(()) => info!("Detached remnant {} from {}", name, cgroup.display()),
                Err(ToolError::NotFound) => {}
                Err(e) => warn!(
                    "Failed to detach remnant {} from {}: {}",
                    name,
                    cgroup.display(),
                    e
                ),
            }
        }
    }

    async fn resolve_cgroup(
        &self,
        pod: &PodInfo,
        container: &ContainerInfo,
    ) -> Result<PathBuf, ShaperError> {
        let not_found = || ShaperError::CgroupNotFound {
            container: pod.container_path(container),
        };

        let container_id = container.container_id.as_deref().ok_or_else(not_found)?;

        match self.cgroups.resolve(&pod.uid, container_id).await {
            Ok(path) if !path.as_os_str().is_empty() => Ok(path),
            Ok(_) => Err(not_found()),
            Err(e) => {
                debug!(
                    "Cgroup lookup for {} failed: {}",
                    pod.container_path(container),
                    e
                );
                Err(not_found())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::testing::{Call, FakeCgroups, FakeToolchain};
    use crate::policy::{resolve, PolicyKind};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn pod(uid: &str, container_ids: &[&str]) -> PodInfo {
        PodInfo {
            name: "web".to_string(),
            namespace: "shop".to_string(),
            uid: uid.to_string(),
            phase: "Running".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            containers: container_ids
                .iter()
                .enumerate()
                .map(|(i, id)| ContainerInfo {
                    name: format!("c{}", i),
                    container_id: Some(format!("containerd://{}", id)),
                })
                .collect(),
        }
    }

    fn setup() -> (TempDir, FakeToolchain, FakeCgroups, ArtifactLoader) {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeToolchain::default();
        let cgroups = FakeCgroups::default();
        let layout = ArtifactLayout::new(
            dir.path().join("bpf"),
            dir.path().join("build"),
            "/sys/fs/bpf",
        );
        let loader = ArtifactLoader::new(
            layout,
            Arc::new(tools.clone()),
            Arc::new(tools.clone()),
            Arc::new(cgroups.clone()),
        );
        (dir, tools, cgroups, loader)
    }

    fn bandwidth() -> ShapingPolicy {
        resolve(PolicyKind::Bandwidth, "10 kbps egress").unwrap()
    }

    #[tokio::test]
    async fn test_acquire_runs_steps_in_order() {
        let (_dir, tools, _cgroups, loader) = setup();
        let pod = pod("uid-1", &["aaa", "bbb"]);

        let artifact = loader.acquire(&pod, &bandwidth()).await.unwrap();

        assert_eq!(artifact.name, "edt_uid-1");
        assert_eq!(artifact.direction, Direction::Egress);
        assert_eq!(
            artifact.cgroups,
            vec![FakeCgroups::path_for("aaa"), FakeCgroups::path_for("bbb")]
        );

        let pin = PathBuf::from("/sys/fs/bpf/edt_uid-1/cgroup_skb_egress");
        let calls = tools.calls();
        assert!(matches!(&calls[0], Call::Unload { pin: p } if *p == pin));
        assert!(matches!(&calls[1], Call::Compile { params, .. }
            if params.contains(&("BANDWIDTH".to_string(), "10000".to_string()))));
        assert!(matches!(&calls[2], Call::Load { pin_dir, .. }
            if *pin_dir == PathBuf::from("/sys/fs/bpf/edt_uid-1")));
        assert!(matches!(&calls[3], Call::Attach { cgroup, .. }
            if *cgroup == FakeCgroups::path_for("aaa")));
        assert!(matches!(&calls[4], Call::Attach { cgroup, .. }
            if *cgroup == FakeCgroups::path_for("bbb")));
        assert_eq!(calls.len(), 5);
        assert!(loader.layout().object("edt_uid-1").exists());
    }

    #[tokio::test]
    async fn test_acquire_over_remnants_matches_clean_run() {
        let (_dir, tools, _cgroups, loader) = setup();
        let pod = pod("uid-1", &["aaa"]);

        // A crashed run leaves pin, object and attachment behind, nothing recorded
        let clean = loader.acquire(&pod, &bandwidth()).await.unwrap();
        let attachments_after_clean = tools.state().attachments.clone();
        assert!(loader.layout().object(&clean.name).exists());

        let again = loader.acquire(&pod, &bandwidth()).await.unwrap();
        assert_eq!(clean, again);
        assert_eq!(tools.state().attachments, attachments_after_clean);
        assert_eq!(tools.state().pin_dirs.len(), 1);
        assert_eq!(
            tools.programs_on(&FakeCgroups::path_for("aaa"), Direction::Egress).len(),
            1
        );
        assert_eq!(tools.detach_count(), 1);
    }

    #[tokio::test]
    async fn test_remnant_on_restarted_container_does_not_block_acquire() {
        let (_dir, tools, _cgroups, loader) = setup();
        loader
            .acquire(&pod("uid-1", &["aaa"]), &bandwidth())
            .await
            .unwrap();

        // The container came back in a cgroup the remnant was never attached to
        let artifact = loader
            .acquire(&pod("uid-1", &["zzz"]), &bandwidth())
            .await
            .unwrap();

        assert_eq!(artifact.cgroups, vec![FakeCgroups::path_for("zzz")]);
        assert_eq!(
            tools
                .programs_on(&FakeCgroups::path_for("zzz"), Direction::Egress)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_remnant_object_delete_failure_aborts_before_compile() {
        let (_dir, tools, _cgroups, loader) = setup();
        // A directory at the object path cannot be unlinked
        std::fs::create_dir_all(loader.layout().object("edt_uid-1")).unwrap();

        let failure = loader
            .acquire(&pod("uid-1", &["aaa"]), &bandwidth())
            .await
            .unwrap_err();

        match &failure.error {
            ShaperError::RemnantCleanup { artifact, reason } => {
                assert_eq!(artifact, "edt_uid-1");
                assert!(reason.starts_with("delete "));
            }
            other => panic!("expected remnant cleanup error, got {:?}", other),
        }
        assert!(failure.partial.is_none());
        assert_eq!(tools.compile_count(), 0);
    }

    #[tokio::test]
    async fn test_policies_sharing_a_direction_stay_attached_together() {
        let (_dir, tools, _cgroups, loader) = setup();
        let pod = pod("uid-1", &["aaa"]);
        let loss = resolve(PolicyKind::Loss, "uniform egress 10%").unwrap();

        let edt = loader.acquire(&pod, &bandwidth()).await.unwrap();
        let dropper = loader.acquire(&pod, &loss).await.unwrap();

        let hook = FakeCgroups::path_for("aaa");
        assert_eq!(
            tools.programs_on(&hook, Direction::Egress),
            vec![
                PathBuf::from("/sys/fs/bpf/edt_uid-1/cgroup_skb_egress"),
                PathBuf::from("/sys/fs/bpf/loss_uid-1/cgroup_skb_egress"),
            ]
        );

        loader.release(&edt).await;
        assert_eq!(
            tools.programs_on(&hook, Direction::Egress),
            vec![PathBuf::from("/sys/fs/bpf/loss_uid-1/cgroup_skb_egress")]
        );

        loader.release(&dropper).await;
        assert!(tools.programs_on(&hook, Direction::Egress).is_empty());
    }

    #[tokio::test]
    async fn test_remnant_unload_failure_aborts_before_compile() {
        let (_dir, tools, _cgroups, loader) = setup();
        tools.state().fail_unload = true;

        let failure = loader
            .acquire(&pod("uid-1", &["aaa"]), &bandwidth())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ShaperError::RemnantCleanup { .. }));
        assert!(failure.partial.is_none());
        assert_eq!(tools.compile_count(), 0);
    }

    #[tokio::test]
    async fn test_compile_failure_stops_before_load() {
        let (_dir, tools, _cgroups, loader) = setup();
        tools.state().fail_compile = true;

        let failure = loader
            .acquire(&pod("uid-1", &["aaa"]), &bandwidth())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ShaperError::Compile { .. }));
        assert!(failure.partial.is_none());
        assert!(!tools
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Load { .. } | Call::Attach { .. })));
    }

    #[tokio::test]
    async fn test_load_failure_reports_partial_artifact() {
        let (_dir, tools, _cgroups, loader) = setup();
        tools.state().fail_load = true;

        let failure = loader
            .acquire(&pod("uid-1", &["aaa"]), &bandwidth())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ShaperError::Load { .. }));
        let partial = failure.partial.expect("compiled object must be tracked");
        assert!(partial.cgroups.is_empty());
        assert!(!tools.calls().iter().any(|c| matches!(c, Call::Attach { .. })));
    }

    #[tokio::test]
    async fn test_first_attach_failure_stops_remaining_containers() {
        let (_dir, tools, _cgroups, loader) = setup();
        tools.state().fail_attach_for = Some("bbb".to_string());

        let failure = loader
            .acquire(&pod("uid-1", &["aaa", "bbb", "ccc"]), &bandwidth())
            .await
            .unwrap_err();

        match &failure.error {
            ShaperError::Attach { container, .. } => assert_eq!(container, "shop/web/c1"),
            other => panic!("expected attach error, got {:?}", other),
        }
        let partial = failure.partial.unwrap();
        assert_eq!(partial.cgroups, vec![FakeCgroups::path_for("aaa")]);
        assert!(!tools.calls().iter().any(
            |c| matches!(c, Call::Attach { cgroup, .. } if *cgroup == FakeCgroups::path_for("ccc"))
        ));
    }

    #[tokio::test]
    async fn test_missing_cgroup_names_container() {
        let (_dir, _tools, cgroups, loader) = setup();
        cgroups.mark_missing("containerd://aaa");

        let failure = loader
            .acquire(&pod("uid-1", &["aaa"]), &bandwidth())
            .await
            .unwrap_err();

        assert_eq!(
            failure.error.to_string(),
            "empty cgroup for container shop/web/c0"
        );
    }

    #[tokio::test]
    async fn test_release_is_best_effort() {
        let (_dir, tools, _cgroups, loader) = setup();
        let pod = pod("uid-1", &["aaa", "bbb"]);
        let artifact = loader.acquire(&pod, &bandwidth()).await.unwrap();

        // First detach fails; the rest of the teardown must still run.
        tools
            .state()
            .attachments
            .retain(|(cgroup, _, _)| *cgroup != FakeCgroups::path_for("aaa"));

        loader.release(&artifact).await;

        let state = tools.state();
        assert!(state.attachments.is_empty());
        assert!(state.pin_dirs.is_empty());
        drop(state);
        assert_eq!(tools.detach_count(), 2);
        assert!(!loader.layout().object(&artifact.name).exists());
    }

    #[tokio::test]
    async fn test_sweep_objects_only_removes_object_files() {
        let (_dir, _tools, _cgroups, loader) = setup();
        let build_dir = loader.layout().build_dir.clone();
        std::fs::create_dir_all(&build_dir).unwrap();
        std::fs::write(build_dir.join("edt_a.o"), b"").unwrap();
        std::fs::write(build_dir.join("loss_b.o"), b"").unwrap();
        std::fs::write(build_dir.join("notes.txt"), b"").unwrap();

        assert_eq!(loader.sweep_objects().await, 2);
        assert!(build_dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_sweep_objects_without_build_dir() {
        let (_dir, _tools, _cgroups, loader) = setup();
        assert_eq!(loader.sweep_objects().await, 0);
    }
}
