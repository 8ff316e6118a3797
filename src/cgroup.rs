//! cgroup path resolver for pod containers
//!
//! Shaping programs are attached to the cgroup directory of each container.
//! This module resolves pod UID + container runtime ID to that directory.
//!
//! Supported layouts:
//! - systemd driver: kubepods.slice/kubepods-{qos}.slice/kubepods-{qos}-pod{uid}.slice/{runtime}-{id}.scope
//! - cgroupfs driver: kubepods/{qos}/pod{uid}/{id}
//! - anything else: a directory anywhere below the root whose name contains the ID

use crate::ebpf::{CgroupResolver, ToolError};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Quality of Service classes in Kubernetes
const QOS_CLASSES: [&str; 3] = ["", "burstable", "besteffort"];

/// Scope name prefixes used by container runtimes under the systemd driver
const SCOPE_PREFIXES: [&str; 3] = ["cri-containerd-", "crio-", "docker-"];

/// Cgroup v2 root path
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// How deep the fallback search descends below the cgroup root
const MAX_SCAN_DEPTH: usize = 8;

/// Resolves containers to cgroup directories by inspecting the cgroup filesystem
#[derive(Debug, Clone)]
pub struct FsCgroupResolver {
    cgroup_root: PathBuf,
}

impl FsCgroupResolver {
    pub fn with_root(cgroup_root: PathBuf) -> Self {
        Self { cgroup_root }
    }

    /// Resolve synchronously. `container_id` may carry a runtime scheme
    /// (`containerd://`, `cri-o://`, `docker://`).
    pub fn resolve_path(&self, pod_uid: &str, container_id: &str) -> Option<PathBuf> {
        let id = container_id.split("://").last().unwrap_or(container_id);
        if id.is_empty() {
            return None;
        }

        self.known_layouts(pod_uid, id)
            .into_iter()
            .find(|path| path.is_dir())
            .or_else(|| {
                debug!("No known cgroup layout matched {}, scanning", id);
                scan_for(&self.cgroup_root, id, MAX_SCAN_DEPTH)
            })
    }

    fn known_layouts(&self, pod_uid: &str, id: &str) -> Vec<PathBuf> {
        // systemd slices spell the UID with underscores
        let slice_uid = pod_uid.replace('-', "_");
        let mut candidates = Vec::new();

        for qos in QOS_CLASSES {
            let systemd_pod = if qos.is_empty() {
                self.cgroup_root
                    .join("kubepods.slice")
                    .join(format!("kubepods-pod{}.slice", slice_uid))
            } else {
                self.cgroup_root
                    .join("kubepods.slice")
                    .join(format!("kubepods-{}.slice", qos))
                    .join(format!("kubepods-{}-pod{}.slice", qos, slice_uid))
            };
            for prefix in SCOPE_PREFIXES {
                candidates.push(systemd_pod.join(format!("{}{}.scope", prefix, id)));
            }

            let mut cgroupfs_pod = self.cgroup_root.join("kubepods");
            if !qos.is_empty() {
                cgroupfs_pod.push(qos);
            }
            candidates.push(cgroupfs_pod.join(format!("pod{}", pod_uid)).join(id));
        }

        candidates
    }
}

#[async_trait]
impl CgroupResolver for FsCgroupResolver {
    async fn resolve(&self, pod_uid: &str, container_id: &str) -> Result<PathBuf, ToolError> {
        let resolver = self.clone();
        let pod_uid = pod_uid.to_string();
        let container_id = container_id.to_string();

        tokio::task::spawn_blocking(move || resolver.resolve_path(&pod_uid, &container_id))
            .await
            .map_err(|e| ToolError::Failed(format!("cgroup lookup panicked: {}", e)))?
            .ok_or(ToolError::NotFound)
    }
}

/// Depth-first search for a directory whose name contains `id`
fn scan_for(dir: &Path, id: &str, depth: usize) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;

    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(id))
            .unwrap_or(false);
        if matches {
            return Some(path);
        }
        subdirs.push(path);
    }

    if depth == 0 {
        return None;
    }
    subdirs
        .into_iter()
        .find_map(|sub| scan_for(&sub, id, depth - 1))
}
