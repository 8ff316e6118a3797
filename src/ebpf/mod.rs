pub mod loader;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use loader::{AcquireFailure, ArtifactLoader, AttachedArtifact};
pub use tools::{Bpftool, ClangCompiler};

use async_trait::async_trait;
use podshaper_common::{artifact_name, object_file_name, Direction};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Outcome of one external tool invocation
#[derive(Error, Debug)]
pub enum ToolError {
    /// The target (pin, object, cgroup) does not exist
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Turns a program source plus compile-time constants into an object file
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(
        &self,
        source: &Path,
        output: &Path,
        params: &[(String, String)],
    ) -> Result<(), ToolError>;
}

/// Pins compiled programs into the BPF filesystem and attaches them to cgroups
#[async_trait]
pub trait KernelLoader: Send + Sync {
    async fn load(&self, object: &Path, pin_dir: &Path) -> Result<(), ToolError>;

    /// Whether a program is pinned at `pin`
    async fn pinned(&self, pin: &Path) -> bool;

    /// Remove a pinned program. A missing pin is reported as [`ToolError::NotFound`].
    async fn unload(&self, pin: &Path) -> Result<(), ToolError>;

    /// Attach alongside any programs already on the hook. Attaching the same
    /// program twice to one hook fails.
    async fn attach(&self, cgroup: &Path, direction: Direction, pin: &Path)
        -> Result<(), ToolError>;

    /// Unlinking a pin does not detach its program, so teardown detaches first.
    async fn detach(&self, cgroup: &Path, direction: Direction, pin: &Path)
        -> Result<(), ToolError>;
}

/// Maps a container runtime ID to the container's cgroup directory
#[async_trait]
pub trait CgroupResolver: Send + Sync {
    async fn resolve(&self, pod_uid: &str, container_id: &str) -> Result<PathBuf, ToolError>;
}

/// Deterministic on-disk locations of every artifact
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub pin_root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        build_dir: impl Into<PathBuf>,
        pin_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            build_dir: build_dir.into(),
            pin_root: pin_root.into(),
        }
    }

    pub fn source(&self, program: &str) -> PathBuf {
        self.source_dir.join(format!("{}.c", program))
    }

    pub fn object(&self, artifact: &str) -> PathBuf {
        self.build_dir.join(object_file_name(artifact))
    }

    pub fn pin_dir(&self, artifact: &str) -> PathBuf {
        self.pin_root.join(artifact)
    }

    pub fn pin(&self, artifact: &str, direction: Direction) -> PathBuf {
        self.pin_dir(artifact).join(direction.pin_file())
    }

    pub fn artifact(&self, program: &str, pod_uid: &str) -> String {
        artifact_name(program, pod_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = ArtifactLayout::new("bpf", "build", "/sys/fs/bpf");
        let artifact = layout.artifact("edt", "uid-1");

        assert_eq!(artifact, "edt_uid-1");
        assert_eq!(layout.source("edt"), PathBuf::from("bpf/edt.c"));
        assert_eq!(layout.object(&artifact), PathBuf::from("build/edt_uid-1.o"));
        assert_eq!(
            layout.pin(&artifact, Direction::Egress),
            PathBuf::from("/sys/fs/bpf/edt_uid-1/cgroup_skb_egress")
        );
    }
}
