//! In-memory stand-ins for the external toolchain

use super::{CgroupResolver, Compiler, KernelLoader, ToolError};
use async_trait::async_trait;
use podshaper_common::Direction;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Compile {
        source: PathBuf,
        output: PathBuf,
        params: Vec<(String, String)>,
    },
    Load {
        object: PathBuf,
        pin_dir: PathBuf,
    },
    Unload {
        pin: PathBuf,
    },
    Attach {
        cgroup: PathBuf,
        direction: Direction,
        pin: PathBuf,
    },
    Detach {
        cgroup: PathBuf,
        direction: Direction,
        pin: PathBuf,
    },
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub calls: Vec<Call>,
    /// Pin directories currently present in the fake BPF filesystem
    pub pin_dirs: BTreeSet<PathBuf>,
    /// Programs on each cgroup hook. Several programs may share a hook, and
    /// an attachment outlives the pin it was made through.
    pub attachments: BTreeSet<(PathBuf, Direction, PathBuf)>,
    pub fail_compile: bool,
    pub fail_load: bool,
    pub fail_unload: bool,
    /// Attach fails for cgroups whose path contains this fragment
    pub fail_attach_for: Option<String>,
}

/// Fake compiler and kernel loader sharing one recorded state
#[derive(Clone, Default)]
pub(crate) struct FakeToolchain {
    state: Arc<Mutex<FakeState>>,
}

impl FakeToolchain {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn compile_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Compile { .. }))
            .count()
    }

    /// Programs attached to one cgroup hook
    pub fn programs_on(&self, cgroup: &Path, direction: Direction) -> Vec<PathBuf> {
        self.state()
            .attachments
            .iter()
            .filter(|(c, d, _)| c == cgroup && *d == direction)
            .map(|(_, _, pin)| pin.clone())
            .collect()
    }

    pub fn detach_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Detach { .. }))
            .count()
    }
}

#[async_trait]
impl Compiler for FakeToolchain {
    async fn compile(
        &self,
        source: &Path,
        output: &Path,
        params: &[(String, String)],
    ) -> Result<(), ToolError> {
        let fail = {
            let mut state = self.state();
            state.calls.push(Call::Compile {
                source: source.to_path_buf(),
                output: output.to_path_buf(),
                params: params.to_vec(),
            });
            state.fail_compile
        };

        if fail {
            return Err(ToolError::Failed("error: use of undeclared identifier".into()));
        }

        tokio::fs::write(output, b"ELF")
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))
    }
}

#[async_trait]
impl KernelLoader for FakeToolchain {
    async fn load(&self, object: &Path, pin_dir: &Path) -> Result<(), ToolError> {
        let mut state = self.state();
        state.calls.push(Call::Load {
            object: object.to_path_buf(),
            pin_dir: pin_dir.to_path_buf(),
        });

        if state.fail_load {
            return Err(ToolError::Failed("Error: failed to load object file".into()));
        }
        if !state.pin_dirs.insert(pin_dir.to_path_buf()) {
            return Err(ToolError::Failed("Error: can't pin: File exists".into()));
        }
        Ok(())
    }

    async fn pinned(&self, pin: &Path) -> bool {
        pin.parent()
            .map(|dir| self.state().pin_dirs.contains(dir))
            .unwrap_or(false)
    }

    async fn unload(&self, pin: &Path) -> Result<(), ToolError> {
        let mut state = self.state();
        state.calls.push(Call::Unload {
            pin: pin.to_path_buf(),
        });

        if state.fail_unload {
            return Err(ToolError::Failed("Operation not permitted".into()));
        }
        let pin_dir = pin.parent().map(Path::to_path_buf).unwrap_or_default();
        if state.pin_dirs.remove(&pin_dir) {
            Ok(())
        } else {
            Err(ToolError::NotFound)
        }
    }

    async fn attach(
        &self,
        cgroup: &Path,
        direction: Direction,
        pin: &Path,
    ) -> Result<(), ToolError> {
        let mut state = self.state();
        state.calls.push(Call::Attach {
            cgroup: cgroup.to_path_buf(),
            direction,
            pin: pin.to_path_buf(),
        });

        let pinned = pin
            .parent()
            .map(|dir| state.pin_dirs.contains(dir))
            .unwrap_or(false);
        if !pinned {
            return Err(ToolError::NotFound);
        }
        if let Some(fragment) = &state.fail_attach_for {
            if cgroup.to_string_lossy().contains(fragment.as_str()) {
                return Err(ToolError::Failed("Error: failed to attach program".into()));
            }
        }
        if !state
            .attachments
            .insert((cgroup.to_path_buf(), direction, pin.to_path_buf()))
        {
            return Err(ToolError::Failed("Error: failed to attach program: File exists".into()));
        }
        Ok(())
    }

    async fn detach(
        &self,
        cgroup: &Path,
        direction: Direction,
        pin: &Path,
    ) -> Result<(), ToolError> {
        let mut state = self.state();
        state.calls.push(Call::Detach {
            cgroup: cgroup.to_path_buf(),
            direction,
            pin: pin.to_path_buf(),
        });

        let key = (cgroup.to_path_buf(), direction, pin.to_path_buf());
        if state.attachments.remove(&key) {
            Ok(())
        } else {
            Err(ToolError::NotFound)
        }
    }
}

/// Resolves `<runtime>://<id>` to `/sys/fs/cgroup/fake/<id>` unless the ID is
/// marked missing.
#[derive(Clone, Default)]
pub(crate) struct FakeCgroups {
    missing: Arc<Mutex<HashSet<String>>>,
}

impl FakeCgroups {
    pub fn mark_missing(&self, container_id: &str) {
        self.missing.lock().unwrap().insert(container_id.to_string());
    }

    pub fn path_for(container_id: &str) -> PathBuf {
        let id = container_id.split("://").last().unwrap_or(container_id);
        PathBuf::from("/sys/fs/cgroup/fake").join(id)
    }
}

#[async_trait]
impl CgroupResolver for FakeCgroups {
    async fn resolve(&self, _pod_uid: &str, container_id: &str) -> Result<PathBuf, ToolError> {
        if self.missing.lock().unwrap().contains(container_id) {
            return Err(ToolError::NotFound);
        }
        Ok(Self::path_for(container_id))
    }
}
