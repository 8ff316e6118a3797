//! Adapters for the external toolchain: `clang` for compiling programs and
//! `bpftool` for pinning and cgroup attachment.
//!
//! Every invocation is bounded by a timeout. A child that outlives it is
//! killed and the call reports [`ToolError::TimedOut`].

use super::{Compiler, KernelLoader, ToolError};
use async_trait::async_trait;
use podshaper_common::Direction;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Run a prepared command to completion, capturing its output.
async fn run_tool(mut command: Command, timeout: Duration) -> Result<String, ToolError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    debug!("Running {:?}", command.as_std());

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ToolError::TimedOut(timeout))?
        .map_err(|source| ToolError::Spawn { program, source })?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(text)
    } else {
        Err(ToolError::Failed(format!(
            "{} ({})",
            text.trim(),
            output.status
        )))
    }
}

/// For teardown calls only: a missing target is not a failure
fn missing_target_as_not_found(error: ToolError) -> ToolError {
    match error {
        ToolError::Failed(message) if message.contains("No such file or directory") => {
            ToolError::NotFound
        }
        other => other,
    }
}

/// Compiles `cgroup_skb` programs with clang's BPF target
#[derive(Debug, Clone)]
pub struct ClangCompiler {
    clang: PathBuf,
    include_dirs: Vec<PathBuf>,
    timeout: Duration,
}

impl ClangCompiler {
    pub fn new(clang: impl Into<PathBuf>, include_dirs: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            clang: clang.into(),
            include_dirs,
            timeout,
        }
    }

    fn command(&self, source: &Path, output: &Path, params: &[(String, String)]) -> Command {
        let mut command = Command::new(&self.clang);
        command
            .args(["-target", "bpf", "-c", "-O2"])
            .arg(source)
            .arg("-o")
            .arg(output);

        for (key, value) in params {
            command.arg(format!("-D{}={}", key, value));
        }
        for dir in &self.include_dirs {
            command.arg(format!("-I{}", dir.display()));
        }

        command
    }
}

#[async_trait]
impl Compiler for ClangCompiler {
    async fn compile(
        &self,
        source: &Path,
        output: &Path,
        params: &[(String, String)],
    ) -> Result<(), ToolError> {
        run_tool(self.command(source, output, params), self.timeout)
            .await
            .map(|_| ())
    }
}

/// Loads, pins and attaches programs through `bpftool`
#[derive(Debug, Clone)]
pub struct Bpftool {
    bpftool: PathBuf,
    timeout: Duration,
}

impl Bpftool {
    pub fn new(bpftool: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bpftool: bpftool.into(),
            timeout,
        }
    }

    fn cgroup_command(
        &self,
        action: &str,
        cgroup: &Path,
        direction: Direction,
        pin: &Path,
    ) -> Command {
        let mut command = Command::new(&self.bpftool);
        command
            .args(["cgroup", action])
            .arg(cgroup)
            .arg(direction.as_str())
            .arg("pinned")
            .arg(pin);
        command
    }

    /// `multi` lets programs of several policies share one cgroup hook
    /// instead of the last attach replacing the earlier ones. Detach takes no
    /// flags; the pinned program selects which attachment goes.
    fn attach_command(&self, cgroup: &Path, direction: Direction, pin: &Path) -> Command {
        let mut command = self.cgroup_command("attach", cgroup, direction, pin);
        command.arg("multi");
        command
    }
}

#[async_trait]
impl KernelLoader for Bpftool {
    async fn load(&self, object: &Path, pin_dir: &Path) -> Result<(), ToolError> {
        let mut command = Command::new(&self.bpftool);
        command
            .args(["prog", "loadall"])
            .arg(object)
            .arg(pin_dir)
            .args(["type", "cgroup/skb"]);

        run_tool(command, self.timeout).await.map(|_| ())
    }

    async fn pinned(&self, pin: &Path) -> bool {
        tokio::fs::try_exists(pin).await.unwrap_or(false)
    }

    async fn unload(&self, pin: &Path) -> Result<(), ToolError> {
        let removed = tokio::fs::remove_file(pin).await;

        // loadall creates one directory per object; drop it once it is empty
        if let Some(pin_dir) = pin.parent() {
            if let Err(e) = tokio::fs::remove_dir(pin_dir).await {
                debug!("Keeping pin directory {}: {}", pin_dir.display(), e);
            }
        }

        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ToolError::NotFound),
            Err(e) => Err(ToolError::Failed(format!(
                "failed to remove {}: {}",
                pin.display(),
                e
            ))),
        }
    }

    async fn attach(
        &self,
        cgroup: &Path,
        direction: Direction,
        pin: &Path,
    ) -> Result<(), ToolError> {
        let command = self.attach_command(cgroup, direction, pin);
        run_tool(command, self.timeout).await.map(|_| ())
    }

    async fn detach(
        &self,
        cgroup: &Path,
        direction: Direction,
        pin: &Path,
    ) -> Result<(), ToolError> {
        let command = self.cgroup_command("detach", cgroup, direction, pin);
        run_tool(command, self.timeout)
            .await
            .map(|_| ())
            .map_err(missing_target_as_not_found)
    }
}
