use crate::{Result, ShaperError};
use podshaper_common::RESERVED_NAMESPACES;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Controller settings. Every field has a default, so an empty file (or no
/// file at all) is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ShaperConfig {
    /// Directory holding `<program>.c` sources
    pub source_dir: PathBuf,
    /// Directory compiled objects are written to
    pub build_dir: PathBuf,
    /// Mount point of the BPF filesystem
    pub pin_root: PathBuf,
    pub cgroup_root: PathBuf,
    pub compiler: PathBuf,
    pub include_dirs: Vec<PathBuf>,
    pub bpftool: PathBuf,
    /// Upper bound for every compiler, loader and attach invocation
    pub command_timeout_secs: u64,
    /// Capacity of the queue between the watcher and the reconciliation loop
    pub event_queue_capacity: usize,
    pub reserved_namespaces: Vec<String>,
    /// Only pods scheduled on this node are managed
    pub node_name: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("bpf"),
            build_dir: PathBuf::from("build"),
            pin_root: PathBuf::from("/sys/fs/bpf"),
            cgroup_root: PathBuf::from(crate::cgroup::CGROUP_ROOT),
            compiler: PathBuf::from("clang"),
            include_dirs: vec![PathBuf::from("/usr/include/x86_64-linux-gnu")],
            bpftool: PathBuf::from("bpftool"),
            command_timeout_secs: 30,
            event_queue_capacity: 256,
            reserved_namespaces: RESERVED_NAMESPACES.iter().map(|ns| ns.to_string()).collect(),
            node_name: None,
            metrics_addr: None,
        }
    }
}

impl ShaperConfig {
    /// Load from a YAML file, or defaults when `path` is `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ShaperError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_yaml(&text)?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| ShaperError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(ShaperError::Config(
                "command_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(ShaperError::Config(
                "event_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.compiler.as_os_str().is_empty() || self.bpftool.as_os_str().is_empty() {
            return Err(ShaperError::Config(
                "compiler and bpftool must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ShaperConfig::default();
        assert_eq!(config.pin_root, PathBuf::from("/sys/fs/bpf"));
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert!(config.reserved_namespaces.contains(&"kube-system".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ShaperConfig::from_yaml(
            "build_dir: /var/lib/podshaper/build\nnode_name: worker-1\nmetrics_addr: 0.0.0.0:9091\n",
        )
        .unwrap();

        assert_eq!(config.build_dir, PathBuf::from("/var/lib/podshaper/build"));
        assert_eq!(config.node_name.as_deref(), Some("worker-1"));
        assert_eq!(config.metrics_addr.unwrap().port(), 9091);
        assert_eq!(config.compiler, PathBuf::from("clang"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            ShaperConfig::from_yaml("bulid_dir: /tmp\n"),
            Err(ShaperError::Config(_))
        ));
    }

    #[test]
    fn test_load_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "command_timeout_secs: 0").unwrap();

        assert!(ShaperConfig::load(Some(file.path())).is_err());
        assert!(ShaperConfig::load(None).is_ok());
    }
}
