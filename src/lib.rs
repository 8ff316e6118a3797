pub mod cgroup;
pub mod cli;
pub mod config;
pub mod controller;
pub mod ebpf;
pub mod error;
pub mod k8s;
pub mod metrics;
pub mod policy;
pub mod reconcile;

pub use error::{Result, ShaperError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
