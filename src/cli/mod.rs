pub mod commands;

use crate::policy::PolicyKind;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "podshaper")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-pod bandwidth and packet loss shaping with cgroup eBPF programs", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to a YAML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Path to a kubeconfig file")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, global = true, env = "NODE_NAME", help = "Only manage pods on this node")]
    pub node_name: Option<String>,

    #[arg(long, global = true, help = "Directory for compiled objects")]
    pub build_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "BPF filesystem mount point")]
    pub pin_root: Option<PathBuf>,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this address")]
    pub metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    #[command(about = "Run the controller until interrupted (default)")]
    Run,
    #[command(about = "Check an annotation value and print the resolved policy")]
    Validate {
        #[arg(value_enum, help = "Annotation kind")]
        kind: PolicyKind,

        #[arg(help = "Annotation value, e.g. \"10 mbps egress\"")]
        annotation: String,
    },
    #[command(about = "Delete leftover compiled objects from the build directory")]
    Sweep,
}

impl Cli {
    pub fn resolved_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}
