//! Shared vocabulary between the podshaper controller and its tooling
//!
//! This crate defines the names that must stay stable across restarts:
//! - Annotation keys read from pod and service metadata
//! - Program names and their compile-time parameter keys
//! - Deterministic artifact and pin naming, used to find remnants of a
//!   previous run
//! - The namespaces that are never shaped

use std::fmt;

/// Traffic direction a program is attached for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    /// Parse an annotation token. Only the exact lowercase names are accepted.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "ingress" => Some(Direction::Ingress),
            "egress" => Some(Direction::Egress),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    /// ELF section the program is compiled into for this direction
    pub const fn section(&self) -> &'static str {
        match self {
            Direction::Ingress => "cgroup_skb/ingress",
            Direction::Egress => "cgroup_skb/egress",
        }
    }

    /// Name of the file `bpftool prog loadall` pins for this direction's
    /// `cgroup_skb/<direction>` section.
    pub const fn pin_file(&self) -> &'static str {
        match self {
            Direction::Ingress => "cgroup_skb_ingress",
            Direction::Egress => "cgroup_skb_egress",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Annotation keys on pods and services
pub mod annotations {
    pub const BANDWIDTH: &str = "bandwidth";
    pub const LOSS: &str = "loss";
}

/// Program source identifiers and their compile-time parameter keys
pub mod programs {
    /// Earliest-departure-time rate limiter, driven by the bandwidth annotation
    pub const EDT: &str = "edt";
    /// Packet dropper, driven by the loss annotation
    pub const LOSS: &str = "loss";

    /// Section name the program is placed in, as a C string literal
    pub const PARAM_INTERFACE: &str = "INTERFACE";
    pub const PARAM_BANDWIDTH: &str = "BANDWIDTH";
    pub const PARAM_DISTRIBUTION: &str = "DISTRIBUTION";
    pub const PARAM_PERCENTAGE: &str = "PERCENTAGE";

    pub const DISTRIBUTION_UNIFORM: u8 = 0;
    pub const DISTRIBUTION_EXPONENTIAL: u8 = 1;
}

/// Namespaces whose pods are never shaped, matched exactly
pub const RESERVED_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "kube-node-lease"];

pub fn is_reserved_namespace(namespace: &str) -> bool {
    RESERVED_NAMESPACES.contains(&namespace)
}

/// Deterministic artifact name: `<program>_<pod uid>`
///
/// Unique per pod and per program, and identical across restarts, so a
/// crashed run's pins and objects can be found again.
pub fn artifact_name(program: &str, pod_uid: &str) -> String {
    format!("{}_{}", program, pod_uid)
}

/// File name of the compiled object for an artifact
pub fn object_file_name(artifact: &str) -> String {
    format!("{}.o", artifact)
}
