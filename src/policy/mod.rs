//! Annotation parsing for shaping policies
//!
//! Annotations are validated once, here. Everything downstream (the artifact
//! loader, the compiler invocation) receives only range-checked parameters.
//!
//! Formats, tokens separated by exactly one space:
//! - `bandwidth`: `<value> <bps|kbps|mbps> <ingress|egress>`
//! - `loss`: `uniform <ingress|egress> <0..100>%` or `exponential <ingress|egress>`

use crate::{Result, ShaperError};
use podshaper_common::{annotations, programs, Direction};
use std::collections::BTreeMap;
use std::fmt;

/// The kinds of policy a pod or service can request through annotations.
///
/// Ordering is the order in which policies are applied to a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum PolicyKind {
    Bandwidth,
    Loss,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 2] = [PolicyKind::Bandwidth, PolicyKind::Loss];

    pub const fn annotation_key(&self) -> &'static str {
        match self {
            PolicyKind::Bandwidth => annotations::BANDWIDTH,
            PolicyKind::Loss => annotations::LOSS,
        }
    }

    /// Program source identifier compiled for this kind
    pub const fn program(&self) -> &'static str {
        match self {
            PolicyKind::Bandwidth => programs::EDT,
            PolicyKind::Loss => programs::LOSS,
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.annotation_key())
    }
}

/// Raw annotation strings keyed by policy kind, captured at admission time
pub type Limits = BTreeMap<PolicyKind, String>;

/// Collect the policy annotations present in an object's annotations.
pub fn extract_limits(object_annotations: &BTreeMap<String, String>) -> Limits {
    PolicyKind::ALL
        .iter()
        .filter_map(|kind| {
            object_annotations
                .get(kind.annotation_key())
                .map(|raw| (*kind, raw.clone()))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossDistribution {
    Uniform { percentage: u8 },
    Exponential,
}

/// A validated shaping policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapingPolicy {
    Bandwidth {
        bytes_per_sec: u64,
        direction: Direction,
    },
    Loss {
        distribution: LossDistribution,
        direction: Direction,
    },
}

impl ShapingPolicy {
    pub fn kind(&self) -> PolicyKind {
        match self {
            ShapingPolicy::Bandwidth { .. } => PolicyKind::Bandwidth,
            ShapingPolicy::Loss { .. } => PolicyKind::Loss,
        }
    }

    pub fn program(&self) -> &'static str {
        self.kind().program()
    }

    pub fn direction(&self) -> Direction {
        match self {
            ShapingPolicy::Bandwidth { direction, .. } | ShapingPolicy::Loss { direction, .. } => {
                *direction
            }
        }
    }

    /// Compile-time constants handed to the program compiler
    pub fn compile_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            programs::PARAM_INTERFACE.to_string(),
            format!("\"{}\"", self.direction().section()),
        )];

        match self {
            ShapingPolicy::Bandwidth { bytes_per_sec, .. } => {
                params.push((programs::PARAM_BANDWIDTH.to_string(), bytes_per_sec.to_string()));
            }
            ShapingPolicy::Loss {
                distribution: LossDistribution::Uniform { percentage },
                ..
            } => {
                params.push((
                    programs::PARAM_DISTRIBUTION.to_string(),
                    programs::DISTRIBUTION_UNIFORM.to_string(),
                ));
                params.push((programs::PARAM_PERCENTAGE.to_string(), percentage.to_string()));
            }
            ShapingPolicy::Loss {
                distribution: LossDistribution::Exponential,
                ..
            } => {
                params.push((
                    programs::PARAM_DISTRIBUTION.to_string(),
                    programs::DISTRIBUTION_EXPONENTIAL.to_string(),
                ));
            }
        }

        params
    }
}

impl fmt::Display for ShapingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapingPolicy::Bandwidth {
                bytes_per_sec,
                direction,
            } => write!(f, "bandwidth {} B/s {}", bytes_per_sec, direction),
            ShapingPolicy::Loss {
                distribution: LossDistribution::Uniform { percentage },
                direction,
            } => write!(f, "loss uniform {}% {}", percentage, direction),
            ShapingPolicy::Loss {
                distribution: LossDistribution::Exponential,
                direction,
            } => write!(f, "loss exponential {}", direction),
        }
    }
}

/// Resolve a raw annotation into a validated policy. Pure, no I/O.
pub fn resolve(kind: PolicyKind, raw: &str) -> Result<ShapingPolicy> {
    match kind {
        PolicyKind::Bandwidth => resolve_bandwidth(raw),
        PolicyKind::Loss => resolve_loss(raw),
    }
}

/// Resolve every entry of a limits map, stopping at the first invalid one.
pub fn resolve_all(limits: &Limits) -> Result<Vec<ShapingPolicy>> {
    limits
        .iter()
        .map(|(kind, raw)| resolve(*kind, raw))
        .collect()
}

fn resolve_bandwidth(raw: &str) -> Result<ShapingPolicy> {
    let tokens: Vec<&str> = raw.split(' ').collect();
    if tokens.len() != 3 {
        return Err(ShaperError::validation("invalid bandwidth parameters"));
    }

    let direction = parse_direction(tokens[2])?;

    let multiplier: u64 = match tokens[1] {
        "bps" => 1,
        "kbps" => 1_000,
        "mbps" => 1_000_000,
        other => {
            return Err(ShaperError::validation(format!(
                "invalid bandwidth unit '{}'. Use bps, kbps or mbps",
                other
            )))
        }
    };

    let value: u64 = tokens[0].parse().map_err(|_| {
        ShaperError::validation(format!("invalid bandwidth value '{}'", tokens[0]))
    })?;
    if value == 0 {
        return Err(ShaperError::validation("bandwidth must be greater than zero"));
    }

    let bytes_per_sec = value
        .checked_mul(multiplier)
        .ok_or_else(|| ShaperError::validation("bandwidth value out of range"))?;

    Ok(ShapingPolicy::Bandwidth {
        bytes_per_sec,
        direction,
    })
}

fn resolve_loss(raw: &str) -> Result<ShapingPolicy> {
    let tokens: Vec<&str> = raw.split(' ').collect();
    if tokens.len() < 2 {
        return Err(ShaperError::validation("invalid loss parameters"));
    }

    let direction = parse_direction(tokens[1])?;

    let distribution = match tokens[0] {
        "uniform" => {
            let percentage = tokens
                .get(2)
                .and_then(|token| token.strip_suffix('%'))
                .and_then(|number| number.parse::<i64>().ok())
                .filter(|value| (0..=100).contains(value))
                .ok_or_else(|| ShaperError::validation("invalid loss percentage"))?;
            LossDistribution::Uniform {
                percentage: percentage as u8,
            }
        }
        "exponential" => LossDistribution::Exponential,
        _ => {
            return Err(ShaperError::validation(
                "invalid distribution. Use uniform or exponential",
            ))
        }
    };

    Ok(ShapingPolicy::Loss {
        distribution,
        direction,
    })
}

fn parse_direction(token: &str) -> Result<Direction> {
    Direction::parse(token)
        .ok_or_else(|| ShaperError::validation("invalid interface. Use ingress or egress"))
}
