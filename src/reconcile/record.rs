use crate::ebpf::AttachedArtifact;
use crate::k8s::PodInfo;
use crate::policy::Limits;
use podshaper_common::Direction;
use std::collections::BTreeMap;

/// One managed pod and everything needed to tear its shaping down again
#[derive(Debug, Clone)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    /// Annotations the pod was admitted with; never re-read afterwards
    pub limits: Limits,
    /// Attached artifacts keyed by program name
    pub programs: BTreeMap<String, AttachedArtifact>,
}

impl PodRecord {
    pub fn new(pod: &PodInfo, limits: Limits, artifacts: Vec<AttachedArtifact>) -> Self {
        Self {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            uid: pod.uid.clone(),
            limits,
            programs: artifacts
                .into_iter()
                .map(|artifact| (artifact.program.clone(), artifact))
                .collect(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Program name to the direction it was attached for
    pub fn directions(&self) -> BTreeMap<&str, Direction> {
        self.programs
            .iter()
            .map(|(program, artifact)| (program.as_str(), artifact.direction))
            .collect()
    }
}
