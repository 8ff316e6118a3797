use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::BTreeMap;

/// A container of a pod, with the runtime ID once the container has started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub phase: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Containers in the order the pod spec declares them
    pub containers: Vec<ContainerInfo>,
}

impl PodInfo {
    pub fn from_k8s_pod(pod: &Pod) -> Self {
        let metadata = &pod.metadata;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        let statuses = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|v| v.as_slice())
            .unwrap_or(&[]);

        let containers = spec
            .map(|s| {
                s.containers
                    .iter()
                    .map(|c| ContainerInfo {
                        name: c.name.clone(),
                        container_id: statuses
                            .iter()
                            .find(|cs| cs.name == c.name)
                            .and_then(|cs| cs.container_id.clone())
                            .filter(|id| !id.is_empty()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            uid: metadata.uid.clone().unwrap_or_default(),
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            labels: metadata.labels.clone().unwrap_or_default(),
            annotations: metadata.annotations.clone().unwrap_or_default(),
            containers,
        }
    }

    /// `namespace/name`, for logging
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// `namespace/pod/container`, for logging and error messages
    pub fn container_path(&self, container: &ContainerInfo) -> String {
        format!("{}/{}/{}", self.namespace, self.name, container.name)
    }

    /// True once every container has a runtime ID, i.e. its cgroup exists.
    pub fn containers_started(&self) -> bool {
        self.phase == "Running"
            && !self.containers.is_empty()
            && self.containers.iter().all(|c| c.container_id.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
}

impl ServiceInfo {
    pub fn from_k8s_service(service: &Service) -> Self {
        let metadata = &service.metadata;

        Self {
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            annotations: metadata.annotations.clone().unwrap_or_default(),
            selector: service
                .spec
                .as_ref()
                .and_then(|s| s.selector.clone())
                .unwrap_or_default(),
        }
    }

    /// Label-subset match within the service's own namespace. A service
    /// without a selector selects nothing.
    pub fn selects(&self, pod: &PodInfo) -> bool {
        !self.selector.is_empty()
            && self.namespace == pod.namespace
            && self
                .selector
                .iter()
                .all(|(key, value)| pod.labels.get(key) == Some(value))
    }
}
