use crate::k8s::types::{PodInfo, ServiceInfo};
use crate::{Result, ShaperError};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use std::path::Path;
use tracing::{debug, info};

#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Connect using `kubeconfig` when given, otherwise the in-cluster
    /// service account or `~/.kube/config`.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ShaperError::Kubernetes(format!(
                        "Failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| {
                            ShaperError::Kubernetes(format!("Invalid kubeconfig: {}", e))
                        })?;
                Client::try_from(config).map_err(|e| {
                    ShaperError::Kubernetes(format!("Failed to create K8s client: {}", e))
                })?
            }
            None => Client::try_default().await.map_err(|e| {
                ShaperError::Kubernetes(format!("Failed to create K8s client: {}", e))
            })?,
        };

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client })
    }

    pub fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    pub fn services_all(&self) -> Api<Service> {
        Api::all(self.client.clone())
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let services = self
            .services_all()
            .list(&ListParams::default())
            .await
            .map_err(|e| ShaperError::Kubernetes(format!("Failed to list services: {}", e)))?;

        Ok(services
            .items
            .iter()
            .map(ServiceInfo::from_k8s_service)
            .collect())
    }

    /// List pods, restricted to one node when `node_name` is set
    pub async fn list_pods(&self, node_name: Option<&str>) -> Result<Vec<PodInfo>> {
        let params = match node_name {
            Some(node) => ListParams::default().fields(&node_field_selector(node)),
            None => ListParams::default(),
        };

        let pods = self
            .pods_all()
            .list(&params)
            .await
            .map_err(|e| ShaperError::Kubernetes(format!("Failed to list pods: {}", e)))?;

        Ok(pods.items.iter().map(PodInfo::from_k8s_pod).collect())
    }
}

pub fn node_field_selector(node_name: &str) -> String {
    format!("spec.nodeName={}", node_name)
}
