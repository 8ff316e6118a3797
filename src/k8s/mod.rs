pub mod client;
pub mod types;
pub mod watcher;

pub use client::K8sClient;
pub use types::{ContainerInfo, PodInfo, ServiceInfo};
pub use watcher::{PodEvent, PodTracker, PodWatcher};
