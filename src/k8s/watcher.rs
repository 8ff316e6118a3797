//! Kubernetes pod watcher feeding the reconciliation loop
//!
//! The kube watcher reports every change as an apply. This module narrows
//! that down to the two notifications the controller acts on:
//! - `Added`: the first time a pod is seen with all of its containers started
//! - `Deleted`: the pod is gone
//!
//! Later applies of an already reported pod are updates and are dropped, so
//! annotation changes on a live pod take effect only after it is recreated.

use crate::k8s::client::node_field_selector;
use crate::k8s::types::PodInfo;
use crate::{Result, ShaperError};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::Api;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    Added(PodInfo),
    Deleted(PodInfo),
}

/// Decides which watch notifications become [`PodEvent`]s
#[derive(Debug, Default)]
pub struct PodTracker {
    reported: HashMap<String, PodInfo>,
    relisted: Option<HashSet<String>>,
}

impl PodTracker {
    /// Start from a listing the controller has already acted on
    pub fn seeded(pods: &[PodInfo]) -> Self {
        Self {
            reported: pods
                .iter()
                .filter(|pod| !pod.uid.is_empty() && pod.containers_started())
                .map(|pod| (pod.uid.clone(), pod.clone()))
                .collect(),
            relisted: None,
        }
    }

    pub fn len(&self) -> usize {
        self.reported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reported.is_empty()
    }

    pub fn apply(&mut self, pod: PodInfo) -> Option<PodEvent> {
        if pod.uid.is_empty() {
            return None;
        }
        if let Some(relisted) = self.relisted.as_mut() {
            relisted.insert(pod.uid.clone());
        }
        if self.reported.contains_key(&pod.uid) || !pod.containers_started() {
            return None;
        }

        self.reported.insert(pod.uid.clone(), pod.clone());
        Some(PodEvent::Added(pod))
    }

    pub fn delete(&mut self, pod: PodInfo) -> Option<PodEvent> {
        if pod.uid.is_empty() {
            return None;
        }
        self.reported.remove(&pod.uid);
        Some(PodEvent::Deleted(pod))
    }

    /// A relist is starting; remember which pods it mentions.
    pub fn begin_relist(&mut self) {
        self.relisted = Some(HashSet::new());
    }

    /// The relist is complete. Pods reported earlier but absent from it were
    /// deleted while the watch was down.
    pub fn finish_relist(&mut self) -> Vec<PodEvent> {
        let Some(relisted) = self.relisted.take() else {
            return Vec::new();
        };

        let gone: Vec<String> = self
            .reported
            .keys()
            .filter(|uid| !relisted.contains(*uid))
            .cloned()
            .collect();

        gone.into_iter()
            .filter_map(|uid| self.reported.remove(&uid))
            .map(PodEvent::Deleted)
            .collect()
    }
}

enum WatchEnd {
    StreamEnded,
    ReceiverGone,
}

/// Streams pod notifications into a bounded channel
pub struct PodWatcher {
    api: Api<Pod>,
    node_name: Option<String>,
    tracker: PodTracker,
    events: mpsc::Sender<PodEvent>,
}

impl PodWatcher {
    pub fn new(
        api: Api<Pod>,
        node_name: Option<String>,
        tracker: PodTracker,
        events: mpsc::Sender<PodEvent>,
    ) -> Self {
        Self {
            api,
            node_name,
            tracker,
            events,
        }
    }

    /// Watch until `shutdown` is cancelled or the receiver is dropped,
    /// reconnecting with exponential backoff.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Starting Kubernetes pod watcher...");

        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.watch_pods() => result,
            };

            match result {
                Ok(WatchEnd::ReceiverGone) => {
                    debug!("Event receiver dropped, stopping pod watcher");
                    break;
                }
                Ok(WatchEnd::StreamEnded) => {
                    warn!("Pod watch stream ended, reconnecting...");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    error!("Pod watch failed: {}, reconnecting in {:?}", e, backoff);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }

        info!("Pod watcher stopped");
    }

    async fn watch_pods(&mut self) -> Result<WatchEnd> {
        let mut config = watcher::Config::default();
        if let Some(node) = &self.node_name {
            config = config.fields(&node_field_selector(node));
        }

        let mut stream = watcher::watcher(self.api.clone(), config).boxed();

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ShaperError::Kubernetes(e.to_string()))?
        {
            let outgoing = match event {
                Event::Init => {
                    debug!("Pod watcher (re)listing");
                    self.tracker.begin_relist();
                    Vec::new()
                }
                Event::InitApply(pod) | Event::Apply(pod) => self
                    .tracker
                    .apply(PodInfo::from_k8s_pod(&pod))
                    .into_iter()
                    .collect(),
                Event::Delete(pod) => self
                    .tracker
                    .delete(PodInfo::from_k8s_pod(&pod))
                    .into_iter()
                    .collect(),
                Event::InitDone => {
                    let vanished = self.tracker.finish_relist();
                    info!(
                        "Pod watcher initial sync complete. Tracking {} pods, {} vanished",
                        self.tracker.len(),
                        vanished.len()
                    );
                    vanished
                }
            };

            for event in outgoing {
                if self.events.send(event).await.is_err() {
                    return Ok(WatchEnd::ReceiverGone);
                }
            }
        }

        Ok(WatchEnd::StreamEnded)
    }
}
