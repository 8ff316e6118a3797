use crate::{Result, ShaperError};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Reconciliation counters, registered on a registry owned by this value
#[derive(Clone)]
pub struct ShaperMetrics {
    registry: Registry,
    managed_pods: IntGauge,
    acquisitions: IntCounterVec,
    releases: IntCounterVec,
    pod_events: IntCounterVec,
}

impl ShaperMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let managed_pods = IntGauge::new(
            "podshaper_managed_pods",
            "Pods that currently have shaping programs attached",
        )
        .map_err(metrics_error)?;
        let acquisitions = IntCounterVec::new(
            Opts::new(
                "podshaper_acquisitions_total",
                "Artifact acquisitions by program and outcome",
            ),
            &["program", "outcome"],
        )
        .map_err(metrics_error)?;
        let releases = IntCounterVec::new(
            Opts::new("podshaper_releases_total", "Artifact releases by program"),
            &["program"],
        )
        .map_err(metrics_error)?;
        let pod_events = IntCounterVec::new(
            Opts::new("podshaper_pod_events_total", "Pod events handled by kind"),
            &["kind"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(managed_pods.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(acquisitions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(releases.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(pod_events.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            managed_pods,
            acquisitions,
            releases,
            pod_events,
        })
    }

    pub fn set_managed_pods(&self, count: usize) {
        self.managed_pods.set(count as i64);
    }

    /// `outcome` is `ok` or an error kind such as `compile` or `attach`
    pub fn record_acquisition(&self, program: &str, outcome: &str) {
        self.acquisitions
            .with_label_values(&[program, outcome])
            .inc();
    }

    pub fn record_release(&self, program: &str) {
        self.releases.with_label_values(&[program]).inc();
    }

    pub fn record_pod_event(&self, kind: &str) {
        self.pod_events.with_label_values(&[kind]).inc();
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(metrics_error)
    }
}

fn metrics_error(e: impl std::fmt::Display) -> ShaperError {
    ShaperError::Config(format!("metrics: {}", e))
}
