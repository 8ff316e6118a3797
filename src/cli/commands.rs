use crate::cli::{Cli, Commands};
use crate::config::ShaperConfig;
use crate::controller;
use crate::policy::{self, PolicyKind, ShapingPolicy};
use anyhow::Context;
use serde_json::json;
use tracing::info;

pub async fn handle_command(cli: Cli) -> anyhow::Result<()> {
    let command = cli.resolved_command();
    match command {
        Commands::Run => {
            let config = effective_config(&cli)?;
            controller::run(config, cli.kubeconfig.as_deref())
                .await
                .context("controller failed")
        }
        Commands::Validate { kind, annotation } => handle_validate(kind, &annotation),
        Commands::Sweep => {
            let config = effective_config(&cli)?;
            handle_sweep(&config).await
        }
    }
}

/// Configuration file (or defaults) with command line overrides applied
pub fn effective_config(cli: &Cli) -> anyhow::Result<ShaperConfig> {
    let mut config = ShaperConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("invalid configuration in {}", path.display()),
        None => "invalid default configuration".to_string(),
    })?;

    if let Some(node) = &cli.node_name {
        config.node_name = Some(node.clone());
    }
    if let Some(dir) = &cli.build_dir {
        config.build_dir = dir.clone();
    }
    if let Some(dir) = &cli.pin_root {
        config.pin_root = dir.clone();
    }
    if let Some(addr) = cli.metrics_addr {
        config.metrics_addr = Some(addr);
    }

    Ok(config)
}

fn handle_validate(kind: PolicyKind, annotation: &str) -> anyhow::Result<()> {
    let policy = policy::resolve(kind, annotation)
        .with_context(|| format!("{} annotation '{}' rejected", kind, annotation))?;

    println!("{}", serde_json::to_string_pretty(&describe(&policy))?);
    Ok(())
}

/// JSON view of a resolved policy, as printed by `validate`
pub fn describe(policy: &ShapingPolicy) -> serde_json::Value {
    let params: serde_json::Map<String, serde_json::Value> = policy
        .compile_params()
        .into_iter()
        .map(|(key, value)| (key, serde_json::Value::String(value)))
        .collect();

    json!({
        "kind": policy.kind().to_string(),
        "program": policy.program(),
        "direction": policy.direction().as_str(),
        "summary": policy.to_string(),
        "params": params,
    })
}

async fn handle_sweep(config: &ShaperConfig) -> anyhow::Result<()> {
    let loader = controller::build_loader(config);
    let removed = loader.sweep_objects().await;
    info!(
        "Removed {} objects from {}",
        removed,
        config.build_dir.display()
    );
    println!("Removed {} compiled objects", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn test_describe_bandwidth() {
        let policy = policy::resolve(PolicyKind::Bandwidth, "10 mbps egress").unwrap();
        let value = describe(&policy);

        assert_eq!(value["kind"], "bandwidth");
        assert_eq!(value["program"], "edt");
        assert_eq!(value["direction"], "egress");
        assert_eq!(value["params"]["BANDWIDTH"], "10000000");
    }

    #[test]
    fn test_validate_rejects_bad_annotation() {
        let err = handle_validate(PolicyKind::Loss, "uniform egress 101%").unwrap_err();
        assert!(format!("{:#}", err).contains("invalid loss percentage"));
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "podshaper",
            "--node-name",
            "worker-2",
            "--build-dir",
            "/tmp/podshaper-build",
            "sweep",
        ])
        .unwrap();

        let config = effective_config(&cli).unwrap();
        assert_eq!(config.node_name.as_deref(), Some("worker-2"));
        assert_eq!(config.build_dir, PathBuf::from("/tmp/podshaper-build"));
        assert_eq!(config.pin_root, PathBuf::from("/sys/fs/bpf"));
    }
}
