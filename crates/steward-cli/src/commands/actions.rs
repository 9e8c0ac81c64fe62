//! `steward actions list|describe|validate`.

use anyhow::{Context, Result};
use std::path::Path;

use super::{build_registry, load_config};

pub fn list(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let registry = build_registry(&config)?;

    println!(
        "{:<24} {:<12} {:<7} {:<13} compensation",
        "action", "category", "risk", "reversibility"
    );
    for spec in registry.iter() {
        let compensation = spec
            .compensation
            .as_ref()
            .map(|c| c.action.as_str())
            .unwrap_or("-");
        println!(
            "{:<24} {:<12} {:<7} {:<13} {}",
            spec.name,
            spec.category,
            spec.risk.to_string(),
            spec.reversibility.to_string(),
            compensation
        );
    }
    Ok(0)
}

pub fn describe(config_path: &Path, action_name: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let registry = build_registry(&config)?;
    let spec = registry.lookup(action_name)?;

    let yaml = serde_yaml::to_string(spec).context("failed to render action")?;
    print!("{yaml}");
    if let Some(command) = config.backend.command_for(&spec.name) {
        println!("# backend: {} {}", command.program, command.args.join(" "));
    } else {
        println!("# backend: not configured");
    }
    Ok(0)
}

pub fn validate(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    match build_registry(&config) {
        Ok(registry) => {
            println!("✅ {} action(s) registered", registry.len());
            Ok(0)
        }
        Err(e) => {
            println!("❌ {e:#}");
            Ok(1)
        }
    }
}
