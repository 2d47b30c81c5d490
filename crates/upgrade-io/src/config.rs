//! Engine configuration files.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use upgrade_algo::UpgradeConfig;

fn parse(path: &Path, data: &str) -> Result<UpgradeConfig> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
            serde_yaml::from_str(data).context("parsing upgrade config yaml")
        }
        Some(ext) if ext.eq_ignore_ascii_case("json") => {
            serde_json::from_str(data).context("parsing upgrade config json")
        }
        Some(ext) if ext.eq_ignore_ascii_case("toml") => {
            toml::from_str(data).context("parsing upgrade config toml")
        }
        _ => serde_yaml::from_str(data)
            .or_else(|_| serde_json::from_str(data))
            .context("parsing upgrade config"),
    }
}

/// Load and validate an [`UpgradeConfig`]; the format follows the file
/// extension, with YAML then JSON tried for anything else.
pub fn load_config(path: &Path) -> Result<UpgradeConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading upgrade config '{}'", path.display()))?;
    let config = parse(path, &data)?;
    config
        .validate()
        .with_context(|| format!("validating upgrade config '{}'", path.display()))?;
    Ok(config)
}
