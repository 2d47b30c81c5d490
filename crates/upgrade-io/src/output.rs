//! Result documents and DSS redirect chains.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use upgrade_core::{render_script, EditCommand};

pub const BASE_MODIFICATIONS_FILE: &str = "base_modifications.dss";
pub const THERMAL_UPGRADES_FILE: &str = "thermal_upgrades.dss";
pub const VOLTAGE_UPGRADES_FILE: &str = "voltage_upgrades.dss";
pub const UPGRADED_MASTER_FILE: &str = "upgraded_master.dss";

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Write `value` as pretty-printed JSON.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("writing JSON to '{}'", path.display()))?;
    writer
        .write_all(b"\n")
        .and_then(|_| writer.flush())
        .with_context(|| format!("flushing '{}'", path.display()))?;
    debug!(path = %path.display(), "wrote document");
    Ok(())
}

/// Write commands one per line.
pub fn write_script(path: &Path, commands: &[EditCommand]) -> Result<()> {
    ensure_parent(path)?;
    fs::write(path, render_script(commands))
        .with_context(|| format!("writing command script '{}'", path.display()))?;
    debug!(path = %path.display(), commands = commands.len(), "wrote command script");
    Ok(())
}

/// Files making up an upgraded circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedirectChain {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_modifications: Option<PathBuf>,
    pub thermal: PathBuf,
    pub voltage: PathBuf,
    pub master: PathBuf,
}

fn redirect_target(base: &Path, out_dir: &Path) -> String {
    match base.strip_prefix(out_dir) {
        Ok(relative) => relative.display().to_string(),
        Err(_) => base.display().to_string(),
    }
}

/// Write the stage scripts and a master file that redirects to the base
/// circuit and then to each script in order.
///
/// `prefix` holds edits that belong to the base circuit rather than to an
/// upgrade stage; its file is only written when it is non-empty.
pub fn write_redirect_chain(
    out_dir: &Path,
    base: &Path,
    prefix: &[EditCommand],
    thermal: &[EditCommand],
    voltage: &[EditCommand],
) -> Result<RedirectChain> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating output directory '{}'", out_dir.display()))?;

    let mut master = format!("Redirect {}\n", redirect_target(base, out_dir));
    let base_modifications = if prefix.is_empty() {
        None
    } else {
        let path = out_dir.join(BASE_MODIFICATIONS_FILE);
        write_script(&path, prefix)?;
        master.push_str(&format!("Redirect {}\n", BASE_MODIFICATIONS_FILE));
        Some(path)
    };

    let thermal_path = out_dir.join(THERMAL_UPGRADES_FILE);
    write_script(&thermal_path, thermal)?;
    let voltage_path = out_dir.join(VOLTAGE_UPGRADES_FILE);
    write_script(&voltage_path, voltage)?;
    master.push_str(&format!("Redirect {}\n", THERMAL_UPGRADES_FILE));
    master.push_str(&format!("Redirect {}\n", VOLTAGE_UPGRADES_FILE));

    let master_path = out_dir.join(UPGRADED_MASTER_FILE);
    fs::write(&master_path, master)
        .with_context(|| format!("writing '{}'", master_path.display()))?;

    Ok(RedirectChain {
        base_modifications,
        thermal: thermal_path,
        voltage: voltage_path,
        master: master_path,
    })
}
