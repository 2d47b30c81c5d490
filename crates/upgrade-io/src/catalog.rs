//! Catalog files.
//!
//! A technical catalog is one JSON document. A cost catalog is either a JSON
//! document or a directory of CSV tables:
//!
//! | File | Rows |
//! |------|------|
//! | `lines.csv` | [`LineCostRow`] |
//! | `transformers.csv` | [`TransformerCostRow`] |
//! | `control_changes.csv` | [`ControlChangeCostRow`] |
//! | `voltage_regulators.csv` | [`RegulatorCostRow`] |
//! | `misc.csv` | [`MiscCostRow`] |
//!
//! A missing CSV file leaves that table empty; pricing an action that needs
//! it then fails with a catalog error.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::path::Path;
use tracing::{debug, warn};
use upgrade_algo::cost::{
    ControlChangeCostRow, CostCatalog, LineCostRow, MiscCostRow, RegulatorCostRow,
    TransformerCostRow,
};
use upgrade_algo::TechnicalCatalog;

pub fn load_technical_catalog(path: &Path) -> Result<TechnicalCatalog> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading technical catalog '{}'", path.display()))?;
    let catalog: TechnicalCatalog = serde_json::from_str(&data)
        .with_context(|| format!("parsing technical catalog '{}'", path.display()))?;
    debug!(
        line_options = catalog.line_options.len(),
        transformer_options = catalog.transformer_options.len(),
        "loaded technical catalog"
    );
    Ok(catalog)
}

fn read_table<R: DeserializeOwned>(dir: &Path, file_name: &str) -> Result<Vec<R>> {
    let path = dir.join(file_name);
    if !path.exists() {
        warn!(path = %path.display(), "cost table not found, leaving it empty");
        return Ok(Vec::new());
    }
    let file =
        File::open(&path).with_context(|| format!("opening cost table '{}'", path.display()))?;
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
    let mut rows = Vec::new();
    for (i, result) in reader.deserialize().enumerate() {
        let row: R = result
            .with_context(|| format!("parsing row {} of '{}'", i + 1, path.display()))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Load a cost catalog from a CSV directory or a JSON file.
pub fn load_cost_catalog(path: &Path) -> Result<CostCatalog> {
    let catalog = if path.is_dir() {
        CostCatalog {
            lines: read_table::<LineCostRow>(path, "lines.csv")?,
            transformers: read_table::<TransformerCostRow>(path, "transformers.csv")?,
            control_changes: read_table::<ControlChangeCostRow>(path, "control_changes.csv")?,
            regulators: read_table::<RegulatorCostRow>(path, "voltage_regulators.csv")?,
            misc: read_table::<MiscCostRow>(path, "misc.csv")?,
        }
    } else {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading cost catalog '{}'", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing cost catalog '{}'", path.display()))?
    };
    debug!(
        lines = catalog.lines.len(),
        transformers = catalog.transformers.len(),
        control_changes = catalog.control_changes.len(),
        regulators = catalog.regulators.len(),
        "loaded cost catalog"
    );
    Ok(catalog)
}
