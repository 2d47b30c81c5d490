//! Unit cost tables.
//!
//! Each table is matched on every deciding parameter of the equipment. When no
//! row matches exactly, the row nearest on one backup property (ampacity for
//! lines, kVA for transformers and regulators) is used and the match is
//! flagged as approximate.

use serde::{Deserialize, Serialize};
use upgrade_core::units::approx_eq;
use upgrade_core::{
    LineParameters, LinePlacement, RegControlSettings, TransformerParameters, UpgradeError,
    UpgradeResult,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineCostRow {
    #[serde(default)]
    pub description: String,
    pub phases: u32,
    pub voltage_kv: f64,
    pub ampere_rating: f64,
    #[serde(default)]
    pub line_placement: Option<LinePlacement>,
    pub cost_per_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerCostRow {
    #[serde(default)]
    pub description: String,
    pub phases: u32,
    pub primary_kv: f64,
    pub secondary_kv: f64,
    pub rated_kva: f64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Controller {
    Capacitor,
    Regulator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlChange {
    SettingChange,
    NewController,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlChangeCostRow {
    pub controller: Controller,
    pub change: ControlChange,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegulatorPlacement {
    InLine,
    Substation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulatorCostRow {
    pub placement: RegulatorPlacement,
    pub phases: u32,
    pub kv: f64,
    pub kva: f64,
    pub cost_usd: f64,
}

/// Flat add-on charged on top of a matched row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiscCostRow {
    pub description: String,
    pub cost_usd: f64,
}

/// Outcome of a table lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matched<'a, R> {
    pub row: &'a R,
    pub approximate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostCatalog {
    #[serde(default)]
    pub lines: Vec<LineCostRow>,
    #[serde(default)]
    pub transformers: Vec<TransformerCostRow>,
    #[serde(default)]
    pub control_changes: Vec<ControlChangeCostRow>,
    #[serde(default)]
    pub regulators: Vec<RegulatorCostRow>,
    #[serde(default)]
    pub misc: Vec<MiscCostRow>,
}

fn nearest<'a, R>(rows: &'a [R], target: f64, key: impl Fn(&R) -> f64) -> Option<&'a R> {
    rows.iter().min_by(|a, b| {
        (key(a) - target)
            .abs()
            .partial_cmp(&(key(b) - target).abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

fn lookup<'a, R>(
    table: &str,
    rows: &'a [R],
    exact: impl Fn(&R) -> bool,
    backup: f64,
    key: impl Fn(&R) -> f64,
) -> UpgradeResult<Matched<'a, R>> {
    if let Some(row) = rows.iter().find(|r| exact(r)) {
        return Ok(Matched {
            row,
            approximate: false,
        });
    }
    nearest(rows, backup, key)
        .map(|row| Matched {
            row,
            approximate: true,
        })
        .ok_or_else(|| UpgradeError::Catalog(format!("cost table '{}' is empty", table)))
}

impl CostCatalog {
    pub fn line(&self, params: &LineParameters) -> UpgradeResult<Matched<'_, LineCostRow>> {
        lookup(
            "lines",
            &self.lines,
            |r| {
                r.phases == params.phases
                    && approx_eq(r.voltage_kv, params.kv.value())
                    && approx_eq(r.ampere_rating, params.normamps.value())
                    && r.line_placement == params.line_placement
            },
            params.normamps.value(),
            |r| r.ampere_rating,
        )
    }

    pub fn transformer(
        &self,
        params: &TransformerParameters,
    ) -> UpgradeResult<Matched<'_, TransformerCostRow>> {
        let primary = params.kvs.first().map(|k| k.value()).unwrap_or_default();
        let secondary = params.kvs.get(1).map(|k| k.value()).unwrap_or(primary);
        let kva = params.rated_kva().value();
        lookup(
            "transformers",
            &self.transformers,
            |r| {
                r.phases == params.phases
                    && approx_eq(r.primary_kv, primary)
                    && approx_eq(r.secondary_kv, secondary)
                    && approx_eq(r.rated_kva, kva)
            },
            kva,
            |r| r.rated_kva,
        )
    }

    pub fn regulator(&self, settings: &RegControlSettings) -> UpgradeResult<Matched<'_, RegulatorCostRow>> {
        let placement = if settings.at_substation {
            RegulatorPlacement::Substation
        } else {
            RegulatorPlacement::InLine
        };
        let same_placement: Vec<&RegulatorCostRow> = self
            .regulators
            .iter()
            .filter(|r| r.placement == placement)
            .collect();
        if same_placement.is_empty() {
            return Err(UpgradeError::Catalog(format!(
                "no regulator cost rows for placement {:?}",
                placement
            )));
        }
        let phases = settings.phases;
        let kv = settings.kv.value();
        let kva = settings.kva.value();
        if let Some(row) = same_placement
            .iter()
            .copied()
            .find(|r| r.phases == phases && approx_eq(r.kv, kv) && approx_eq(r.kva, kva))
        {
            return Ok(Matched {
                row,
                approximate: false,
            });
        }
        let row = same_placement
            .into_iter()
            .min_by(|a, b| {
                (a.kva - kva)
                    .abs()
                    .partial_cmp(&(b.kva - kva).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| UpgradeError::Catalog("regulator cost table is empty".to_string()))?;
        Ok(Matched {
            row,
            approximate: true,
        })
    }

    pub fn control_change(
        &self,
        controller: Controller,
        change: ControlChange,
    ) -> UpgradeResult<&ControlChangeCostRow> {
        self.control_changes
            .iter()
            .find(|r| r.controller == controller && r.change == change)
            .ok_or_else(|| {
                UpgradeError::Catalog(format!(
                    "no control change cost for {:?} {:?}",
                    controller, change
                ))
            })
    }

    /// Flat add-on for `description`, zero when the misc table lacks it.
    pub fn misc(&self, description: &str) -> f64 {
        self.misc
            .iter()
            .filter(|r| r.description.eq_ignore_ascii_case(description))
            .map(|r| r.cost_usd)
            .sum()
    }
}
