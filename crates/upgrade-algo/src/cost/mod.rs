//! Cost computation.
//!
//! Every `add` action left after coalescing is priced once. Results are kept
//! per equipment, summed per cost type within each category (thermal,
//! voltage), and rolled into a grand total per cost type.

mod tables;

pub use tables::{
    ControlChange, ControlChangeCostRow, Controller, CostCatalog, LineCostRow, Matched,
    MiscCostRow, RegulatorCostRow, RegulatorPlacement, TransformerCostRow,
};

use crate::config::UpgradeKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use upgrade_core::{
    ActionKind, EquipmentParameters, EquipmentType, UpgradeAction, UpgradeError, UpgradeResult,
    UpgradeType,
};

/// Label a priced action is aggregated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CostType {
    #[serde(rename = "New Line")]
    NewLine,
    #[serde(rename = "Upgraded Line")]
    UpgradedLine,
    #[serde(rename = "New Transformer")]
    NewTransformer,
    #[serde(rename = "Upgraded Transformer")]
    UpgradedTransformer,
    #[serde(rename = "New Capacitor Controller")]
    NewCapacitorController,
    #[serde(rename = "Capacitor Setting Changes")]
    CapacitorSettingChange,
    #[serde(rename = "New In-Line Regulator")]
    NewInLineRegulator,
    #[serde(rename = "New Substation LTC")]
    NewSubstationLtc,
    #[serde(rename = "Regulator Setting Changes")]
    RegulatorSettingChange,
}

impl CostType {
    pub fn of(action: &UpgradeAction) -> Option<CostType> {
        use EquipmentType as E;
        use UpgradeType as U;
        Some(match (action.equipment_type, action.upgrade_type) {
            (E::Line, U::NewParallel) => CostType::NewLine,
            (E::Line, U::Upgrade) => CostType::UpgradedLine,
            (E::Transformer, U::NewParallel) => CostType::NewTransformer,
            (E::Transformer, U::Upgrade) => CostType::UpgradedTransformer,
            (E::CapControl, U::NewController) => CostType::NewCapacitorController,
            (E::CapControl, U::SettingChange) => CostType::CapacitorSettingChange,
            (E::RegControl, U::NewController) => match &action.parameters {
                EquipmentParameters::RegControl(s) if s.at_substation => {
                    CostType::NewSubstationLtc
                }
                _ => CostType::NewInLineRegulator,
            },
            (E::RegControl, U::SettingChange) => CostType::RegulatorSettingChange,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CostType::NewLine => "New Line",
            CostType::UpgradedLine => "Upgraded Line",
            CostType::NewTransformer => "New Transformer",
            CostType::UpgradedTransformer => "Upgraded Transformer",
            CostType::NewCapacitorController => "New Capacitor Controller",
            CostType::CapacitorSettingChange => "Capacitor Setting Changes",
            CostType::NewInLineRegulator => "New In-Line Regulator",
            CostType::NewSubstationLtc => "New Substation LTC",
            CostType::RegulatorSettingChange => "Regulator Setting Changes",
        }
    }
}

/// Cost of one added or changed piece of equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentCost {
    pub category: UpgradeKind,
    pub cost_type: CostType,
    pub equipment_type: EquipmentType,
    pub original_equipment_name: String,
    pub final_equipment_name: String,
    /// Units priced by this record; one per `add` action.
    pub count: usize,
    pub total_cost_usd: f64,
    /// The priced configuration.
    pub equipment_parameters: EquipmentParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTotal {
    #[serde(rename = "type")]
    pub cost_type: CostType,
    pub count: usize,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    pub equipment: Vec<EquipmentCost>,
    pub thermal: Vec<CostTotal>,
    pub voltage: Vec<CostTotal>,
    pub total: Vec<CostTotal>,
    pub total_cost_usd: f64,
}

fn approximation_note(approximate: bool, what: &str, value: f64) -> Option<String> {
    approximate.then(|| {
        format!(
            "no exact catalog match, priced with the nearest {} to {}",
            what, value
        )
    })
}

fn misc_key(action: &UpgradeAction) -> Option<&'static str> {
    match (action.equipment_type, action.upgrade_type) {
        (EquipmentType::Transformer, UpgradeType::Upgrade) => Some("replace_transformer"),
        (EquipmentType::Transformer, UpgradeType::NewParallel) => Some("add_new_transformer"),
        (EquipmentType::Line, UpgradeType::Upgrade) => Some("replace_line"),
        (EquipmentType::Line, UpgradeType::NewParallel) => Some("add_new_line"),
        _ => None,
    }
}

/// Price one `add` action.
pub fn price_action(
    action: &UpgradeAction,
    catalog: &CostCatalog,
) -> UpgradeResult<(f64, Option<String>)> {
    let misc = misc_key(action).map(|k| catalog.misc(k)).unwrap_or(0.0);
    let (cost, comment) = match &action.parameters {
        EquipmentParameters::Line(params) => {
            let matched = catalog.line(params)?;
            (
                matched.row.cost_per_m * params.length.value(),
                approximation_note(matched.approximate, "ampere rating", params.normamps.value()),
            )
        }
        EquipmentParameters::Transformer(params) => {
            let matched = catalog.transformer(params)?;
            (
                matched.row.cost_usd,
                approximation_note(matched.approximate, "kVA", params.rated_kva().value()),
            )
        }
        EquipmentParameters::CapControl(_) => {
            let change = match action.upgrade_type {
                UpgradeType::NewController => ControlChange::NewController,
                _ => ControlChange::SettingChange,
            };
            (
                catalog.control_change(Controller::Capacitor, change)?.cost_usd,
                None,
            )
        }
        EquipmentParameters::RegControl(settings) => match action.upgrade_type {
            UpgradeType::NewController => {
                let matched = catalog.regulator(settings)?;
                (
                    matched.row.cost_usd,
                    approximation_note(matched.approximate, "kVA", settings.kva.value()),
                )
            }
            _ => (
                catalog
                    .control_change(Controller::Regulator, ControlChange::SettingChange)?
                    .cost_usd,
                None,
            ),
        },
    };
    Ok((cost + misc, comment))
}

fn totals(equipment: &[EquipmentCost], category: Option<UpgradeKind>) -> Vec<CostTotal> {
    let mut grouped: BTreeMap<CostType, (usize, f64)> = BTreeMap::new();
    for item in equipment
        .iter()
        .filter(|e| category.map_or(true, |c| e.category == c))
    {
        let entry = grouped.entry(item.cost_type).or_insert((0, 0.0));
        entry.0 += item.count;
        entry.1 += item.total_cost_usd;
    }
    grouped
        .into_iter()
        .filter(|(_, (count, _))| *count > 0)
        .map(|(cost_type, (count, total_cost_usd))| CostTotal {
            cost_type,
            count,
            total_cost_usd,
        })
        .collect()
}

/// Price the coalesced actions of each category.
pub fn compute_costs(
    thermal: &[UpgradeAction],
    voltage: &[UpgradeAction],
    catalog: &CostCatalog,
) -> UpgradeResult<CostReport> {
    let mut equipment = Vec::new();
    for (category, actions) in [(UpgradeKind::Thermal, thermal), (UpgradeKind::Voltage, voltage)] {
        for action in actions.iter().filter(|a| a.action == ActionKind::Add) {
            let Some(cost_type) = CostType::of(action) else {
                return Err(UpgradeError::Catalog(format!(
                    "no cost type for {} {:?}",
                    action.equipment_type.as_str(),
                    action.upgrade_type
                )));
            };
            let (total_cost_usd, comment) = price_action(action, catalog)?;
            if let Some(note) = &comment {
                warn!(equipment = %action.final_equipment_name, "{}", note);
            }
            debug!(
                category = category.as_str(),
                cost_type = cost_type.as_str(),
                equipment = %action.final_equipment_name,
                total_cost_usd,
                "priced action"
            );
            equipment.push(EquipmentCost {
                category,
                cost_type,
                equipment_type: action.equipment_type,
                original_equipment_name: action.original_equipment_name.clone(),
                final_equipment_name: action.final_equipment_name.clone(),
                count: 1,
                total_cost_usd,
                equipment_parameters: action.parameters.clone(),
                comment,
            });
        }
    }

    let total_cost_usd = equipment.iter().map(|e| e.total_cost_usd).sum();
    Ok(CostReport {
        thermal: totals(&equipment, Some(UpgradeKind::Thermal)),
        voltage: totals(&equipment, Some(UpgradeKind::Voltage)),
        total: totals(&equipment, None),
        equipment,
        total_cost_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use upgrade_core::{
        Amperes, CapControlSettings, CapControlType, KilovoltAmperes, Kilovolts, LineParameters,
        Meters, RegControlSettings, TransformerParameters, Volts,
    };

    fn catalog() -> CostCatalog {
        CostCatalog {
            lines: vec![LineCostRow {
                description: "336 ACSR".into(),
                phases: 3,
                voltage_kv: 12.47,
                ampere_rating: 600.0,
                line_placement: None,
                cost_per_m: 80.0,
            }],
            transformers: vec![TransformerCostRow {
                description: "750 kVA pad".into(),
                phases: 3,
                primary_kv: 12.47,
                secondary_kv: 0.48,
                rated_kva: 750.0,
                cost_usd: 40_000.0,
            }],
            control_changes: vec![
                ControlChangeCostRow {
                    controller: Controller::Capacitor,
                    change: ControlChange::SettingChange,
                    cost_usd: 500.0,
                },
                ControlChangeCostRow {
                    controller: Controller::Regulator,
                    change: ControlChange::SettingChange,
                    cost_usd: 750.0,
                },
            ],
            regulators: vec![RegulatorCostRow {
                placement: RegulatorPlacement::InLine,
                phases: 3,
                kv: 12.47,
                kva: 8000.0,
                cost_usd: 90_000.0,
            }],
            misc: vec![MiscCostRow {
                description: "replace_transformer".into(),
                cost_usd: 2_500.0,
            }],
        }
    }

    fn transformer_upgrade() -> UpgradeAction {
        UpgradeAction::add(
            EquipmentType::Transformer,
            UpgradeType::Upgrade,
            "t1",
            "t1",
            EquipmentParameters::Transformer(TransformerParameters {
                phases: 3,
                windings: 2,
                conns: vec![],
                kvs: vec![Kilovolts(12.47), Kilovolts(0.48)],
                kvas: vec![KilovoltAmperes(750.0), KilovoltAmperes(750.0)],
            }),
        )
    }

    fn parallel_line() -> UpgradeAction {
        UpgradeAction::add(
            EquipmentType::Line,
            UpgradeType::NewParallel,
            "l1",
            "l1_upgrade_x_1",
            EquipmentParameters::Line(LineParameters {
                phases: 3,
                kv: Kilovolts(12.47),
                normamps: Amperes(600.0),
                emergamps: Amperes(900.0),
                length: Meters(250.0),
                linecode: None,
                geometry: None,
                line_placement: None,
                is_switch: false,
            }),
        )
    }

    fn cap_setting() -> UpgradeAction {
        UpgradeAction::add(
            EquipmentType::CapControl,
            UpgradeType::SettingChange,
            "cc1",
            "cc1",
            EquipmentParameters::CapControl(CapControlSettings {
                capacitor: "c1".into(),
                control_type: CapControlType::Voltage,
                on_setting: 119.0,
                off_setting: 121.0,
                pt_ratio: 60.0,
            }),
        )
    }

    fn new_regulator(kva: f64) -> UpgradeAction {
        UpgradeAction::add(
            EquipmentType::RegControl,
            UpgradeType::NewController,
            "b",
            "newreg_b",
            EquipmentParameters::RegControl(RegControlSettings {
                transformer: "newreg_xfmr_b".into(),
                vreg: Volts(120.0),
                band: Volts(1.0),
                pt_ratio: 60.0,
                phases: 3,
                kv: Kilovolts(12.47),
                kva: KilovoltAmperes(kva),
                at_substation: false,
                new_transformer: None,
            }),
        )
    }

    #[test]
    fn test_prices_with_misc_add_on() {
        let report = compute_costs(&[transformer_upgrade()], &[], &catalog()).unwrap();
        assert_eq!(report.equipment.len(), 1);
        assert_eq!(report.equipment[0].total_cost_usd, 42_500.0);
        assert_eq!(report.thermal.len(), 1);
        assert_eq!(report.thermal[0].cost_type, CostType::UpgradedTransformer);
        assert_eq!(report.thermal[0].count, 1);
        assert!(report.voltage.is_empty());
    }

    #[test]
    fn test_totals_conserve_equipment_costs() {
        let report = compute_costs(
            &[transformer_upgrade(), parallel_line()],
            &[cap_setting(), new_regulator(8639.0)],
            &catalog(),
        )
        .unwrap();
        let per_equipment: f64 = report.equipment.iter().map(|e| e.total_cost_usd).sum();
        let per_type: f64 = report.total.iter().map(|t| t.total_cost_usd).sum();
        assert!((per_equipment - report.total_cost_usd).abs() < 1e-6);
        assert!((per_type - report.total_cost_usd).abs() < 1e-6);
        assert_eq!(report.equipment.len(), 4);
        assert_eq!(report.equipment[1].total_cost_usd, 80.0 * 250.0);
        // 8639 kVA has no exact row; priced from the nearest.
        assert!(report.equipment[3].comment.is_some());
    }

    #[test]
    fn test_remove_actions_are_not_priced() {
        let remove = UpgradeAction::remove(
            EquipmentType::Line,
            UpgradeType::Upgrade,
            "l1",
            EquipmentParameters::Line(LineParameters {
                phases: 3,
                kv: Kilovolts(12.47),
                normamps: Amperes(400.0),
                emergamps: Amperes(600.0),
                length: Meters(100.0),
                linecode: None,
                geometry: None,
                line_placement: None,
                is_switch: false,
            }),
        );
        let report = compute_costs(&[remove], &[], &CostCatalog::default()).unwrap();
        assert!(report.equipment.is_empty());
        assert_eq!(report.total_cost_usd, 0.0);
    }

    #[test]
    fn test_missing_control_change_row_is_catalog_error() {
        let err = compute_costs(&[], &[cap_setting()], &CostCatalog::default()).unwrap_err();
        assert!(err.is_catalog());
    }

    #[test]
    fn test_records_carry_priced_parameters() {
        let report = compute_costs(&[parallel_line()], &[], &catalog()).unwrap();
        let record = &report.equipment[0];
        assert_eq!(record.count, 1);
        assert_eq!(record.equipment_parameters, parallel_line().parameters);

        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json["equipment_parameters"]["equipment"], "line");
        assert_eq!(json["equipment_parameters"]["normamps"], 600.0);
    }

    #[test]
    fn test_regulator_priced_by_controlled_phase_count() {
        let row = |phases: u32, cost_usd: f64| RegulatorCostRow {
            placement: RegulatorPlacement::InLine,
            phases,
            kv: 12.47,
            kva: 8000.0,
            cost_usd,
        };
        let catalog = CostCatalog {
            regulators: vec![row(3, 90_000.0), row(1, 30_000.0)],
            ..CostCatalog::default()
        };
        let mut single_phase = new_regulator(8000.0);
        if let EquipmentParameters::RegControl(settings) = &mut single_phase.parameters {
            settings.phases = 1;
        }
        let report = compute_costs(&[], &[single_phase], &catalog).unwrap();
        assert_eq!(report.equipment[0].total_cost_usd, 30_000.0);
        assert!(report.equipment[0].comment.is_none());
    }

    #[test]
    fn test_cost_type_labels_serialize() {
        let json = serde_json::to_string(&CostType::NewInLineRegulator).unwrap();
        assert_eq!(json, "\"New In-Line Regulator\"");
    }
}
