//! Result documents.
//!
//! - [`UpgradeViolationResultModel`]: violation snapshot of the feeder before
//!   and after each upgrade category
//! - [`EquipmentDetail`]: one changed piece of equipment with its original
//!   and new parameters
//!
//! Field names are part of the output schema; orchestration tooling reads
//! them by name.

use serde::{Deserialize, Serialize};
use tracing::warn;
use upgrade_algo::detect::unevaluated_points;
use upgrade_algo::{
    detect_lines, detect_transformers, detect_voltages, ThermalUpgradeParams, UpgradeKind,
    VoltageUpgradeParams,
};
use upgrade_core::{
    ActionKind, EquipmentParameters, EquipmentType, OperatingPoint, SimulationSession,
    UpgradeAction, UpgradeResult, UpgradeType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStage {
    Initial,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeViolationResultModel {
    pub name: String,
    pub upgrade_type: UpgradeKind,
    pub stage: SummaryStage,
    pub simulation_time_s: f64,
    pub thermal_violations_present: bool,
    pub voltage_violations_present: bool,
    pub max_bus_voltage: f64,
    pub min_bus_voltage: f64,
    pub num_overvoltage_violation_buses: usize,
    pub num_undervoltage_violation_buses: usize,
    pub voltage_upper_limit: f64,
    pub voltage_lower_limit: f64,
    pub max_line_loading: f64,
    pub max_transformer_loading: f64,
    pub num_line_violations: usize,
    pub line_upper_limit: f64,
    pub num_transformer_violations: usize,
    pub transformer_upper_limit: f64,
    /// Operating points left out of every figure above because the solve
    /// did not converge. Counts are lower bounds while this is non-empty.
    pub non_converged_points: Vec<OperatingPoint>,
}

impl UpgradeViolationResultModel {
    /// Every operating point was evaluated and none shows a violation.
    pub fn is_clean(&self) -> bool {
        !self.thermal_violations_present
            && !self.voltage_violations_present
            && self.non_converged_points.is_empty()
    }
}

/// Detect every violation class on the live circuit.
///
/// Loading uses the thermal limits and multipliers, voltages use the final
/// voltage limits and voltage multipliers.
pub fn summarize<S: SimulationSession>(
    session: &mut S,
    name: &str,
    upgrade_type: UpgradeKind,
    stage: SummaryStage,
    thermal: &ThermalUpgradeParams,
    voltage: &VoltageUpgradeParams,
    simulation_time_s: f64,
) -> UpgradeResult<UpgradeViolationResultModel> {
    let loading_points = thermal.timepoint_multipliers.as_ref();
    let lines = detect_lines(session, thermal.line_upper_limit, loading_points, false)?;
    let xfmrs = detect_transformers(
        session,
        thermal.transformer_upper_limit,
        loading_points,
        false,
    )?;
    let voltages = detect_voltages(
        session,
        voltage.final_lower_limit,
        voltage.final_upper_limit,
        voltage.timepoint_multipliers.as_ref(),
        false,
    )?;
    let non_converged_points = unevaluated_points([
        lines.non_converged.as_slice(),
        xfmrs.non_converged.as_slice(),
        voltages.non_converged.as_slice(),
    ]);
    if !non_converged_points.is_empty() {
        warn!(
            feeder = name,
            stage = ?stage,
            points = ?non_converged_points,
            "summary excludes operating points that did not converge"
        );
    }

    Ok(UpgradeViolationResultModel {
        name: name.to_string(),
        upgrade_type,
        stage,
        simulation_time_s,
        thermal_violations_present: lines.violation_count() + xfmrs.violation_count() > 0,
        voltage_violations_present: voltages.violation_count() > 0,
        max_bus_voltage: voltages.max_voltage(),
        min_bus_voltage: voltages.min_voltage(),
        num_overvoltage_violation_buses: voltages.overvoltage.len(),
        num_undervoltage_violation_buses: voltages.undervoltage.len(),
        voltage_upper_limit: voltage.final_upper_limit,
        voltage_lower_limit: voltage.final_lower_limit,
        max_line_loading: lines.max_loading(),
        max_transformer_loading: xfmrs.max_loading(),
        num_line_violations: lines.violation_count(),
        line_upper_limit: thermal.line_upper_limit,
        num_transformer_violations: xfmrs.violation_count(),
        transformer_upper_limit: thermal.transformer_upper_limit,
        non_converged_points,
    })
}

/// One changed piece of equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentDetail {
    pub equipment_type: EquipmentType,
    pub upgrade_type: UpgradeType,
    pub original_equipment_name: String,
    pub final_equipment_name: String,
    /// Absent for equipment added by the run.
    pub original: Option<EquipmentParameters>,
    pub new: EquipmentParameters,
}

/// Pair each `add` action with the `remove` that precedes it for the same
/// equipment.
pub fn equipment_details(actions: &[UpgradeAction]) -> Vec<EquipmentDetail> {
    let mut details = Vec::new();
    for (idx, action) in actions.iter().enumerate() {
        if action.action != ActionKind::Add {
            continue;
        }
        let original = match action.upgrade_type {
            UpgradeType::Upgrade | UpgradeType::SettingChange => actions[..idx]
                .iter()
                .rev()
                .find(|a| {
                    a.action == ActionKind::Remove
                        && a.equipment_type == action.equipment_type
                        && a.upgrade_type == action.upgrade_type
                        && a.original_equipment_name == action.original_equipment_name
                })
                .map(|a| a.parameters.clone()),
            UpgradeType::NewParallel | UpgradeType::NewController => None,
        };
        details.push(EquipmentDetail {
            equipment_type: action.equipment_type,
            upgrade_type: action.upgrade_type,
            original_equipment_name: action.original_equipment_name.clone(),
            final_equipment_name: action.final_equipment_name.clone(),
            original,
            new: action.parameters.clone(),
        });
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use upgrade_algo::test_utils::TestFeeder;
    use upgrade_algo::{LoadMultipliers, TimepointMultipliers};
    use upgrade_core::{CapControlSettings, CapControlType};

    fn cap(on: f64) -> EquipmentParameters {
        EquipmentParameters::CapControl(CapControlSettings {
            capacitor: "c1".into(),
            control_type: CapControlType::Voltage,
            on_setting: on,
            off_setting: on + 2.0,
            pt_ratio: 60.0,
        })
    }

    #[test]
    fn test_details_pair_remove_and_add() {
        let actions = vec![
            UpgradeAction::remove(
                EquipmentType::CapControl,
                UpgradeType::SettingChange,
                "cc1",
                cap(118.0),
            ),
            UpgradeAction::add(
                EquipmentType::CapControl,
                UpgradeType::SettingChange,
                "cc1",
                "cc1",
                cap(119.0),
            ),
            UpgradeAction::add(
                EquipmentType::CapControl,
                UpgradeType::NewController,
                "c2",
                "c2_capcontrol",
                cap(117.0),
            ),
        ];
        let details = equipment_details(&actions);
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].original, Some(cap(118.0)));
        assert_eq!(details[0].new, cap(119.0));
        assert!(details[1].original.is_none());
    }

    #[test]
    fn test_summary_of_clean_feeder() {
        let mut feeder = TestFeeder::new("src")
            .with_line("l1", "src", "a", 100.0, 400.0)
            .with_load("a", 100.0);
        feeder.reload(&[]).unwrap();
        let summary = summarize(
            &mut feeder,
            "feeder",
            UpgradeKind::Thermal,
            SummaryStage::Initial,
            &ThermalUpgradeParams::default(),
            &VoltageUpgradeParams::default(),
            0.0,
        )
        .unwrap();
        assert!(!summary.thermal_violations_present);
        assert!(!summary.voltage_violations_present);
        assert!((summary.max_line_loading - 0.25).abs() < 1e-9);
        assert_eq!(summary.max_transformer_loading, 0.0);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["upgrade_type"], "thermal");
        assert_eq!(json["stage"], "initial");
        assert!(summary.is_clean());
    }

    #[test]
    fn test_summary_records_skipped_operating_points() {
        // l1 would sit at 1.3125 pu at the failing 1.5x point.
        let mut feeder = TestFeeder::new("src")
            .with_line("l1", "src", "a", 100.0, 400.0)
            .with_load("a", 350.0)
            .fail_at_multiplier(1.5);
        feeder.reload(&[]).unwrap();
        let multipliers = TimepointMultipliers {
            load_multipliers: LoadMultipliers {
                with_pv: vec![],
                without_pv: vec![1.0, 1.5],
            },
        };
        let thermal = ThermalUpgradeParams {
            timepoint_multipliers: Some(multipliers.clone()),
            ..ThermalUpgradeParams::default()
        };
        let voltage = VoltageUpgradeParams {
            timepoint_multipliers: Some(multipliers),
            ..VoltageUpgradeParams::default()
        };
        let summary = summarize(
            &mut feeder,
            "feeder",
            UpgradeKind::Thermal,
            SummaryStage::Initial,
            &thermal,
            &voltage,
            0.0,
        )
        .unwrap();

        assert!(!summary.thermal_violations_present);
        assert_eq!(
            summary.non_converged_points,
            vec![OperatingPoint::without_pv(1.5)]
        );
        assert!(!summary.is_clean());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["non_converged_points"][0]["load_multiplier"], 1.5);
        assert_eq!(json["non_converged_points"][0]["pv_enabled"], false);
    }
}
