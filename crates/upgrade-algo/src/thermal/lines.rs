use super::{line_conductor, line_parameters, NameGenerator};
use crate::catalog::{Conductor, LineOption, TechnicalCatalog};
use crate::config::ThermalUpgradeParams;
use crate::detect::Detection;
use std::collections::HashSet;
use tracing::debug;
use upgrade_core::{
    ActionLog, Amperes, EditCommand, ElementClass, EquipmentParameters, EquipmentType,
    LineParameters, LineRecord, UpgradeAction, UpgradeError, UpgradeResult, UpgradeType,
};

/// Ampacity the replacement must carry.
fn required_ampacity(line: &LineRecord, params: &ThermalUpgradeParams) -> Amperes {
    let loading = line.per_unit_loading();
    let mut required = line.max_amp_loading / params.line_design_pu;
    if loading > params.extreme_loading_threshold {
        required = required * (loading * 0.5);
    }
    required
}

fn option_parameters(line: &LineRecord, option: &LineOption) -> LineParameters {
    let (linecode, geometry) = match &option.conductor {
        Conductor::LineCode(name) => (Some(name.clone()), None),
        Conductor::Geometry(name) => (None, Some(name.clone())),
    };
    LineParameters {
        normamps: option.normamps,
        emergamps: option.emergamps,
        linecode,
        geometry,
        line_placement: option.line_placement.or(line.line_placement),
        ..line_parameters(line)
    }
}

fn conductor_assignment(cmd: EditCommand, conductor: Option<&Conductor>) -> EditCommand {
    match conductor {
        Some(conductor) => {
            let (key, value) = conductor.property();
            cmd.with(key, value)
        }
        None => cmd,
    }
}

/// Plan edits for every overloaded line in `detection`.
///
/// Actions are recorded in `log`; the returned commands still have to be
/// applied and appended by the caller.
pub fn plan_line_upgrades(
    detection: &Detection<LineRecord>,
    params: &ThermalUpgradeParams,
    catalog: &TechnicalCatalog,
    defined: &mut HashSet<String>,
    names: &mut NameGenerator,
    log: &mut ActionLog,
) -> UpgradeResult<Vec<EditCommand>> {
    let mut commands = Vec::new();
    for name in &detection.violated {
        let Some(line) = detection.get(name) else {
            continue;
        };
        let required = required_ampacity(line, params);
        let ceiling = required * params.oversize_limit;
        let candidates = catalog.line_candidates(line);
        let current = line_conductor(line);

        let fitting = candidates
            .iter()
            .find(|o| o.normamps >= required)
            .filter(|o| o.normamps <= ceiling)
            .filter(|o| Some(&o.conductor) != current.as_ref());

        if let Some(option) = fitting {
            debug!(
                line = %line.name,
                required = required.value(),
                option = option.conductor.name(),
                "upgrading line in place"
            );
            commands.extend(catalog.definition_commands(&option.conductor, defined)?);
            let (key, value) = option.conductor.property();
            commands.push(
                EditCommand::edit(ElementClass::Line, &line.name)
                    .with(key, value)
                    .with("normamps", option.normamps.value())
                    .with("emergamps", option.emergamps.value()),
            );
            log.record(UpgradeAction::remove(
                EquipmentType::Line,
                UpgradeType::Upgrade,
                &line.name,
                EquipmentParameters::Line(line_parameters(line)),
            ));
            log.record(UpgradeAction::add(
                EquipmentType::Line,
                UpgradeType::Upgrade,
                &line.name,
                &line.name,
                EquipmentParameters::Line(option_parameters(line, option)),
            ));
            continue;
        }

        // Parallel units: the largest option that is not oversized, or a
        // copy of the existing line when the group has none.
        let unit = candidates.iter().rev().find(|o| o.normamps <= ceiling);
        let (unit_amps, unit_emergamps, unit_conductor, unit_params) = match unit {
            Some(option) => (
                option.normamps,
                option.emergamps,
                Some(option.conductor.clone()),
                option_parameters(line, option),
            ),
            None => (
                line.normamps,
                line.emergamps,
                current.clone(),
                line_parameters(line),
            ),
        };
        if unit_amps.value() <= 0.0 {
            return Err(UpgradeError::Catalog(format!(
                "no usable parallel conductor for line '{}'",
                line.name
            )));
        }
        let shortfall = (required - line.normamps).value().max(0.0);
        let count = ((shortfall / unit_amps.value()).ceil() as usize).max(1);
        if count > params.parallel_lines_limit {
            return Err(UpgradeError::CapacityLimit {
                equipment: format!("Line.{}", line.name),
                required: count,
                limit: params.parallel_lines_limit,
            });
        }
        debug!(
            line = %line.name,
            required = required.value(),
            count,
            "adding parallel lines"
        );
        if let Some(conductor) = &unit_conductor {
            commands.extend(catalog.definition_commands(conductor, defined)?);
        }
        for _ in 0..count {
            let new_name = names.next(&line.name);
            let cmd = EditCommand::create(ElementClass::Line, &new_name)
                .with("bus1", &line.bus1)
                .with("bus2", &line.bus2)
                .with("phases", line.phases)
                .with("length", line.length)
                .with("units", line.length_units.as_str());
            let cmd = conductor_assignment(cmd, unit_conductor.as_ref())
                .with("normamps", unit_amps.value())
                .with("emergamps", unit_emergamps.value());
            commands.push(cmd);
            log.record(UpgradeAction::add(
                EquipmentType::Line,
                UpgradeType::NewParallel,
                &line.name,
                new_name,
                EquipmentParameters::Line(unit_params.clone()),
            ));
        }
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::detect_lines;
    use crate::test_utils::TestFeeder;
    use upgrade_core::{ActionKind, LineCodeRecord, SimulationSession};

    fn code(name: &str, amps: f64) -> LineCodeRecord {
        LineCodeRecord {
            name: name.into(),
            phases: 3,
            normamps: Amperes(amps),
            emergamps: Amperes(amps * 1.5),
            units: upgrade_core::LengthUnit::M,
            properties: Default::default(),
        }
    }

    fn catalog(amps: &[f64]) -> TechnicalCatalog {
        TechnicalCatalog {
            line_options: amps
                .iter()
                .map(|&a| LineOption {
                    conductor: Conductor::LineCode(format!("lc_{}", a)),
                    phases: 3,
                    kv: upgrade_core::Kilovolts(12.47),
                    normamps: Amperes(a),
                    emergamps: Amperes(a * 1.5),
                    line_placement: None,
                    is_switch: false,
                })
                .collect(),
            line_codes: amps.iter().map(|&a| code(&format!("lc_{}", a), a)).collect(),
            ..TechnicalCatalog::default()
        }
    }

    fn overloaded(load: f64) -> (TestFeeder, Detection<LineRecord>) {
        let mut feeder = TestFeeder::new("src")
            .with_line("l1", "src", "a", 100.0, 400.0)
            .with_load("a", load);
        feeder.reload(&[]).unwrap();
        let detection = detect_lines(&mut feeder, 1.0, None, true).unwrap();
        (feeder, detection)
    }

    fn params() -> ThermalUpgradeParams {
        ThermalUpgradeParams {
            line_design_pu: 1.0,
            ..ThermalUpgradeParams::default()
        }
    }

    #[test]
    fn test_in_place_upgrade_picks_smallest_fitting_option() {
        let (_, detection) = overloaded(500.0);
        let mut log = ActionLog::new();
        let mut defined = HashSet::new();
        let commands = plan_line_upgrades(
            &detection,
            &params(),
            &catalog(&[300.0, 600.0, 900.0]),
            &mut defined,
            &mut NameGenerator::with_stamp("t"),
            &mut log,
        )
        .unwrap();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].to_string().starts_with("New LineCode.lc_600"));
        assert_eq!(
            commands[1].to_string(),
            "Edit Line.l1 linecode=lc_600 normamps=600 emergamps=900"
        );
        let actions = log.actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action, ActionKind::Remove);
        assert_eq!(actions[1].original_equipment_name, "l1");
    }

    #[test]
    fn test_oversized_option_falls_back_to_parallel() {
        // Required 500 A, only a 1200 A option (> 2x) and a 300 A option.
        let (_, detection) = overloaded(500.0);
        let mut log = ActionLog::new();
        let commands = plan_line_upgrades(
            &detection,
            &params(),
            &catalog(&[300.0, 1200.0]),
            &mut HashSet::new(),
            &mut NameGenerator::with_stamp("t"),
            &mut log,
        )
        .unwrap();
        // (500 - 400) / 300 rounds up to one unit.
        let new_lines: Vec<_> = commands
            .iter()
            .filter(|c| c.element.class == ElementClass::Line)
            .collect();
        assert_eq!(new_lines.len(), 1);
        assert_eq!(new_lines[0].element.name, "l1_upgrade_t_1");
        assert_eq!(new_lines[0].property("linecode"), Some("lc_300"));
        assert_eq!(log.actions()[0].upgrade_type, UpgradeType::NewParallel);
    }

    #[test]
    fn test_empty_group_duplicates_existing_line() {
        let (_, detection) = overloaded(900.0);
        let mut log = ActionLog::new();
        let commands = plan_line_upgrades(
            &detection,
            &params(),
            &TechnicalCatalog::default(),
            &mut HashSet::new(),
            &mut NameGenerator::with_stamp("t"),
            &mut log,
        )
        .unwrap();
        // (900 - 400) / 400 -> 2 copies.
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].property("normamps"), Some("400"));
    }

    #[test]
    fn test_parallel_limit_is_fatal() {
        let (_, detection) = overloaded(3000.0);
        let err = plan_line_upgrades(
            &detection,
            &ThermalUpgradeParams {
                extreme_loading_threshold: 100.0,
                ..params()
            },
            &TechnicalCatalog::default(),
            &mut HashSet::new(),
            &mut NameGenerator::with_stamp("t"),
            &mut ActionLog::new(),
        )
        .unwrap_err();
        assert!(err.is_capacity_limit());
    }

    #[test]
    fn test_extreme_loading_inflates_requirement() {
        let line = LineRecord {
            normamps: Amperes(100.0),
            max_amp_loading: Amperes(300.0),
            ..LineRecord::default()
        };
        let required = required_ampacity(&line, &params());
        // 300 A at 3.0 pu: 300 * 3.0 * 0.5
        assert!((required.value() - 450.0).abs() < 1e-9);
    }
}
