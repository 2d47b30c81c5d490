//! Substation load tap changer.
//!
//! Makes sure the substation has a transformer with a regulator controller,
//! sweeps that controller, then re-runs the downstream regulator and
//! capacitor stages against the new voltage profile.

use super::capacitors::run_capacitor_stage;
use super::regulators::{
    correct_pt_ratios, run_existing_regulator_stage, sweep_with_retry, RegulatorSelection,
    SweepOutcome,
};
use super::{is_substation_regulator, regulated_kv, rename_bus, RegulatorInsertion};
use crate::config::VoltageUpgradeParams;
use tracing::{info, warn};
use upgrade_core::{
    bus_name, ActionLog, EditCommand, ElementClass, EquipmentParameters, EquipmentType,
    LineRecord, RegControlRecord, SimulationSession, UpgradeAction, UpgradeResult, UpgradeType, Volts,
};

pub const LTC_TRANSFORMER: &str = "ltc_xfmr";
pub const LTC_CONTROLLER: &str = "ltc_reg";

fn first_band(params: &VoltageUpgradeParams) -> Volts {
    Volts(params.reg_control_bands.first().copied().unwrap_or(2.0))
}

/// Line leaving the source bus that the new substation transformer feeds.
fn source_line<'a>(lines: &'a [LineRecord], source: &str) -> Option<(&'a LineRecord, u32)> {
    let mut candidates: Vec<(&LineRecord, u32)> = lines
        .iter()
        .filter(|l| l.enabled)
        .filter_map(|l| l.terminal_at(source).map(|t| (l, t)))
        .collect();
    candidates.sort_by(|a, b| a.0.name.cmp(&b.0.name));
    candidates.into_iter().next()
}

/// Commands and action that give the substation a regulated transformer.
/// Empty when one already exists.
fn ensure_ltc<S: SimulationSession>(
    session: &S,
    params: &VoltageUpgradeParams,
) -> Option<(Vec<EditCommand>, UpgradeAction)> {
    let transformers = session.transformers();
    let source = bus_name(&session.source_bus());
    let controls = session.reg_controls();

    let substation = transformers
        .iter()
        .filter(|t| t.enabled && t.connects(&source))
        .min_by(|a, b| a.name.cmp(&b.name));

    match substation {
        Some(xfmr) => {
            if controls
                .iter()
                .any(|rc| rc.enabled && is_substation_regulator(rc, &transformers, &source))
            {
                return None;
            }
            let controller = format!("{}_ltc", xfmr.name);
            let draft = RegControlRecord {
                name: controller.clone(),
                transformer: xfmr.name.clone(),
                winding: 2,
                vreg: params.nominal_volts(),
                band: first_band(params),
                pt_ratio: 0.0,
                enabled: true,
            };
            let insertion = RegulatorInsertion {
                transformer: &xfmr.name,
                controller: &controller,
                from_bus: "",
                to_bus: "",
                phases: xfmr.phases,
                kv: regulated_kv(&draft, xfmr),
                kva: xfmr.rated_kva(),
                vreg: params.nominal_volts(),
                band: first_band(params),
                nominal: params.nominal_volts(),
            };
            info!(transformer = %xfmr.name, controller = %controller, "adding substation LTC controller");
            let action = UpgradeAction::add(
                EquipmentType::RegControl,
                UpgradeType::NewController,
                &xfmr.name,
                &controller,
                EquipmentParameters::RegControl(insertion.settings(true, false)),
            );
            Some((vec![insertion.controller_command()], action))
        }
        None => {
            let lines = session.lines();
            let Some((line, terminal)) = source_line(&lines, &source) else {
                warn!(source = %source, "no line leaves the source bus, cannot place substation LTC");
                return None;
            };
            let ltc_bus = format!("{}_ltc", source);
            let terminal_bus = if terminal == 1 { &line.bus1 } else { &line.bus2 };
            let insertion = RegulatorInsertion {
                transformer: LTC_TRANSFORMER,
                controller: LTC_CONTROLLER,
                from_bus: &source,
                to_bus: &ltc_bus,
                phases: line.phases,
                kv: line.kv,
                kva: line.normamps.apparent_power(line.kv, line.phases),
                vreg: params.nominal_volts(),
                band: first_band(params),
                nominal: params.nominal_volts(),
            };
            info!(line = %line.name, bus = %ltc_bus, "synthesizing substation transformer and LTC");
            let mut commands = vec![EditCommand::edit(ElementClass::Line, &line.name)
                .with(&format!("bus{}", terminal), rename_bus(terminal_bus, &ltc_bus))];
            commands.extend(insertion.commands());
            let action = UpgradeAction::add(
                EquipmentType::RegControl,
                UpgradeType::NewController,
                &source,
                LTC_CONTROLLER,
                EquipmentParameters::RegControl(insertion.settings(true, true)),
            );
            Some((commands, action))
        }
    }
}

/// Place or reuse the substation LTC and tune everything downstream of it.
pub fn run_ltc_stage<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    log: &mut ActionLog,
) -> UpgradeResult<()> {
    if let Some((commands, action)) = ensure_ltc(session, params) {
        session.apply(&commands)?;
        log.extend_commands(commands);
        log.record(action);
    }

    correct_pt_ratios(session, params, log, RegulatorSelection::OnlyLtc)?;
    match sweep_with_retry(session, params, log, RegulatorSelection::OnlyLtc)? {
        SweepOutcome::NothingToSweep => {
            info!("no substation LTC to sweep");
            session.reload(log.commands())?;
            return Ok(());
        }
        SweepOutcome::Improved(severity) => {
            info!(severity = severity.deviation, "substation LTC settings changed")
        }
        SweepOutcome::Unchanged | SweepOutcome::ControlLimit => {}
    }

    run_existing_regulator_stage(session, params, log)?;
    if params.capacitor_action_flag {
        run_capacitor_stage(session, params, log)?;
    }
    Ok(())
}
