//! Regulator setting sweeps.
//!
//! A sweep tries every `(vreg, band)` pair on a grid, applied to all selected
//! regulators at once, and keeps the lowest-severity pair when it strictly
//! beats the current settings.
//!
//! Narrow bands can keep the solver's control loop from settling. When a
//! sweep cannot evaluate any grid point for that reason, [`sweep_with_retry`]
//! walks a fixed list of fallback strategies with wider bands and a higher
//! control-iteration cap before giving up with a convergence error.

use super::{
    controlled_transformer, evaluate, is_substation_regulator, reg_settings, regulated_kv, UNSOLVED,
};
use crate::config::VoltageUpgradeParams;
use crate::severity::Severity;
use tracing::{debug, info, warn};
use upgrade_core::{
    ActionLog, EditCommand, ElementClass, EquipmentParameters, EquipmentType, RegControlRecord,
    RegControlSettings, SimulationSession, SolveStatus, TransformerRecord, UpgradeAction,
    UpgradeError, UpgradeResult, UpgradeType, Volts,
};

const PT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegulatorSelection {
    /// Every regulator except the one on the substation transformer.
    ExcludeLtc,
    /// Only the substation regulator.
    OnlyLtc,
}

impl RegulatorSelection {
    fn includes(
        &self,
        control: &RegControlRecord,
        transformers: &[TransformerRecord],
        source: &str,
    ) -> bool {
        let ltc = is_substation_regulator(control, transformers, source);
        match self {
            RegulatorSelection::ExcludeLtc => !ltc,
            RegulatorSelection::OnlyLtc => ltc,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RegulatorSelection::ExcludeLtc => "exclude_ltc",
            RegulatorSelection::OnlyLtc => "only_ltc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepOutcome {
    /// New settings were committed.
    Improved(Severity),
    /// Current settings are already best.
    Unchanged,
    /// No regulator matched the selection.
    NothingToSweep,
    /// No grid point could be evaluated within the control-iteration cap.
    ControlLimit,
}

/// Fallbacks tried in order by [`sweep_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepStrategy {
    AsConfigured(RegulatorSelection),
    WidenedExcludingLtc,
    WidenedOnlyLtc,
}

impl SweepStrategy {
    fn selection(&self) -> RegulatorSelection {
        match self {
            SweepStrategy::AsConfigured(selection) => *selection,
            SweepStrategy::WidenedExcludingLtc => RegulatorSelection::ExcludeLtc,
            SweepStrategy::WidenedOnlyLtc => RegulatorSelection::OnlyLtc,
        }
    }

    fn is_widened(&self) -> bool {
        !matches!(self, SweepStrategy::AsConfigured(_))
    }

    fn bands(&self, params: &VoltageUpgradeParams) -> Vec<f64> {
        if self.is_widened() {
            params
                .reg_control_bands
                .iter()
                .map(|b| b + params.band_widening_step)
                .collect()
        } else {
            params.reg_control_bands.clone()
        }
    }

    fn iterations(&self, params: &VoltageUpgradeParams) -> u32 {
        if self.is_widened() {
            params.max_control_iterations_retry
        } else {
            params.max_control_iterations
        }
    }
}

fn selected_regulators<S: SimulationSession>(
    session: &S,
    selection: RegulatorSelection,
) -> (Vec<RegControlRecord>, Vec<TransformerRecord>, String) {
    let transformers = session.transformers();
    let source = session.source_bus();
    let controls = session
        .reg_controls()
        .into_iter()
        .filter(|rc| rc.enabled)
        .filter(|rc| controlled_transformer(rc, &transformers).is_some())
        .filter(|rc| selection.includes(rc, &transformers, &source))
        .collect();
    (controls, transformers, source)
}

pub(crate) fn record_setting_change(
    log: &mut ActionLog,
    name: &str,
    from: RegControlSettings,
    to: RegControlSettings,
) {
    log.record(UpgradeAction::remove(
        EquipmentType::RegControl,
        UpgradeType::SettingChange,
        name,
        EquipmentParameters::RegControl(from),
    ));
    log.record(UpgradeAction::add(
        EquipmentType::RegControl,
        UpgradeType::SettingChange,
        name,
        name,
        EquipmentParameters::RegControl(to),
    ));
}

/// Set each selected regulator's PT ratio to map its winding rating onto
/// the nominal secondary voltage. Commands are applied and logged.
pub fn correct_pt_ratios<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    log: &mut ActionLog,
    selection: RegulatorSelection,
) -> UpgradeResult<usize> {
    let (controls, transformers, source) = selected_regulators(session, selection);
    let mut commands = Vec::new();
    for rc in &controls {
        let Some(xfmr) = controlled_transformer(rc, &transformers) else {
            continue;
        };
        let pt_ratio = regulated_kv(rc, xfmr).pt_ratio(xfmr.phases, params.nominal_volts());
        if pt_ratio <= 0.0 || (rc.pt_ratio - pt_ratio).abs() <= PT_TOLERANCE {
            continue;
        }
        debug!(regcontrol = %rc.name, from = rc.pt_ratio, to = pt_ratio, "correcting regulator PT ratio");
        commands.push(EditCommand::edit(ElementClass::RegControl, &rc.name).with("ptratio", pt_ratio));
        let from = reg_settings(rc, &transformers, &source);
        let to = RegControlSettings {
            pt_ratio,
            ..from.clone()
        };
        record_setting_change(log, &rc.name, from, to);
    }
    session.apply(&commands)?;
    log.extend_commands(commands.iter().cloned());
    Ok(commands.len())
}

/// `vreg` values from the lower to the upper initial limit.
pub(crate) fn vreg_grid(params: &VoltageUpgradeParams) -> Vec<Volts> {
    let (low, high) = params.initial_limits_volts();
    let mut grid = Vec::new();
    let mut step = 0.0;
    loop {
        let vreg = low.value() + step * params.reg_v_delta;
        if vreg > high.value() + 1e-9 {
            break;
        }
        grid.push(Volts(vreg));
        step += 1.0;
    }
    grid
}

fn setting_commands(controls: &[RegControlRecord], vreg: Volts, band: f64) -> Vec<EditCommand> {
    controls
        .iter()
        .map(|rc| {
            EditCommand::edit(ElementClass::RegControl, &rc.name)
                .with("vreg", vreg.value())
                .with("band", band)
        })
        .collect()
}

/// Sweep `(vreg, band)` over the selected regulators. The session matches
/// `log` on return.
pub fn sweep_regulators<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    log: &mut ActionLog,
    selection: RegulatorSelection,
    bands: &[f64],
) -> UpgradeResult<SweepOutcome> {
    let (controls, transformers, source) = selected_regulators(session, selection);
    if controls.is_empty() {
        debug!(selection = selection.as_str(), "no regulators to sweep");
        return Ok(SweepOutcome::NothingToSweep);
    }

    let baseline = evaluate(session, params)?.unwrap_or(UNSOLVED);
    let mut best: Option<(Volts, f64, Severity)> = None;
    let mut evaluated = 0;
    let mut control_limited = 0;

    for vreg in vreg_grid(params) {
        for &band in bands {
            session.apply(&setting_commands(&controls, vreg, band))?;
            match session.solve()? {
                SolveStatus::ControlIterationLimit => {
                    control_limited += 1;
                    continue;
                }
                SolveStatus::NotConverged => continue,
                SolveStatus::Converged => {}
            }
            let Some(severity) = evaluate(session, params)? else {
                continue;
            };
            evaluated += 1;
            if best.map_or(true, |(_, _, b)| severity.improves_on(&b)) {
                best = Some((vreg, band, severity));
            }
        }
    }

    if evaluated == 0 && control_limited > 0 {
        warn!(
            selection = selection.as_str(),
            control_limited,
            iterations = session.max_control_iterations(),
            "regulator sweep hit the control iteration limit at every setting"
        );
        session.reload(log.commands())?;
        return Ok(SweepOutcome::ControlLimit);
    }

    let outcome = match best {
        Some((vreg, band, severity)) if severity.improves_on(&baseline) => {
            info!(
                selection = selection.as_str(),
                vreg = vreg.value(),
                band,
                severity = severity.deviation,
                "regulator settings improved"
            );
            log.extend_commands(setting_commands(&controls, vreg, band));
            for rc in &controls {
                let from = reg_settings(rc, &transformers, &source);
                let to = RegControlSettings {
                    vreg,
                    band: Volts(band),
                    ..from.clone()
                };
                record_setting_change(log, &rc.name, from, to);
            }
            SweepOutcome::Improved(severity)
        }
        _ => {
            debug!(selection = selection.as_str(), "regulator settings already best");
            SweepOutcome::Unchanged
        }
    };
    session.reload(log.commands())?;
    Ok(outcome)
}

/// Sweep with fallbacks for control-iteration failures.
///
/// Strategies run in order: the configured sweep, then a widened sweep
/// excluding the substation regulator, then a widened sweep of only the
/// substation regulator. A widened strategy raises the iteration cap to
/// `max_control_iterations_retry`; that cap stays in effect when it is the
/// one that succeeds.
pub fn sweep_with_retry<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    log: &mut ActionLog,
    selection: RegulatorSelection,
) -> UpgradeResult<SweepOutcome> {
    let original_cap = session.max_control_iterations();
    let strategies = [
        SweepStrategy::AsConfigured(selection),
        SweepStrategy::WidenedExcludingLtc,
        SweepStrategy::WidenedOnlyLtc,
    ];

    for (attempt, strategy) in strategies.iter().enumerate() {
        let iterations = if strategy.is_widened() {
            strategy.iterations(params).max(original_cap)
        } else {
            original_cap
        };
        session.set_max_control_iterations(iterations);
        session.reload(log.commands())?;
        let outcome = sweep_regulators(
            session,
            params,
            log,
            strategy.selection(),
            &strategy.bands(params),
        )?;
        match outcome {
            SweepOutcome::Improved(_) | SweepOutcome::Unchanged => {
                if strategy.is_widened() {
                    info!(
                        attempt,
                        iterations,
                        selection = strategy.selection().as_str(),
                        "regulator sweep succeeded with widened bands"
                    );
                }
                return Ok(outcome);
            }
            SweepOutcome::NothingToSweep if attempt == 0 => return Ok(outcome),
            SweepOutcome::NothingToSweep | SweepOutcome::ControlLimit => {
                warn!(
                    attempt,
                    selection = strategy.selection().as_str(),
                    "regulator sweep strategy failed"
                );
            }
        }
    }

    session.set_max_control_iterations(original_cap);
    session.reload(log.commands())?;
    Err(UpgradeError::Convergence(format!(
        "regulator sweep could not settle within {} control iterations after widening bands by {}",
        params.max_control_iterations_retry, params.band_widening_step
    )))
}

/// Correct PT ratios, then sweep every regulator except the substation one.
pub fn run_existing_regulator_stage<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    log: &mut ActionLog,
) -> UpgradeResult<()> {
    correct_pt_ratios(session, params, log, RegulatorSelection::ExcludeLtc)?;
    match sweep_with_retry(session, params, log, RegulatorSelection::ExcludeLtc)? {
        SweepOutcome::NothingToSweep => info!("no existing regulators, skipping regulator sweep"),
        SweepOutcome::Unchanged => info!("existing regulator settings are already best"),
        SweepOutcome::Improved(severity) => {
            info!(severity = severity.deviation, "existing regulator settings changed")
        }
        SweepOutcome::ControlLimit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestFeeder;
    use upgrade_core::{KilovoltAmperes, Kilovolts};

    fn regulator_feeder(band: f64) -> TestFeeder {
        TestFeeder::new("src")
            .with_line("l1", "src", "a", 100.0, 400.0)
            .with_transformer(TransformerRecord {
                name: "reg1".into(),
                buses: vec!["a".into(), "a_reg".into()],
                kvs: vec![Kilovolts(12.47), Kilovolts(12.47)],
                kvas: vec![KilovoltAmperes(5000.0), KilovoltAmperes(5000.0)],
                ..TransformerRecord::default()
            })
            .with_line("l2", "a_reg", "b", 500.0, 400.0)
            .with_voltage("a_reg", 0.93)
            .with_reg_control(RegControlRecord {
                name: "rc1".into(),
                transformer: "reg1".into(),
                winding: 2,
                vreg: Volts(110.0),
                band: Volts(band),
                pt_ratio: 60.0,
                enabled: true,
            })
    }

    #[test]
    fn test_vreg_grid_spans_initial_limits() {
        let grid = vreg_grid(&VoltageUpgradeParams::default());
        assert!((grid[0].value() - 110.004).abs() < 1e-9);
        assert!(grid.last().unwrap().value() <= 126.996 + 1e-9);
        assert_eq!(grid.len(), 34);
    }

    #[test]
    fn test_pt_ratio_correction() {
        let mut feeder = regulator_feeder(2.0);
        let mut log = ActionLog::new();
        feeder.reload(log.commands()).unwrap();
        let changed = correct_pt_ratios(
            &mut feeder,
            &VoltageUpgradeParams::default(),
            &mut log,
            RegulatorSelection::ExcludeLtc,
        )
        .unwrap();
        assert_eq!(changed, 1);
        assert!(log.commands()[0].to_string().starts_with("Edit RegControl.rc1 ptratio=59.99"));
        assert_eq!(log.actions().len(), 2);
    }

    #[test]
    fn test_sweep_finds_first_setting_that_resolves() {
        let mut feeder = regulator_feeder(2.0);
        let params = VoltageUpgradeParams::default();
        let mut log = ActionLog::new();
        feeder.reload(log.commands()).unwrap();
        let outcome = sweep_regulators(
            &mut feeder,
            &params,
            &mut log,
            RegulatorSelection::ExcludeLtc,
            &params.reg_control_bands,
        )
        .unwrap();
        assert_eq!(outcome, SweepOutcome::Improved(Severity::ZERO));
        assert_eq!(
            log.commands()[0].to_string(),
            "Edit RegControl.rc1 vreg=114.004 band=1"
        );
        assert!(feeder.voltage("b").unwrap() >= 0.95);
    }

    #[test]
    fn test_substation_selection_is_empty_without_ltc() {
        let mut feeder = regulator_feeder(2.0);
        let params = VoltageUpgradeParams::default();
        let mut log = ActionLog::new();
        feeder.reload(log.commands()).unwrap();
        let outcome = sweep_regulators(
            &mut feeder,
            &params,
            &mut log,
            RegulatorSelection::OnlyLtc,
            &params.reg_control_bands,
        )
        .unwrap();
        assert_eq!(outcome, SweepOutcome::NothingToSweep);
        assert!(log.commands().is_empty());
    }

    #[test]
    fn test_retry_widens_bands_after_control_limit() {
        // Bands under 3 V need 100 control iterations to settle.
        let mut feeder = regulator_feeder(3.0).with_control_limit(3.0, 100);
        let params = VoltageUpgradeParams::default();
        let mut log = ActionLog::new();
        feeder.set_max_control_iterations(params.max_control_iterations);
        feeder.reload(log.commands()).unwrap();

        let outcome =
            sweep_with_retry(&mut feeder, &params, &mut log, RegulatorSelection::ExcludeLtc)
                .unwrap();
        assert!(matches!(outcome, SweepOutcome::Improved(_)));
        assert_eq!(feeder.max_control_iterations(), 200);
        assert!(log.commands()[0].to_string().ends_with("band=2"));
    }

    #[test]
    fn test_retry_gives_up_with_convergence_error() {
        let mut feeder = regulator_feeder(5.0).with_control_limit(5.0, 1000);
        let params = VoltageUpgradeParams::default();
        let mut log = ActionLog::new();
        feeder.reload(log.commands()).unwrap();

        let err = sweep_with_retry(&mut feeder, &params, &mut log, RegulatorSelection::ExcludeLtc)
            .unwrap_err();
        assert!(err.is_convergence());
        assert!(log.commands().is_empty());
        assert_eq!(feeder.max_control_iterations(), 50);
    }
}
