//! Voltage remediation pipeline.
//!
//! A linear sequence of optional stages, each gated by a configuration flag:
//!
//! | Stage | Flag | Module |
//! |-------|------|--------|
//! | Capacitor controls | `capacitor_action_flag` | [`capacitors`] |
//! | Existing regulators | `existing_regulator_sweep_action` | [`regulators`] |
//! | Substation LTC | `use_ltc_placement` | [`ltc`] |
//! | New regulators | `place_new_regulators` | [`crate::placement`] |
//!
//! Every stage runs against a checkpoint of the action log. Its edits are
//! kept only when they strictly lower the severity below the best seen so
//! far; otherwise the log is restored and the circuit reloaded.

pub mod capacitors;
pub mod ltc;
pub mod regulators;

use crate::config::VoltageUpgradeParams;
use crate::detect::VoltageDetection;
use crate::placement::run_placement;
use crate::severity::{measure, Severity};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use upgrade_core::{
    bus_name, ActionLog, CapControlRecord, CapControlSettings, Connection, EditCommand,
    ElementClass, KilovoltAmperes, Kilovolts, RegControlRecord, RegControlSettings,
    SimulationSession, TransformerParameters, TransformerRecord, UpgradeResult, Volts,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageStage {
    Capacitor,
    ExistingRegulator,
    SubstationLtc,
    NewRegulator,
}

impl VoltageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoltageStage::Capacitor => "capacitor",
            VoltageStage::ExistingRegulator => "existing_regulator",
            VoltageStage::SubstationLtc => "substation_ltc",
            VoltageStage::NewRegulator => "new_regulator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: VoltageStage,
    pub accepted: bool,
    pub before: Severity,
    pub after: Severity,
}

#[derive(Debug, Clone)]
pub struct VoltageOutcome {
    pub log: ActionLog,
    pub initial: VoltageDetection,
    pub final_detection: VoltageDetection,
    pub initial_severity: Severity,
    pub final_severity: Severity,
    pub stages: Vec<StageReport>,
    /// Control-iteration cap in effect at the end; raised when a widened
    /// regulator sweep was needed.
    pub max_control_iterations: u32,
}

impl VoltageOutcome {
    pub fn violations_present(&self) -> bool {
        self.initial.violation_count() > 0
    }
}

/// Severity used as a baseline when the circuit cannot be evaluated.
pub(crate) const UNSOLVED: Severity = Severity {
    deviation: f64::INFINITY,
    violation_count: usize::MAX,
};

/// Measure, treating any non-converged operating point as unsolved.
pub(crate) fn evaluate<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
) -> UpgradeResult<Option<Severity>> {
    let (severity, detection) = measure(session, params)?;
    if detection.non_converged.is_empty() {
        Ok(Some(severity))
    } else {
        Ok(None)
    }
}

pub(crate) fn cap_settings(control: &CapControlRecord) -> CapControlSettings {
    CapControlSettings {
        capacitor: control.capacitor.clone(),
        control_type: control.control_type,
        on_setting: control.on_setting,
        off_setting: control.off_setting,
        pt_ratio: control.pt_ratio,
    }
}

/// Transformer a regulator controls, if present and enabled.
pub(crate) fn controlled_transformer<'a>(
    control: &RegControlRecord,
    transformers: &'a [TransformerRecord],
) -> Option<&'a TransformerRecord> {
    transformers
        .iter()
        .find(|t| t.enabled && t.name.eq_ignore_ascii_case(&control.transformer))
}

/// Voltage rating of the regulated winding.
pub(crate) fn regulated_kv(control: &RegControlRecord, xfmr: &TransformerRecord) -> Kilovolts {
    let winding = (control.winding.max(1) as usize) - 1;
    xfmr.kvs
        .get(winding)
        .or_else(|| xfmr.kvs.last())
        .copied()
        .unwrap_or_default()
}

pub(crate) fn is_substation_regulator(
    control: &RegControlRecord,
    transformers: &[TransformerRecord],
    source: &str,
) -> bool {
    controlled_transformer(control, transformers)
        .map(|t| t.connects(&bus_name(source)))
        .unwrap_or(false)
}

pub(crate) fn reg_settings(
    control: &RegControlRecord,
    transformers: &[TransformerRecord],
    source: &str,
) -> RegControlSettings {
    let xfmr = controlled_transformer(control, transformers);
    RegControlSettings {
        transformer: control.transformer.clone(),
        vreg: control.vreg,
        band: control.band,
        pt_ratio: control.pt_ratio,
        phases: xfmr.map(|t| t.phases).unwrap_or(3),
        kv: xfmr.map(|t| regulated_kv(control, t)).unwrap_or_default(),
        kva: xfmr.map(|t| t.rated_kva()).unwrap_or(KilovoltAmperes(0.0)),
        at_substation: is_substation_regulator(control, transformers, source),
        new_transformer: None,
    }
}

/// Impedance of inserted regulator transformers.
const REGULATOR_XHL: f64 = 0.01;
const REGULATOR_PERCENT_R: f64 = 0.0001;

/// Replace the bus in a bus reference, keeping its node suffix.
pub(crate) fn rename_bus(reference: &str, bus: &str) -> String {
    match reference.find('.') {
        Some(idx) => format!("{}{}", bus, &reference[idx..]),
        None => bus.to_string(),
    }
}

/// A regulator to insert: a 1:1 transformer between two buses plus its
/// controller on winding 2.
pub(crate) struct RegulatorInsertion<'a> {
    pub transformer: &'a str,
    pub controller: &'a str,
    pub from_bus: &'a str,
    pub to_bus: &'a str,
    pub phases: u32,
    pub kv: Kilovolts,
    pub kva: KilovoltAmperes,
    pub vreg: Volts,
    pub band: Volts,
    pub nominal: Volts,
}

impl RegulatorInsertion<'_> {
    pub fn transformer_parameters(&self) -> TransformerParameters {
        TransformerParameters {
            phases: self.phases,
            windings: 2,
            conns: vec![Connection::Wye, Connection::Wye],
            kvs: vec![self.kv, self.kv],
            kvas: vec![self.kva, self.kva],
        }
    }

    pub fn pt_ratio(&self) -> f64 {
        self.kv.pt_ratio(self.phases, self.nominal)
    }

    pub fn commands(&self) -> Vec<EditCommand> {
        vec![
            EditCommand::create(ElementClass::Transformer, self.transformer)
                .with("phases", self.phases)
                .with("windings", 2u32)
                .with_list("buses", &[self.from_bus, self.to_bus])
                .with_list("conns", &["wye", "wye"])
                .with_list("kvs", &[self.kv.value(), self.kv.value()])
                .with_list("kvas", &[self.kva.value(), self.kva.value()])
                .with("xhl", REGULATOR_XHL)
                .with("%r", REGULATOR_PERCENT_R),
            self.controller_command(),
        ]
    }

    pub fn controller_command(&self) -> EditCommand {
        EditCommand::create(ElementClass::RegControl, self.controller)
            .with("transformer", self.transformer)
            .with("winding", 2u32)
            .with("vreg", self.vreg.value())
            .with("band", self.band.value())
            .with("ptratio", self.pt_ratio())
    }

    pub fn settings(&self, at_substation: bool, new_transformer: bool) -> RegControlSettings {
        RegControlSettings {
            transformer: self.transformer.to_string(),
            vreg: self.vreg,
            band: self.band,
            pt_ratio: self.pt_ratio(),
            phases: self.phases,
            kv: self.kv,
            kva: self.kva,
            at_substation,
            new_transformer: new_transformer.then(|| self.transformer_parameters()),
        }
    }
}

/// Run one stage under checkpoint/restore.
fn run_stage<S, F>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    log: &mut ActionLog,
    best: &mut Severity,
    stage: VoltageStage,
    body: F,
) -> UpgradeResult<StageReport>
where
    S: SimulationSession,
    F: FnOnce(&mut S, &mut ActionLog) -> UpgradeResult<()>,
{
    let checkpoint = log.checkpoint();
    let before = *best;
    body(session, log)?;

    let after = if log.has_changes_since(checkpoint) {
        evaluate(session, params)?.unwrap_or(UNSOLVED)
    } else {
        before
    };
    let accepted = log.has_changes_since(checkpoint) && after.improves_on(&before);
    if accepted {
        *best = after;
        info!(
            stage = stage.as_str(),
            before = before.deviation,
            after = after.deviation,
            violations = after.violation_count,
            "voltage stage accepted"
        );
    } else {
        if log.has_changes_since(checkpoint) {
            log.restore(checkpoint);
            session.reload(log.commands())?;
        }
        info!(
            stage = stage.as_str(),
            severity = before.deviation,
            "voltage stage made no improvement"
        );
    }
    Ok(StageReport {
        stage,
        accepted,
        before,
        after,
    })
}

/// Run the voltage pipeline on top of `log`.
pub fn run_voltage_upgrades<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    mut log: ActionLog,
) -> UpgradeResult<VoltageOutcome> {
    session.set_max_control_iterations(params.max_control_iterations);
    session.reload(log.commands())?;
    session.solve_and_check(true)?;

    let (initial_severity, initial) = measure(session, params)?;
    let initial_count = initial.violation_count();
    info!(
        violations = initial_count,
        severity = initial_severity.deviation,
        "initial voltage violations"
    );

    let mut best = initial_severity;
    let mut stages = Vec::new();

    if initial_severity.is_resolved() {
        info!("no voltage violations, skipping voltage stages");
    } else {
        if params.capacitor_action_flag {
            stages.push(run_stage(
                session,
                params,
                &mut log,
                &mut best,
                VoltageStage::Capacitor,
                |s, l| capacitors::run_capacitor_stage(s, params, l),
            )?);
        }
        if params.existing_regulator_sweep_action && !best.is_resolved() {
            stages.push(run_stage(
                session,
                params,
                &mut log,
                &mut best,
                VoltageStage::ExistingRegulator,
                |s, l| regulators::run_existing_regulator_stage(s, params, l),
            )?);
        }
        if params.use_ltc_placement && !best.is_resolved() {
            stages.push(run_stage(
                session,
                params,
                &mut log,
                &mut best,
                VoltageStage::SubstationLtc,
                |s, l| ltc::run_ltc_stage(s, params, l),
            )?);
        }
        if params.place_new_regulators && !best.is_resolved() {
            let limit = params.violation_explosion_multiple * initial_count as f64;
            if (best.violation_count as f64) <= limit {
                stages.push(run_stage(
                    session,
                    params,
                    &mut log,
                    &mut best,
                    VoltageStage::NewRegulator,
                    |s, l| run_placement(s, params, l),
                )?);
            } else {
                warn!(
                    violations = best.violation_count,
                    initial = initial_count,
                    "violation count exploded, skipping new regulator placement"
                );
            }
        }
    }

    session.reload(log.commands())?;
    session.solve_and_check(true)?;
    let (final_severity, final_detection) = measure(session, params)?;
    info!(
        violations = final_detection.violation_count(),
        severity = final_severity.deviation,
        "voltage remediation complete"
    );

    Ok(VoltageOutcome {
        log,
        initial,
        final_detection,
        initial_severity,
        final_severity,
        stages,
        max_control_iterations: session.max_control_iterations(),
    })
}
