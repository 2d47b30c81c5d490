//! Thermal remediation engine.
//!
//! Resolves line and transformer overloads by resizing equipment in place or
//! adding parallel units. Each iteration handles lines first, then
//! transformers, re-solving and re-detecting after each class:
//!
//! ```text
//! detect ──► plan lines ──► apply + solve ──► detect ──► plan transformers ──► apply + solve ──► detect
//!   ▲                                                                                             │
//!   └──────────────────────── until no overloads or iteration threshold ──────────────────────────┘
//! ```
//!
//! An iteration that leaves more overloads than it started with aborts the
//! run with [`UpgradeError::InvariantViolation`] carrying the edit log so far.

mod lines;
mod transformers;

pub use lines::plan_line_upgrades;
pub use transformers::plan_transformer_upgrades;

use crate::catalog::{Conductor, TechnicalCatalog};
use crate::config::ThermalUpgradeParams;
use crate::detect::{detect_lines, detect_transformers, unevaluated_points, Detection};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{info, warn};
use upgrade_core::{
    ActionLog, EditCommand, LineParameters, LineRecord, OperatingPoint, SimulationSession,
    TransformerParameters, TransformerRecord, UpgradeError, UpgradeResult,
};

/// Unique names for equipment added during a run.
///
/// Names are `{base}_upgrade_{stamp}_{n}`; the stamp is fixed per run so a
/// replayed log produces the same names.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    stamp: String,
    counter: usize,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::with_stamp(Utc::now().format("%Y%m%d%H%M%S").to_string())
    }

    pub fn with_stamp(stamp: impl Into<String>) -> Self {
        Self {
            stamp: stamp.into(),
            counter: 0,
        }
    }

    pub fn next(&mut self, base: &str) -> String {
        self.counter += 1;
        format!("{}_upgrade_{}_{}", base, self.stamp, self.counter)
    }
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ThermalOutcome {
    pub log: ActionLog,
    pub initial_lines: Detection<LineRecord>,
    pub initial_transformers: Detection<TransformerRecord>,
    pub final_lines: Detection<LineRecord>,
    pub final_transformers: Detection<TransformerRecord>,
    pub iterations: usize,
}

impl ThermalOutcome {
    pub fn violations_present(&self) -> bool {
        self.initial_lines.violation_count() + self.initial_transformers.violation_count() > 0
    }

    pub fn remaining_violations(&self) -> usize {
        self.final_lines.violation_count() + self.final_transformers.violation_count()
    }

    /// Operating points the final detection could not solve.
    pub fn unevaluated_points(&self) -> Vec<OperatingPoint> {
        unevaluated_points([
            self.final_lines.non_converged.as_slice(),
            self.final_transformers.non_converged.as_slice(),
        ])
    }

    /// No overloads remain at any operating point, all of them solved.
    pub fn is_resolved(&self) -> bool {
        self.remaining_violations() == 0 && self.unevaluated_points().is_empty()
    }
}

fn warn_unevaluated(
    stage: &str,
    lines: &Detection<LineRecord>,
    xfmrs: &Detection<TransformerRecord>,
) {
    let points = unevaluated_points([lines.non_converged.as_slice(), xfmrs.non_converged.as_slice()]);
    if !points.is_empty() {
        warn!(
            stage,
            points = ?points,
            "thermal detection skipped operating points that did not converge"
        );
    }
}

pub(crate) fn line_parameters(line: &LineRecord) -> LineParameters {
    LineParameters {
        phases: line.phases,
        kv: line.kv,
        normamps: line.normamps,
        emergamps: line.emergamps,
        length: line.length_m(),
        linecode: line.linecode.clone(),
        geometry: line.geometry.clone(),
        line_placement: line.line_placement,
        is_switch: line.is_switch,
    }
}

pub(crate) fn transformer_parameters(xfmr: &TransformerRecord) -> TransformerParameters {
    TransformerParameters {
        phases: xfmr.phases,
        windings: xfmr.windings,
        conns: xfmr.conns.clone(),
        kvs: xfmr.kvs.clone(),
        kvas: xfmr.kvas.clone(),
    }
}

/// Conductor names already defined in the circuit.
pub(crate) fn defined_conductors<S: SimulationSession>(session: &S) -> HashSet<String> {
    session
        .line_codes()
        .into_iter()
        .map(|c| c.name.to_ascii_lowercase())
        .chain(
            session
                .line_geometries()
                .into_iter()
                .map(|g| g.name.to_ascii_lowercase()),
        )
        .collect()
}

/// Current conductor of a line, if it uses one.
pub(crate) fn line_conductor(line: &LineRecord) -> Option<Conductor> {
    match (&line.geometry, &line.linecode) {
        (Some(geometry), _) => Some(Conductor::Geometry(geometry.clone())),
        (None, Some(code)) => Some(Conductor::LineCode(code.clone())),
        (None, None) => None,
    }
}

fn apply_checked<S: SimulationSession>(
    session: &mut S,
    commands: &[EditCommand],
) -> UpgradeResult<()> {
    session.apply(commands)?;
    session.solve_and_check(true)?;
    Ok(())
}

fn check_regression(
    log: &ActionLog,
    class: &str,
    lines_before: usize,
    lines_after: usize,
    xfmrs_before: usize,
    xfmrs_after: usize,
) -> UpgradeResult<()> {
    if lines_after > lines_before || xfmrs_after > xfmrs_before {
        return Err(UpgradeError::InvariantViolation {
            message: format!(
                "{} upgrades increased overloads: lines {} -> {}, transformers {} -> {}",
                class, lines_before, lines_after, xfmrs_before, xfmrs_after
            ),
            partial_log: log.commands().to_vec(),
        });
    }
    Ok(())
}

/// Run thermal remediation on top of `log`.
///
/// The session is reloaded from `log` first, so the caller's prefix
/// (for example a PV derate) is always in effect.
pub fn run_thermal_upgrades<S: SimulationSession>(
    session: &mut S,
    params: &ThermalUpgradeParams,
    catalog: &TechnicalCatalog,
    mut log: ActionLog,
    names: &mut NameGenerator,
) -> UpgradeResult<ThermalOutcome> {
    let multipliers = params.timepoint_multipliers.as_ref();
    session.reload(log.commands())?;
    session.solve_and_check(true)?;

    let initial_lines = detect_lines(session, params.line_upper_limit, multipliers, false)?;
    let initial_transformers =
        detect_transformers(session, params.transformer_upper_limit, multipliers, false)?;
    info!(
        lines = initial_lines.violation_count(),
        transformers = initial_transformers.violation_count(),
        "initial thermal violations"
    );
    warn_unevaluated("initial", &initial_lines, &initial_transformers);

    let mut defined = defined_conductors(session);
    let mut line_state = initial_lines.clone();
    let mut xfmr_state = initial_transformers.clone();
    let mut iterations = 0;

    while line_state.violation_count() + xfmr_state.violation_count() > 0
        && iterations < params.upgrade_iteration_threshold
    {
        let lines_before = line_state.violation_count();
        let xfmrs_before = xfmr_state.violation_count();

        if lines_before > 0 {
            let commands =
                plan_line_upgrades(&line_state, params, catalog, &mut defined, names, &mut log)?;
            apply_checked(session, &commands)?;
            log.extend_commands(commands);
            line_state = detect_lines(session, params.line_upper_limit, multipliers, false)?;
            xfmr_state =
                detect_transformers(session, params.transformer_upper_limit, multipliers, false)?;
            check_regression(
                &log,
                "line",
                lines_before,
                line_state.violation_count(),
                xfmrs_before,
                xfmr_state.violation_count(),
            )?;
        }

        if xfmr_state.violation_count() > 0 {
            let commands = plan_transformer_upgrades(&xfmr_state, params, catalog, names, &mut log)?;
            apply_checked(session, &commands)?;
            log.extend_commands(commands);
            line_state = detect_lines(session, params.line_upper_limit, multipliers, false)?;
            xfmr_state =
                detect_transformers(session, params.transformer_upper_limit, multipliers, false)?;
            check_regression(
                &log,
                "transformer",
                lines_before,
                line_state.violation_count(),
                xfmrs_before,
                xfmr_state.violation_count(),
            )?;
        }

        iterations += 1;
        info!(
            iteration = iterations,
            lines = line_state.violation_count(),
            transformers = xfmr_state.violation_count(),
            "thermal iteration complete"
        );
    }

    session.reload(log.commands())?;
    session.solve_and_check(true)?;
    let final_lines = detect_lines(session, params.line_upper_limit, multipliers, false)?;
    let final_transformers =
        detect_transformers(session, params.transformer_upper_limit, multipliers, false)?;

    warn_unevaluated("final", &final_lines, &final_transformers);

    let remaining = final_lines.violation_count() + final_transformers.violation_count();
    if remaining > 0 {
        warn!(
            remaining,
            iterations, "thermal violations remain after iteration threshold"
        );
    }

    Ok(ThermalOutcome {
        log,
        initial_lines,
        initial_transformers,
        final_lines,
        final_transformers,
        iterations,
    })
}
