//! The upgrade run.
//!
//! ```text
//! derate prefix ─► for each category in upgrade_order:
//!                      summarize (initial) ─► remediate ─► summarize (final)
//!               ─► price coalesced actions ─► write documents + redirect chain
//! ```
//!
//! A category left out of `upgrade_order` still gets its pair of summaries,
//! both taken from the unchanged circuit, and contributes no actions.

use crate::results::{
    equipment_details, summarize, EquipmentDetail, SummaryStage, UpgradeViolationResultModel,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use upgrade_algo::{
    compute_costs, run_thermal_upgrades, run_voltage_upgrades, CostCatalog, CostReport,
    NameGenerator, TechnicalCatalog, UpgradeConfig, UpgradeKind,
};
use upgrade_core::{
    ActionLog, EditCommand, ElementClass, PvSystemRecord, SimulationSession, UpgradeAction,
    UpgradeError,
};
use upgrade_io::output::{write_json, write_redirect_chain, write_script, RedirectChain};

pub const SUMMARY_FILE: &str = "upgrade_summary.json";
pub const THERMAL_DETAILS_FILE: &str = "thermal_upgrade_details.json";
pub const VOLTAGE_DETAILS_FILE: &str = "voltage_upgrade_details.json";
pub const COSTS_FILE: &str = "upgrade_costs.json";
pub const PARTIAL_THERMAL_FILE: &str = "thermal_upgrades_partial.dss";

/// Everything one run needs.
#[derive(Debug, Clone)]
pub struct UpgradeJob {
    pub name: String,
    /// Circuit file the session was built from; the redirect chain starts here.
    pub base_network: PathBuf,
    pub config: UpgradeConfig,
    pub cost_catalog: CostCatalog,
    /// Extra technical options merged over those harvested from the feeder.
    pub technical_catalog: Option<TechnicalCatalog>,
    /// PV inverters are resized to `pmpp / dc_ac_ratio` before any upgrade.
    pub dc_ac_ratio: Option<f64>,
    pub output_dir: PathBuf,
    /// Fixed stamp for generated equipment names; a clock stamp when unset.
    pub name_stamp: Option<String>,
}

impl UpgradeJob {
    /// Build a job from configuration and cost catalog files.
    pub fn from_files(
        name: &str,
        base_network: &Path,
        config: &Path,
        cost_catalog: &Path,
        output_dir: &Path,
    ) -> Result<Self> {
        let config = upgrade_io::load_config(config)?;
        let technical_catalog = match (
            config.thermal.read_external_catalog,
            &config.thermal.external_catalog,
        ) {
            (true, Some(path)) => Some(upgrade_io::load_technical_catalog(path)?),
            _ => None,
        };
        Ok(Self {
            name: name.to_string(),
            base_network: base_network.to_path_buf(),
            cost_catalog: upgrade_io::load_cost_catalog(cost_catalog)?,
            config,
            technical_catalog,
            dc_ac_ratio: None,
            output_dir: output_dir.to_path_buf(),
            name_stamp: None,
        })
    }
}

/// Edits of one upgrade category.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryResult {
    pub commands: Vec<EditCommand>,
    pub actions: Vec<UpgradeAction>,
    pub details: Vec<EquipmentDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeRunOutput {
    pub summaries: Vec<UpgradeViolationResultModel>,
    pub thermal: CategoryResult,
    pub voltage: CategoryResult,
    pub costs: CostReport,
    /// Replay script of the whole run, derate prefix included.
    pub commands: Vec<EditCommand>,
    pub redirect_chain: RedirectChain,
    pub simulation_time_s: f64,
}

/// Inverter resizing edits for every enabled PV system.
pub fn derate_commands(pv_systems: &[PvSystemRecord], dc_ac_ratio: f64) -> Vec<EditCommand> {
    pv_systems
        .iter()
        .filter(|pv| pv.enabled && pv.pmpp > 0.0)
        .map(|pv| {
            EditCommand::edit(ElementClass::PvSystem, &pv.name).with("kva", pv.pmpp / dc_ac_ratio)
        })
        .collect()
}

fn category_order(config: &UpgradeConfig) -> Vec<(UpgradeKind, bool)> {
    let mut order: Vec<(UpgradeKind, bool)> =
        config.upgrade_order.iter().map(|&kind| (kind, true)).collect();
    for kind in [UpgradeKind::Thermal, UpgradeKind::Voltage] {
        if !config.upgrade_order.contains(&kind) {
            order.push((kind, false));
        }
    }
    order
}

fn flush_partial_log(output_dir: &Path, err: &UpgradeError) -> Result<()> {
    if let Some(partial) = err.partial_log() {
        let path = output_dir.join(PARTIAL_THERMAL_FILE);
        write_script(&path, partial)?;
        error!(path = %path.display(), commands = partial.len(), "wrote partial edit log");
    }
    Ok(())
}

/// Run every configured upgrade category against `session` and write the
/// result documents to `job.output_dir`.
///
/// On an invariant violation the partial edit log is written to
/// [`PARTIAL_THERMAL_FILE`] before the error is returned.
pub fn run_upgrades<S: SimulationSession>(
    session: &mut S,
    job: &UpgradeJob,
) -> Result<UpgradeRunOutput> {
    let started = Instant::now();
    job.config.validate().context("validating upgrade config")?;
    let thermal_params = &job.config.thermal;
    let voltage_params = &job.config.voltage;

    let prefix = match job.dc_ac_ratio {
        Some(ratio) if ratio > 0.0 => {
            let commands = derate_commands(&session.pv_systems(), ratio);
            info!(ratio, pv_systems = commands.len(), "applying DC/AC derate");
            commands
        }
        Some(ratio) => {
            warn!(ratio, "ignoring non-positive DC/AC ratio");
            Vec::new()
        }
        None => Vec::new(),
    };
    let mut log = ActionLog::with_prefix(prefix.clone());
    session.reload(log.commands())?;
    session.solve_and_check(true)?;

    let mut names = match &job.name_stamp {
        Some(stamp) => NameGenerator::with_stamp(stamp.clone()),
        None => NameGenerator::new(),
    };
    let mut summaries = Vec::new();
    let mut thermal = CategoryResult::default();
    let mut voltage = CategoryResult::default();

    for (kind, enabled) in category_order(&job.config) {
        let elapsed = started.elapsed().as_secs_f64();
        summaries.push(summarize(
            session,
            &job.name,
            kind,
            SummaryStage::Initial,
            thermal_params,
            voltage_params,
            elapsed,
        )?);

        if enabled {
            let stage = log.checkpoint();
            log = match kind {
                UpgradeKind::Thermal => {
                    let mut catalog =
                        TechnicalCatalog::from_feeder(&session.lines(), &session.transformers());
                    if let Some(external) = &job.technical_catalog {
                        catalog.merge(external.clone());
                    }
                    match run_thermal_upgrades(session, thermal_params, &catalog, log, &mut names)
                    {
                        Ok(outcome) => outcome.log,
                        Err(err) => {
                            flush_partial_log(&job.output_dir, &err)?;
                            return Err(err).context("thermal upgrades failed");
                        }
                    }
                }
                UpgradeKind::Voltage => run_voltage_upgrades(session, voltage_params, log)
                    .context("voltage upgrades failed")?
                    .log,
            };
            let stage_log = log.slice_since(stage);
            let actions = stage_log.coalesced_actions();
            let result = CategoryResult {
                commands: stage_log.commands().to_vec(),
                details: equipment_details(&actions),
                actions,
            };
            info!(
                category = kind.as_str(),
                commands = result.commands.len(),
                actions = result.actions.len(),
                "upgrade category complete"
            );
            match kind {
                UpgradeKind::Thermal => thermal = result,
                UpgradeKind::Voltage => voltage = result,
            }
        } else {
            info!(category = kind.as_str(), "category not in upgrade_order, skipping");
        }

        let elapsed = started.elapsed().as_secs_f64();
        summaries.push(summarize(
            session,
            &job.name,
            kind,
            SummaryStage::Final,
            thermal_params,
            voltage_params,
            elapsed,
        )?);
    }

    let costs = compute_costs(&thermal.actions, &voltage.actions, &job.cost_catalog)
        .context("pricing upgrades")?;
    info!(total_cost_usd = costs.total_cost_usd, "upgrade costs computed");

    let out = &job.output_dir;
    write_json(&out.join(SUMMARY_FILE), &summaries)?;
    write_json(&out.join(THERMAL_DETAILS_FILE), &thermal.details)?;
    write_json(&out.join(VOLTAGE_DETAILS_FILE), &voltage.details)?;
    write_json(&out.join(COSTS_FILE), &costs)?;
    let redirect_chain = write_redirect_chain(
        out,
        &job.base_network,
        &prefix,
        &thermal.commands,
        &voltage.commands,
    )?;

    let simulation_time_s = started.elapsed().as_secs_f64();
    info!(
        simulation_time_s,
        output = %out.display(),
        "upgrade run complete"
    );
    Ok(UpgradeRunOutput {
        summaries,
        thermal,
        voltage,
        costs,
        commands: log.commands().to_vec(),
        redirect_chain,
        simulation_time_s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derate_skips_disabled_systems() {
        let pv = |name: &str, enabled: bool| PvSystemRecord {
            name: name.into(),
            bus: "a".into(),
            kva: upgrade_core::KilovoltAmperes(10.0),
            pmpp: 12.0,
            enabled,
        };
        let commands = derate_commands(&[pv("pv1", true), pv("pv2", false)], 1.2);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].to_string(), "Edit PVSystem.pv1 kva=10");
    }

    #[test]
    fn test_skipped_categories_follow_configured_ones() {
        let config = UpgradeConfig {
            upgrade_order: vec![UpgradeKind::Voltage],
            ..UpgradeConfig::default()
        };
        assert_eq!(
            category_order(&config),
            vec![(UpgradeKind::Voltage, true), (UpgradeKind::Thermal, false)]
        );
    }

    #[test]
    fn test_partial_log_is_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let err = UpgradeError::InvariantViolation {
            message: "overloads increased".into(),
            partial_log: vec![EditCommand::edit(ElementClass::Line, "l1").with("normamps", 600.0)],
        };
        flush_partial_log(dir.path(), &err).unwrap();
        let written = std::fs::read_to_string(dir.path().join(PARTIAL_THERMAL_FILE)).unwrap();
        assert_eq!(written, "Edit Line.l1 normamps=600\n");

        flush_partial_log(dir.path(), &UpgradeError::Other("x".into())).unwrap();
    }
}
