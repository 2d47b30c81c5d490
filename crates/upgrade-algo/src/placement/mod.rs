//! New regulator placement.
//!
//! Violated buses are grouped by electrical distance and each group gets one
//! new in-line regulator at the best of its common upstream buses:
//!
//! 1. Build the feeder graph and the pairwise distance matrix of violated buses.
//! 2. For `k = 1..=max_regulators`, split the buses into `k` clusters
//!    ([`clustering::agglomerative`], average linkage).
//! 3. For each cluster, try a regulator at every legal common ancestor and
//!    keep the candidate with the lowest severity.
//! 4. Re-sweep every non-substation regulator, score the option, and stop
//!    early once no violations remain.
//! 5. Keep the option with the lowest severity; fewer regulators win ties.
//!
//! A bus is a legal insertion point when it is not the source, does not
//! already host an enabled transformer, and is fed by a line that can be
//! split.

pub mod clustering;

use crate::config::VoltageUpgradeParams;
use crate::severity::{measure, Severity};
use crate::voltage::regulators::{sweep_with_retry, RegulatorSelection};
use crate::voltage::{evaluate, rename_bus, RegulatorInsertion, UNSOLVED};
use clustering::agglomerative;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use upgrade_core::{
    ActionLog, EdgeKind, EditCommand, ElementClass, EquipmentParameters, EquipmentType,
    FeederGraph, LineRecord, SimulationSession, UpgradeAction, UpgradeResult, UpgradeType, Volts,
};

/// One evaluated cluster count.
#[derive(Debug, Clone)]
pub struct PlacementOption {
    pub clusters: usize,
    pub severity: Severity,
    pub regulators: Vec<String>,
    commands: Vec<EditCommand>,
    actions: Vec<UpgradeAction>,
}

/// Buses where a regulator may be inserted for `cluster`, nearest first,
/// each with the line that feeds it.
pub fn candidate_buses<S: SimulationSession>(
    session: &S,
    cluster: &[String],
) -> UpgradeResult<Vec<(String, String)>> {
    let transformers = session.transformers();
    let graph = FeederGraph::build(&session.source_bus(), &session.lines(), &transformers)?;
    let hosting: HashSet<String> = transformers
        .iter()
        .filter(|t| t.enabled)
        .flat_map(|t| t.bus_names())
        .collect();

    let candidates = graph
        .common_ancestors(cluster)?
        .into_iter()
        .filter(|bus| !hosting.contains(bus))
        .filter_map(|bus| match graph.upstream_edge(&bus) {
            Some(edge) if edge.kind == EdgeKind::Line => {
                let line = edge.name.clone();
                Some((bus, line))
            }
            _ => None,
        })
        .collect();
    Ok(candidates)
}

fn insertion_commands(
    params: &VoltageUpgradeParams,
    bus: &str,
    line: &LineRecord,
) -> Option<(Vec<EditCommand>, UpgradeAction, String)> {
    let terminal = line.terminal_at(bus)?;
    let terminal_bus = if terminal == 1 { &line.bus1 } else { &line.bus2 };
    let reg_bus = format!("{}_newreg", bus);
    let transformer = format!("newreg_xfmr_{}", bus);
    let controller = format!("newreg_{}", bus);
    let band = params.reg_control_bands.first().copied().unwrap_or(2.0);
    let insertion = RegulatorInsertion {
        transformer: &transformer,
        controller: &controller,
        from_bus: &reg_bus,
        to_bus: bus,
        phases: line.phases,
        kv: line.kv,
        kva: line.normamps.apparent_power(line.kv, line.phases),
        vreg: params.nominal_volts(),
        band: Volts(band),
        nominal: params.nominal_volts(),
    };
    let mut commands = vec![EditCommand::edit(ElementClass::Line, &line.name)
        .with(&format!("bus{}", terminal), rename_bus(terminal_bus, &reg_bus))];
    commands.extend(insertion.commands());
    let action = UpgradeAction::add(
        EquipmentType::RegControl,
        UpgradeType::NewController,
        bus,
        &controller,
        EquipmentParameters::RegControl(insertion.settings(false, true)),
    );
    Some((commands, action, controller))
}

/// Try every candidate for one cluster and commit the best. Returns the
/// controller name placed, if any.
fn place_cluster<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    log: &mut ActionLog,
    cluster: &[String],
) -> UpgradeResult<Option<String>> {
    let candidates = candidate_buses(session, cluster)?;
    if candidates.is_empty() {
        warn!(buses = ?cluster, "no legal regulator location for cluster");
        return Ok(None);
    }
    let lines = session.lines();

    let mut best: Option<(Vec<EditCommand>, UpgradeAction, String, Severity)> = None;
    for (bus, line_name) in &candidates {
        let Some(line) = lines.iter().find(|l| &l.name == line_name) else {
            continue;
        };
        let Some((commands, action, controller)) = insertion_commands(params, bus, line) else {
            continue;
        };
        session.apply(&commands)?;
        let severity = evaluate(session, params)?;
        session.reload(log.commands())?;

        let Some(severity) = severity else {
            debug!(bus = %bus, "regulator trial did not converge");
            continue;
        };
        debug!(bus = %bus, severity = severity.deviation, "regulator trial");
        if best
            .as_ref()
            .map_or(true, |(_, _, _, b)| severity.improves_on(b))
        {
            best = Some((commands, action, controller, severity));
        }
    }

    let Some((commands, action, controller, severity)) = best else {
        warn!(buses = ?cluster, "no regulator trial converged for cluster");
        return Ok(None);
    };
    info!(controller = %controller, severity = severity.deviation, "placing new regulator");
    session.apply(&commands)?;
    log.extend_commands(commands);
    log.record(action);
    session.solve()?;
    Ok(Some(controller))
}

/// Search cluster counts and commit the best placement. The session matches
/// `log` on return.
pub fn run_placement<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    log: &mut ActionLog,
) -> UpgradeResult<()> {
    let stage = log.checkpoint();
    let (_, detection) = measure(session, params)?;
    let graph = FeederGraph::build(&session.source_bus(), &session.lines(), &session.transformers())?;
    let violated: Vec<String> = detection
        .violated()
        .into_iter()
        .filter(|bus| graph.distance_to_source(bus).is_ok())
        .collect();
    if violated.is_empty() {
        info!("no violated buses reachable from the source, skipping placement");
        return Ok(());
    }
    let distances = graph.distance_matrix(&violated)?;
    let max_clusters = params.max_regulators.min(violated.len());
    info!(
        buses = violated.len(),
        max_clusters, "searching new regulator placements"
    );

    let mut options: Vec<PlacementOption> = Vec::new();
    for k in 1..=max_clusters {
        if log.has_changes_since(stage) {
            log.restore(stage);
            session.reload(log.commands())?;
        }
        let mut regulators = Vec::new();
        for cluster in agglomerative(&distances, k)? {
            let buses: Vec<String> = cluster.iter().map(|&i| violated[i].clone()).collect();
            if let Some(controller) = place_cluster(session, params, log, &buses)? {
                regulators.push(controller);
            }
        }
        if regulators.is_empty() {
            debug!(clusters = k, "no regulator placed for this cluster count");
            continue;
        }
        sweep_with_retry(session, params, log, RegulatorSelection::ExcludeLtc)?;
        let severity = evaluate(session, params)?.unwrap_or(UNSOLVED);
        info!(
            clusters = k,
            regulators = regulators.len(),
            severity = severity.deviation,
            violations = severity.violation_count,
            "placement option evaluated"
        );
        options.push(PlacementOption {
            clusters: k,
            severity,
            regulators,
            commands: log.commands_since(stage).to_vec(),
            actions: log.actions_since(stage).to_vec(),
        });
        if severity.is_resolved() {
            break;
        }
    }

    log.restore(stage);
    match options.into_iter().min_by(|a, b| a.severity.compare(&b.severity)) {
        Some(best) => {
            info!(
                clusters = best.clusters,
                regulators = ?best.regulators,
                severity = best.severity.deviation,
                "selected regulator placement"
            );
            log.extend_commands(best.commands);
            log.record_all(best.actions);
        }
        None => warn!("no regulator placement option could be built"),
    }
    session.reload(log.commands())?;
    Ok(())
}
