//! Violation detection.
//!
//! Each detector solves the circuit at every configured operating point and
//! reduces the snapshots to one worst-case row per element: the highest
//! loading for lines and transformers, the highest maximum and lowest
//! minimum voltage for buses. The reduction is a max over the scenario axis,
//! never an average.
//!
//! After the sweep the session is put back on the operating point it started
//! from and re-solved, so callers see the same state before and after.

use crate::config::{operating_points, TimepointMultipliers};
use std::collections::HashMap;
use tracing::{debug, warn};
use upgrade_core::{
    Amperes, BusVoltage, LineRecord, OperatingPoint, SimulationSession, TransformerRecord,
    UpgradeResult,
};

/// Equipment whose loading is checked against an upper limit.
pub trait LoadedEquipment: Clone {
    fn name(&self) -> &str;
    fn max_amp_loading(&self) -> Amperes;
    fn per_unit_loading(&self) -> f64;
    fn is_enabled(&self) -> bool;
}

impl LoadedEquipment for LineRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_amp_loading(&self) -> Amperes {
        self.max_amp_loading
    }

    fn per_unit_loading(&self) -> f64 {
        LineRecord::per_unit_loading(self)
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl LoadedEquipment for TransformerRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_amp_loading(&self) -> Amperes {
        self.max_amp_loading
    }

    fn per_unit_loading(&self) -> f64 {
        TransformerRecord::per_unit_loading(self)
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Worst-case loading table plus the names over the limit.
#[derive(Debug, Clone)]
pub struct Detection<R> {
    pub table: Vec<R>,
    pub violated: Vec<String>,
    /// Operating points at which the solve did not converge.
    pub non_converged: Vec<OperatingPoint>,
}

impl<R: LoadedEquipment> Detection<R> {
    pub fn violation_count(&self) -> usize {
        self.violated.len()
    }

    pub fn get(&self, name: &str) -> Option<&R> {
        self.table.iter().find(|r| r.name() == name)
    }

    pub fn max_loading(&self) -> f64 {
        self.table
            .iter()
            .map(|r| r.per_unit_loading())
            .fold(0.0, f64::max)
    }

    /// Every operating point converged, so a zero count means no overloads.
    pub fn is_fully_evaluated(&self) -> bool {
        self.non_converged.is_empty()
    }
}

/// Worst-case bus voltages.
#[derive(Debug, Clone)]
pub struct VoltageDetection {
    pub table: Vec<BusVoltage>,
    pub overvoltage: Vec<String>,
    pub undervoltage: Vec<String>,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub non_converged: Vec<OperatingPoint>,
}

impl VoltageDetection {
    /// Buses outside either limit, in table order, each listed once.
    pub fn violated(&self) -> Vec<String> {
        self.table
            .iter()
            .filter(|v| v.max_pu > self.upper_limit || v.min_pu < self.lower_limit)
            .map(|v| v.bus.clone())
            .collect()
    }

    pub fn violation_count(&self) -> usize {
        self.violated().len()
    }

    pub fn max_voltage(&self) -> f64 {
        self.table.iter().map(|v| v.max_pu).fold(0.0, f64::max)
    }

    pub fn is_fully_evaluated(&self) -> bool {
        self.non_converged.is_empty()
    }

    pub fn min_voltage(&self) -> f64 {
        if self.table.is_empty() {
            return 0.0;
        }
        self.table.iter().map(|v| v.min_pu).fold(f64::INFINITY, f64::min)
    }
}

/// Union of non-converged points, first occurrence order.
pub fn unevaluated_points<'a>(
    lists: impl IntoIterator<Item = &'a [OperatingPoint]>,
) -> Vec<OperatingPoint> {
    let mut out: Vec<OperatingPoint> = Vec::new();
    for point in lists.into_iter().flatten() {
        if !out.contains(point) {
            out.push(*point);
        }
    }
    out
}

/// Run `snapshot` at every operating point; returns the snapshots that
/// converged and the points that did not.
fn sweep<S, T>(
    session: &mut S,
    multipliers: Option<&TimepointMultipliers>,
    raise: bool,
    mut snapshot: impl FnMut(&S) -> T,
) -> UpgradeResult<(Vec<T>, Vec<OperatingPoint>)>
where
    S: SimulationSession,
{
    let restore = session.operating_point();
    let points = match multipliers {
        Some(m) if !m.is_empty() => operating_points(Some(m)),
        _ => vec![restore],
    };
    let mut snapshots = Vec::with_capacity(points.len());
    let mut failed = Vec::new();
    for point in points {
        session.set_operating_point(point)?;
        if session.solve_and_check(raise)? {
            snapshots.push(snapshot(&*session));
        } else {
            warn!(
                load_multiplier = point.load_multiplier,
                pv_enabled = point.pv_enabled,
                "solve did not converge, skipping operating point"
            );
            failed.push(point);
        }
    }
    if session.operating_point() != restore {
        session.set_operating_point(restore)?;
        session.solve_and_check(false)?;
    }
    Ok((snapshots, failed))
}

fn reduce_loading<R: LoadedEquipment>(snapshots: Vec<Vec<R>>) -> Vec<R> {
    let mut order: Vec<R> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for snapshot in snapshots {
        for record in snapshot {
            match index.get(record.name()) {
                Some(&i) => {
                    if record.per_unit_loading() > order[i].per_unit_loading() {
                        order[i] = record;
                    }
                }
                None => {
                    index.insert(record.name().to_string(), order.len());
                    order.push(record);
                }
            }
        }
    }
    order
}

fn detect_loading<S, R>(
    session: &mut S,
    upper_limit: f64,
    multipliers: Option<&TimepointMultipliers>,
    raise: bool,
    fetch: fn(&S) -> Vec<R>,
) -> UpgradeResult<Detection<R>>
where
    S: SimulationSession,
    R: LoadedEquipment,
{
    let (snapshots, non_converged) = sweep(session, multipliers, raise, fetch)?;
    let table: Vec<R> = reduce_loading(snapshots)
        .into_iter()
        .filter(|r| r.is_enabled())
        .collect();
    let violated = table
        .iter()
        .filter(|r| r.per_unit_loading() > upper_limit)
        .map(|r| r.name().to_string())
        .collect::<Vec<_>>();
    Ok(Detection {
        table,
        violated,
        non_converged,
    })
}

pub fn detect_lines<S: SimulationSession>(
    session: &mut S,
    upper_limit: f64,
    multipliers: Option<&TimepointMultipliers>,
    raise: bool,
) -> UpgradeResult<Detection<LineRecord>> {
    let detection = detect_loading(session, upper_limit, multipliers, raise, |s: &S| {
        s.lines()
    })?;
    debug!(
        overloaded = detection.violation_count(),
        upper_limit, "line detection"
    );
    Ok(detection)
}

pub fn detect_transformers<S: SimulationSession>(
    session: &mut S,
    upper_limit: f64,
    multipliers: Option<&TimepointMultipliers>,
    raise: bool,
) -> UpgradeResult<Detection<TransformerRecord>> {
    let detection = detect_loading(session, upper_limit, multipliers, raise, |s: &S| {
        s.transformers()
    })?;
    debug!(
        overloaded = detection.violation_count(),
        upper_limit, "transformer detection"
    );
    Ok(detection)
}

pub fn detect_voltages<S: SimulationSession>(
    session: &mut S,
    lower_limit: f64,
    upper_limit: f64,
    multipliers: Option<&TimepointMultipliers>,
    raise: bool,
) -> UpgradeResult<VoltageDetection> {
    let (snapshots, non_converged) = sweep(session, multipliers, raise, |s: &S| s.bus_voltages())?;

    let mut table: Vec<BusVoltage> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for snapshot in snapshots {
        for voltage in snapshot {
            match index.get(&voltage.bus) {
                Some(&i) => {
                    table[i].max_pu = table[i].max_pu.max(voltage.max_pu);
                    table[i].min_pu = table[i].min_pu.min(voltage.min_pu);
                }
                None => {
                    index.insert(voltage.bus.clone(), table.len());
                    table.push(voltage);
                }
            }
        }
    }

    let overvoltage = table
        .iter()
        .filter(|v| v.max_pu > upper_limit)
        .map(|v| v.bus.clone())
        .collect();
    let undervoltage = table
        .iter()
        .filter(|v| v.min_pu < lower_limit)
        .map(|v| v.bus.clone())
        .collect();
    Ok(VoltageDetection {
        table,
        overvoltage,
        undervoltage,
        lower_limit,
        upper_limit,
        non_converged,
    })
}
