//! The simulation session seam.
//!
//! The circuit engine holds one mutable circuit. Every engine operation takes
//! a `&mut impl SimulationSession`, so exclusive access is enforced by the
//! borrow checker rather than by convention. Snapshot queries take `&self`
//! and return owned records reflecting the last solve.

use crate::command::EditCommand;
use crate::equipment::{
    BusRecord, BusVoltage, CapControlRecord, CapacitorRecord, LineCodeRecord, LineGeometryRecord,
    LineRecord, OperatingPoint, PvSystemRecord, RegControlRecord, TransformerRecord,
};
use crate::error::{UpgradeError, UpgradeResult};
use serde::{Deserialize, Serialize};

/// Outcome of a power-flow solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Converged,
    NotConverged,
    /// Regulator/capacitor control loop hit its iteration cap.
    ControlIterationLimit,
}

impl SolveStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, SolveStatus::Converged)
    }
}

/// Handle to a live circuit in the simulation engine.
pub trait SimulationSession {
    /// Rebuild the circuit from its base definition, apply `commands` in
    /// order and solve at the current operating point.
    fn reload(&mut self, commands: &[EditCommand]) -> UpgradeResult<SolveStatus>;

    /// Apply commands to the live circuit without solving.
    fn apply(&mut self, commands: &[EditCommand]) -> UpgradeResult<()>;

    fn solve(&mut self) -> UpgradeResult<SolveStatus>;

    /// Set load level and PV state for subsequent solves.
    fn set_operating_point(&mut self, point: OperatingPoint) -> UpgradeResult<()>;

    fn operating_point(&self) -> OperatingPoint;

    fn set_max_control_iterations(&mut self, iterations: u32);

    fn max_control_iterations(&self) -> u32;

    fn source_bus(&self) -> String;

    fn lines(&self) -> Vec<LineRecord>;

    fn transformers(&self) -> Vec<TransformerRecord>;

    fn capacitors(&self) -> Vec<CapacitorRecord>;

    fn cap_controls(&self) -> Vec<CapControlRecord>;

    fn reg_controls(&self) -> Vec<RegControlRecord>;

    fn buses(&self) -> Vec<BusRecord>;

    fn bus_voltages(&self) -> Vec<BusVoltage>;

    fn pv_systems(&self) -> Vec<PvSystemRecord>;

    fn line_codes(&self) -> Vec<LineCodeRecord>;

    fn line_geometries(&self) -> Vec<LineGeometryRecord>;

    /// Solve and report convergence.
    ///
    /// With `raise` set, anything other than a converged solve becomes
    /// [`UpgradeError::Convergence`].
    fn solve_and_check(&mut self, raise: bool) -> UpgradeResult<bool> {
        let status = self.solve()?;
        if status.is_converged() {
            return Ok(true);
        }
        if raise {
            let point = self.operating_point();
            return Err(UpgradeError::Convergence(format!(
                "solve returned {:?} at load multiplier {} (pv {})",
                status,
                point.load_multiplier,
                if point.pv_enabled { "on" } else { "off" }
            )));
        }
        Ok(false)
    }

    /// Apply commands to the live circuit, then solve.
    fn apply_and_solve(&mut self, commands: &[EditCommand]) -> UpgradeResult<SolveStatus> {
        self.apply(commands)?;
        self.solve()
    }
}
