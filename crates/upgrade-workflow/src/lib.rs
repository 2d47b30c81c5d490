//! # upgrade-workflow: Feeder Upgrade Runs
//!
//! One call, [`run_upgrades`], takes a [`SimulationSession`](upgrade_core::SimulationSession)
//! and an [`UpgradeJob`] and produces:
//!
//! | File | Content |
//! |------|---------|
//! | `upgrade_summary.json` | Initial and final [`UpgradeViolationResultModel`] per category |
//! | `thermal_upgrade_details.json` | Changed lines and transformers |
//! | `voltage_upgrade_details.json` | Changed and added controllers |
//! | `upgrade_costs.json` | Per-equipment costs and totals |
//! | `thermal_upgrades.dss`, `voltage_upgrades.dss` | Stage edit scripts |
//! | `upgraded_master.dss` | Redirect chain: base circuit, then each stage |
//!
//! Call [`logging::init_tracing`] once per process to see progress.

pub mod logging;
pub mod results;
pub mod run;

pub use results::{
    equipment_details, summarize, EquipmentDetail, SummaryStage, UpgradeViolationResultModel,
};
pub use run::{derate_commands, run_upgrades, CategoryResult, UpgradeJob, UpgradeRunOutput};
