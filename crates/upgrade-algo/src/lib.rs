//! # upgrade-algo: Feeder Upgrade Algorithms
//!
//! Decides which equipment changes bring a distribution feeder back within
//! its thermal and voltage limits, and what those changes cost.
//!
//! | Stage | Entry point | Resolves |
//! |-------|-------------|----------|
//! | Thermal | [`run_thermal_upgrades`] | Line and transformer overloads |
//! | Voltage | [`run_voltage_upgrades`] | Bus over- and undervoltage |
//! | Cost | [`compute_costs`] | Prices the coalesced actions |
//!
//! Every algorithm works against [`upgrade_core::SimulationSession`] and
//! records what it changed in an [`upgrade_core::ActionLog`]. On return from
//! any stage the live circuit equals the base circuit with the log replayed.
//!
//! ## Example
//!
//! ```
//! use upgrade_algo::test_utils::TestFeeder;
//! use upgrade_algo::{run_voltage_upgrades, VoltageUpgradeParams};
//! use upgrade_core::ActionLog;
//!
//! let mut feeder = TestFeeder::new("src").with_line("l1", "src", "a", 100.0, 400.0);
//! let outcome =
//!     run_voltage_upgrades(&mut feeder, &VoltageUpgradeParams::default(), ActionLog::new())
//!         .unwrap();
//! assert!(!outcome.violations_present());
//! ```

pub mod catalog;
pub mod config;
pub mod cost;
pub mod detect;
pub mod placement;
pub mod severity;
pub mod test_utils;
pub mod thermal;
pub mod voltage;

pub use catalog::{Conductor, LineOption, TechnicalCatalog, TransformerOption};
pub use config::{
    operating_points, LoadMultipliers, ThermalUpgradeParams, TimepointMultipliers, UpgradeConfig,
    UpgradeKind, VoltageUpgradeParams,
};
pub use cost::{compute_costs, CostCatalog, CostReport, CostTotal, CostType, EquipmentCost};
pub use detect::{
    detect_lines, detect_transformers, detect_voltages, Detection, LoadedEquipment,
    VoltageDetection,
};
pub use placement::{run_placement, PlacementOption};
pub use severity::{deviation_severity, measure, Severity};
pub use thermal::{run_thermal_upgrades, NameGenerator, ThermalOutcome};
pub use voltage::{run_voltage_upgrades, StageReport, VoltageOutcome, VoltageStage};
