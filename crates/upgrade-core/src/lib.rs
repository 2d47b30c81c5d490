//! # upgrade-core: Feeder Upgrade Data Model
//!
//! Shared types for the upgrade-decision engine: typed equipment snapshots,
//! the edit-command model, the append-only action log and the
//! [`SimulationSession`] seam through which every algorithm talks to the
//! circuit engine.
//!
//! ## Design
//!
//! - **Snapshots, not handles**: equipment records are owned copies taken
//!   after each solve. Nothing in the engine mutates them.
//! - **Edits are data**: every change to the circuit is an [`EditCommand`].
//!   The ordered list of commands in an [`ActionLog`] is the replay script.
//! - **One session, exclusive access**: engine operations take
//!   `&mut impl SimulationSession`, so two stages can never touch the same
//!   circuit at once.
//!
//! ## Quick Start
//!
//! ```
//! use upgrade_core::*;
//!
//! let mut log = ActionLog::new();
//! let checkpoint = log.checkpoint();
//! log.push_command(EditCommand::edit(ElementClass::Line, "l12").with("normamps", 600.0));
//! assert_eq!(log.commands().len(), 1);
//! log.restore(checkpoint);
//! assert!(log.commands().is_empty());
//! ```

pub mod action_log;
pub mod command;
pub mod equipment;
pub mod error;
pub mod graph_utils;
pub mod session;
pub mod units;

pub use action_log::{
    ActionKind, ActionLog, CapControlSettings, Checkpoint, EquipmentParameters, EquipmentType,
    LineParameters, RegControlSettings, TransformerParameters, UpgradeAction, UpgradeType,
};
pub use command::{render_script, EditCommand, ElementClass, ElementRef, Verb};
pub use equipment::{
    bus_name, BusRecord, BusVoltage, CapControlRecord, CapControlType, CapacitorRecord,
    Connection, LineCodeRecord, LineGeometryRecord, LinePlacement, LineRecord, LoadingStatus,
    OperatingPoint, PvSystemRecord, RegControlRecord, TransformerRecord,
};
pub use error::{UpgradeError, UpgradeResult};
pub use graph_utils::{EdgeKind, FeederEdge, FeederGraph, TopologyStats};
pub use session::{SimulationSession, SolveStatus};
pub use units::{Amperes, KilovoltAmperes, Kilovolts, LengthUnit, Meters, PerUnit, Volts};
