//! Append-only log of upgrade actions and the edit commands that realise them.
//!
//! The log has two parallel streams:
//! - **commands**: the exact, ordered edits sent to the simulation session.
//!   Replaying them from the base circuit reproduces the live state.
//! - **actions**: typed [`UpgradeAction`] records describing what changed,
//!   which the cost engine and detail documents consume.
//!
//! Stages take a [`Checkpoint`] before trying edits and [`ActionLog::restore`]
//! to it when the edits are rejected. Restoring only truncates; nothing before
//! the cursor is ever rewritten.
//!
//! Record pairing rules:
//!
//! | upgrade_type | records |
//! |--------------|---------|
//! | `upgrade` | `remove` (original) + `add` (new), same `original_equipment_name` |
//! | `setting_change` | `remove` (original settings) + `add` (new settings) |
//! | `new_parallel`, `new_controller` | `add` only |

use crate::command::EditCommand;
use crate::equipment::{CapControlType, Connection, LinePlacement};
use crate::units::{Amperes, KilovoltAmperes, Kilovolts, Meters, Volts};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EquipmentType {
    Line,
    Transformer,
    CapControl,
    RegControl,
}

impl EquipmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentType::Line => "Line",
            EquipmentType::Transformer => "Transformer",
            EquipmentType::CapControl => "CapControl",
            EquipmentType::RegControl => "RegControl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeType {
    Upgrade,
    NewParallel,
    NewController,
    SettingChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineParameters {
    pub phases: u32,
    pub kv: Kilovolts,
    pub normamps: Amperes,
    pub emergamps: Amperes,
    pub length: Meters,
    pub linecode: Option<String>,
    pub geometry: Option<String>,
    pub line_placement: Option<LinePlacement>,
    pub is_switch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerParameters {
    pub phases: u32,
    pub windings: u32,
    pub conns: Vec<Connection>,
    pub kvs: Vec<Kilovolts>,
    pub kvas: Vec<KilovoltAmperes>,
}

impl TransformerParameters {
    pub fn rated_kva(&self) -> KilovoltAmperes {
        self.kvas.first().copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapControlSettings {
    pub capacitor: String,
    pub control_type: CapControlType,
    pub on_setting: f64,
    pub off_setting: f64,
    pub pt_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegControlSettings {
    pub transformer: String,
    pub vreg: Volts,
    pub band: Volts,
    pub pt_ratio: f64,
    /// Rating of the controlled transformer, used for cost matching.
    #[serde(default = "default_phases")]
    pub phases: u32,
    pub kv: Kilovolts,
    pub kva: KilovoltAmperes,
    /// Controller sits on the substation transformer.
    pub at_substation: bool,
    /// Transformer inserted together with a new controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_transformer: Option<TransformerParameters>,
}

fn default_phases() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "equipment", rename_all = "snake_case")]
pub enum EquipmentParameters {
    Line(LineParameters),
    Transformer(TransformerParameters),
    CapControl(CapControlSettings),
    RegControl(RegControlSettings),
}

impl EquipmentParameters {
    /// Settings equality used to drop no-op setting changes.
    fn same_settings(&self, other: &EquipmentParameters) -> bool {
        const EPS: f64 = 1e-9;
        match (self, other) {
            (EquipmentParameters::CapControl(a), EquipmentParameters::CapControl(b)) => {
                a.control_type == b.control_type
                    && (a.on_setting - b.on_setting).abs() < EPS
                    && (a.off_setting - b.off_setting).abs() < EPS
                    && (a.pt_ratio - b.pt_ratio).abs() < EPS
            }
            (EquipmentParameters::RegControl(a), EquipmentParameters::RegControl(b)) => {
                (a.vreg.value() - b.vreg.value()).abs() < EPS
                    && (a.band.value() - b.band.value()).abs() < EPS
                    && (a.pt_ratio - b.pt_ratio).abs() < EPS
            }
            _ => self == other,
        }
    }

    /// `self` with the controller settings of `other`; the rest of `self`
    /// (rating, inserted transformer) is kept.
    pub fn with_settings_of(&self, other: &EquipmentParameters) -> EquipmentParameters {
        match (self, other) {
            (EquipmentParameters::CapControl(base), EquipmentParameters::CapControl(last)) => {
                EquipmentParameters::CapControl(CapControlSettings {
                    control_type: last.control_type,
                    on_setting: last.on_setting,
                    off_setting: last.off_setting,
                    pt_ratio: last.pt_ratio,
                    ..base.clone()
                })
            }
            (EquipmentParameters::RegControl(base), EquipmentParameters::RegControl(last)) => {
                EquipmentParameters::RegControl(RegControlSettings {
                    vreg: last.vreg,
                    band: last.band,
                    pt_ratio: last.pt_ratio,
                    ..base.clone()
                })
            }
            _ => self.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeAction {
    pub equipment_type: EquipmentType,
    pub upgrade_type: UpgradeType,
    pub action: ActionKind,
    pub original_equipment_name: String,
    pub final_equipment_name: String,
    pub parameters: EquipmentParameters,
}

impl UpgradeAction {
    pub fn add(
        equipment_type: EquipmentType,
        upgrade_type: UpgradeType,
        original: impl Into<String>,
        final_name: impl Into<String>,
        parameters: EquipmentParameters,
    ) -> Self {
        Self {
            equipment_type,
            upgrade_type,
            action: ActionKind::Add,
            original_equipment_name: original.into(),
            final_equipment_name: final_name.into(),
            parameters,
        }
    }

    pub fn remove(
        equipment_type: EquipmentType,
        upgrade_type: UpgradeType,
        original: impl Into<String>,
        parameters: EquipmentParameters,
    ) -> Self {
        let original = original.into();
        Self {
            equipment_type,
            upgrade_type,
            action: ActionKind::Remove,
            final_equipment_name: original.clone(),
            original_equipment_name: original,
            parameters,
        }
    }
}

/// Cursor into an [`ActionLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    commands: usize,
    actions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    commands: Vec<EditCommand>,
    actions: Vec<UpgradeAction>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a log from a replay prefix that carries no upgrade actions.
    pub fn with_prefix(commands: Vec<EditCommand>) -> Self {
        Self {
            commands,
            actions: Vec::new(),
        }
    }

    pub fn push_command(&mut self, command: EditCommand) {
        self.commands.push(command);
    }

    pub fn extend_commands(&mut self, commands: impl IntoIterator<Item = EditCommand>) {
        self.commands.extend(commands);
    }

    pub fn record(&mut self, action: UpgradeAction) {
        self.actions.push(action);
    }

    pub fn record_all(&mut self, actions: impl IntoIterator<Item = UpgradeAction>) {
        self.actions.extend(actions);
    }

    pub fn commands(&self) -> &[EditCommand] {
        &self.commands
    }

    pub fn actions(&self) -> &[UpgradeAction] {
        &self.actions
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            commands: self.commands.len(),
            actions: self.actions.len(),
        }
    }

    /// Drop everything appended after `checkpoint`.
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.commands.truncate(checkpoint.commands);
        self.actions.truncate(checkpoint.actions);
    }

    pub fn commands_since(&self, checkpoint: Checkpoint) -> &[EditCommand] {
        &self.commands[checkpoint.commands.min(self.commands.len())..]
    }

    pub fn actions_since(&self, checkpoint: Checkpoint) -> &[UpgradeAction] {
        &self.actions[checkpoint.actions.min(self.actions.len())..]
    }

    /// Everything appended after `checkpoint`, as a log of its own.
    pub fn slice_since(&self, checkpoint: Checkpoint) -> ActionLog {
        ActionLog {
            commands: self.commands_since(checkpoint).to_vec(),
            actions: self.actions_since(checkpoint).to_vec(),
        }
    }

    pub fn has_changes_since(&self, checkpoint: Checkpoint) -> bool {
        self.commands.len() > checkpoint.commands || self.actions.len() > checkpoint.actions
    }

    /// Actions with repeated changes to the same equipment folded together.
    ///
    /// Equipment upgraded in place or re-set several times keeps its first
    /// `remove` (the original) and last `add` (the final state), emitted at
    /// the position of that last `add`. A setting change that ends on the
    /// original settings is dropped. Setting changes on a controller added by
    /// this log are folded into its `new_controller` record, which then
    /// carries the final settings. New parallel units pass through in order.
    pub fn coalesced_actions(&self) -> Vec<UpgradeAction> {
        type Key<'a> = (EquipmentType, UpgradeType, &'a str);

        let created: HashSet<(EquipmentType, &str)> = self
            .actions
            .iter()
            .filter(|a| a.upgrade_type == UpgradeType::NewController)
            .map(|a| (a.equipment_type, a.final_equipment_name.as_str()))
            .collect();
        let is_created = |a: &UpgradeAction| {
            created.contains(&(a.equipment_type, a.original_equipment_name.as_str()))
        };

        let mut first_remove: HashMap<Key<'_>, usize> = HashMap::new();
        let mut last_add: HashMap<Key<'_>, usize> = HashMap::new();
        let mut final_settings: HashMap<(EquipmentType, &str), usize> = HashMap::new();
        for (idx, action) in self.actions.iter().enumerate() {
            if !matches!(
                action.upgrade_type,
                UpgradeType::Upgrade | UpgradeType::SettingChange
            ) {
                continue;
            }
            if action.upgrade_type == UpgradeType::SettingChange && is_created(action) {
                if action.action == ActionKind::Add {
                    final_settings.insert(
                        (action.equipment_type, action.original_equipment_name.as_str()),
                        idx,
                    );
                }
                continue;
            }
            let key = (
                action.equipment_type,
                action.upgrade_type,
                action.original_equipment_name.as_str(),
            );
            match action.action {
                ActionKind::Remove => {
                    first_remove.entry(key).or_insert(idx);
                }
                ActionKind::Add => {
                    last_add.insert(key, idx);
                }
            }
        }

        let mut out = Vec::with_capacity(self.actions.len());
        for (idx, action) in self.actions.iter().enumerate() {
            match action.upgrade_type {
                UpgradeType::NewParallel => out.push(action.clone()),
                UpgradeType::NewController => {
                    let key = (action.equipment_type, action.final_equipment_name.as_str());
                    let mut record = action.clone();
                    if let Some(&last) = final_settings.get(&key) {
                        record.parameters = action
                            .parameters
                            .with_settings_of(&self.actions[last].parameters);
                    }
                    out.push(record);
                }
                UpgradeType::Upgrade | UpgradeType::SettingChange => {
                    if action.upgrade_type == UpgradeType::SettingChange && is_created(action) {
                        continue;
                    }
                    let key = (
                        action.equipment_type,
                        action.upgrade_type,
                        action.original_equipment_name.as_str(),
                    );
                    let (Some(&remove_idx), Some(&add_idx)) =
                        (first_remove.get(&key), last_add.get(&key))
                    else {
                        continue;
                    };
                    // Emit the surviving pair once, at the position of the final add.
                    if idx != add_idx {
                        continue;
                    }
                    let original = &self.actions[remove_idx];
                    if action.upgrade_type == UpgradeType::SettingChange
                        && original.parameters.same_settings(&action.parameters)
                    {
                        continue;
                    }
                    out.push(original.clone());
                    out.push(action.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ElementClass;

    fn reg_settings(vreg: f64) -> EquipmentParameters {
        EquipmentParameters::RegControl(RegControlSettings {
            transformer: "reg1".into(),
            vreg: Volts(vreg),
            band: Volts(2.0),
            pt_ratio: 60.0,
            phases: 3,
            kv: Kilovolts(12.47),
            kva: KilovoltAmperes(1000.0),
            at_substation: false,
            new_transformer: None,
        })
    }

    fn setting_pair(log: &mut ActionLog, from: f64, to: f64) {
        log.record(UpgradeAction::remove(
            EquipmentType::RegControl,
            UpgradeType::SettingChange,
            "rc1",
            reg_settings(from),
        ));
        log.record(UpgradeAction::add(
            EquipmentType::RegControl,
            UpgradeType::SettingChange,
            "rc1",
            "rc1",
            reg_settings(to),
        ));
    }

    #[test]
    fn test_checkpoint_restore_truncates_both_streams() {
        let mut log = ActionLog::with_prefix(vec![EditCommand::edit(ElementClass::PvSystem, "pv1")
            .with("kva", 4.0)]);
        let cp = log.checkpoint();
        log.push_command(EditCommand::edit(ElementClass::RegControl, "rc1").with("vreg", 121.0));
        setting_pair(&mut log, 120.0, 121.0);
        assert!(log.has_changes_since(cp));
        assert_eq!(log.commands_since(cp).len(), 1);
        assert_eq!(log.actions_since(cp).len(), 2);

        log.restore(cp);
        assert_eq!(log.commands().len(), 1);
        assert!(log.actions().is_empty());
        assert!(!log.has_changes_since(cp));
    }

    #[test]
    fn test_coalesce_keeps_first_original_and_last_final() {
        let mut log = ActionLog::new();
        setting_pair(&mut log, 120.0, 121.0);
        setting_pair(&mut log, 121.0, 122.5);
        let actions = log.coalesced_actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action, ActionKind::Remove);
        assert_eq!(actions[0].parameters, reg_settings(120.0));
        assert_eq!(actions[1].parameters, reg_settings(122.5));
    }

    #[test]
    fn test_coalesce_drops_round_trip_settings() {
        let mut log = ActionLog::new();
        setting_pair(&mut log, 120.0, 121.0);
        setting_pair(&mut log, 121.0, 120.0);
        assert!(log.coalesced_actions().is_empty());
    }

    #[test]
    fn test_coalesce_passes_other_actions_through() {
        let mut log = ActionLog::new();
        log.record(UpgradeAction::add(
            EquipmentType::RegControl,
            UpgradeType::NewController,
            "bus9",
            "newreg_bus9",
            reg_settings(120.0),
        ));
        setting_pair(&mut log, 120.0, 123.0);
        let actions = log.coalesced_actions();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].upgrade_type, UpgradeType::NewController);
    }

    #[test]
    fn test_new_controller_carries_final_settings() {
        let mut log = ActionLog::new();
        log.record(UpgradeAction::add(
            EquipmentType::RegControl,
            UpgradeType::NewController,
            "bus9",
            "rc1",
            reg_settings(120.0),
        ));
        setting_pair(&mut log, 120.0, 121.5);
        setting_pair(&mut log, 121.5, 123.0);
        let actions = log.coalesced_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].upgrade_type, UpgradeType::NewController);
        assert_eq!(actions[0].parameters, reg_settings(123.0));
    }

    #[test]
    fn test_new_cap_controller_keeps_capacitor_and_takes_thresholds() {
        let cap = |on: f64, off: f64| {
            EquipmentParameters::CapControl(CapControlSettings {
                capacitor: "c1".into(),
                control_type: CapControlType::Voltage,
                on_setting: on,
                off_setting: off,
                pt_ratio: 60.0,
            })
        };
        let mut log = ActionLog::new();
        log.record(UpgradeAction::add(
            EquipmentType::CapControl,
            UpgradeType::NewController,
            "c1",
            "c1_capcontrol",
            cap(110.0, 127.0),
        ));
        log.record(UpgradeAction::remove(
            EquipmentType::CapControl,
            UpgradeType::SettingChange,
            "c1_capcontrol",
            cap(110.0, 127.0),
        ));
        log.record(UpgradeAction::add(
            EquipmentType::CapControl,
            UpgradeType::SettingChange,
            "c1_capcontrol",
            "c1_capcontrol",
            cap(119.0, 121.0),
        ));
        let actions = log.coalesced_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].parameters, cap(119.0, 121.0));
    }

    #[test]
    fn test_repeated_upgrades_fold_to_one_pair() {
        let line = |amps: f64| {
            EquipmentParameters::Line(LineParameters {
                phases: 3,
                kv: Kilovolts(12.47),
                normamps: Amperes(amps),
                emergamps: Amperes(amps * 1.5),
                length: Meters(100.0),
                linecode: Some(format!("lc_{}", amps)),
                geometry: None,
                line_placement: None,
                is_switch: false,
            })
        };
        let mut log = ActionLog::new();
        for (from, to) in [(400.0, 600.0), (600.0, 900.0)] {
            log.record(UpgradeAction::remove(
                EquipmentType::Line,
                UpgradeType::Upgrade,
                "l1",
                line(from),
            ));
            log.record(UpgradeAction::add(
                EquipmentType::Line,
                UpgradeType::Upgrade,
                "l1",
                "l1",
                line(to),
            ));
        }
        log.record(UpgradeAction::add(
            EquipmentType::Line,
            UpgradeType::NewParallel,
            "l2",
            "l2_upgrade_x_1",
            line(400.0),
        ));
        let actions = log.coalesced_actions();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].action, ActionKind::Remove);
        assert_eq!(actions[0].parameters, line(400.0));
        assert_eq!(actions[1].parameters, line(900.0));
        assert_eq!(actions[2].upgrade_type, UpgradeType::NewParallel);
    }

    #[test]
    fn test_slice_since_keeps_only_later_entries() {
        let mut log = ActionLog::with_prefix(vec![
            EditCommand::edit(ElementClass::PvSystem, "pv1").with("kva", 8.0),
        ]);
        let stage = log.checkpoint();
        setting_pair(&mut log, 120.0, 123.0);
        log.push_command(EditCommand::edit(ElementClass::RegControl, "rc1").with("vreg", 123.0));
        let slice = log.slice_since(stage);
        assert_eq!(slice.commands().len(), 1);
        assert_eq!(slice.actions().len(), 2);
        assert_eq!(slice.coalesced_actions().len(), 2);
    }
}
