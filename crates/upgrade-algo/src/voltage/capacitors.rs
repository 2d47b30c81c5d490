//! Capacitor control stage.
//!
//! Every capacitor is put under voltage control with a PT ratio that maps its
//! rating onto the nominal secondary voltage. The on/off thresholds are then
//! swept outward from nominal in `capacitor_sweep_voltage_gap` steps while
//! both stay inside the initial limits, and the lowest-severity pair wins.

use super::{cap_settings, evaluate, UNSOLVED};
use crate::config::VoltageUpgradeParams;
use crate::severity::Severity;
use tracing::{debug, info, warn};
use upgrade_core::{
    bus_name, ActionLog, CapControlRecord, CapControlSettings, CapControlType, CapacitorRecord,
    EditCommand, ElementClass, EquipmentParameters, EquipmentType, LineRecord, SimulationSession,
    UpgradeAction, UpgradeResult, UpgradeType,
};

const PT_TOLERANCE: f64 = 1e-6;

fn record_setting_change(log: &mut ActionLog, name: &str, from: CapControlSettings, to: CapControlSettings) {
    log.record(UpgradeAction::remove(
        EquipmentType::CapControl,
        UpgradeType::SettingChange,
        name,
        EquipmentParameters::CapControl(from),
    ));
    log.record(UpgradeAction::add(
        EquipmentType::CapControl,
        UpgradeType::SettingChange,
        name,
        name,
        EquipmentParameters::CapControl(to),
    ));
}

fn controller_for<'a>(
    capacitor: &CapacitorRecord,
    controls: &'a [CapControlRecord],
) -> Option<&'a CapControlRecord> {
    controls
        .iter()
        .find(|cc| cc.enabled && cc.capacitor.eq_ignore_ascii_case(&capacitor.name))
}

/// Line a new controller monitors: a line touching the capacitor bus,
/// preferring one whose first terminal is that bus, then one whose phase
/// count matches the capacitor.
pub(crate) fn monitored_line<'a>(
    capacitor: &CapacitorRecord,
    lines: &'a [LineRecord],
) -> Option<(&'a LineRecord, u32)> {
    let bus = bus_name(&capacitor.bus);
    let mut touching: Vec<(&LineRecord, u32)> = lines
        .iter()
        .filter(|l| l.enabled)
        .filter_map(|l| l.terminal_at(&bus).map(|t| (l, t)))
        .collect();
    touching.sort_by(|(a, ta), (b, tb)| {
        ta.cmp(tb)
            .then_with(|| (a.phases != capacitor.phases).cmp(&(b.phases != capacitor.phases)))
            .then_with(|| a.name.cmp(&b.name))
    });
    touching.into_iter().next()
}

/// Bring every capacitor under voltage control. Returns the commands, which
/// are also appended to `log`.
fn normalize_controllers<S: SimulationSession>(
    session: &S,
    params: &VoltageUpgradeParams,
    capacitors: &[CapacitorRecord],
    log: &mut ActionLog,
) -> Vec<EditCommand> {
    let controls = session.cap_controls();
    let lines = session.lines();
    let (low, high) = params.initial_limits_volts();
    let nominal = params.nominal_volts();
    let mut commands = Vec::new();

    for cap in capacitors {
        let pt_ratio = cap.kv.pt_ratio(cap.phases, nominal);
        match controller_for(cap, &controls) {
            Some(cc) if cc.control_type != CapControlType::Voltage => {
                debug!(capcontrol = %cc.name, from = cc.control_type.as_str(), "switching capacitor control to voltage");
                commands.push(
                    EditCommand::edit(ElementClass::CapControl, &cc.name)
                        .with("type", CapControlType::Voltage.as_str())
                        .with("ptratio", pt_ratio)
                        .with("onsetting", low.value())
                        .with("offsetting", high.value()),
                );
                let to = CapControlSettings {
                    control_type: CapControlType::Voltage,
                    on_setting: low.value(),
                    off_setting: high.value(),
                    pt_ratio,
                    ..cap_settings(cc)
                };
                record_setting_change(log, &cc.name, cap_settings(cc), to);
            }
            Some(cc) if (cc.pt_ratio - pt_ratio).abs() > PT_TOLERANCE => {
                debug!(capcontrol = %cc.name, pt_ratio, "correcting capacitor PT ratio");
                commands.push(
                    EditCommand::edit(ElementClass::CapControl, &cc.name).with("ptratio", pt_ratio),
                );
                let to = CapControlSettings {
                    pt_ratio,
                    ..cap_settings(cc)
                };
                record_setting_change(log, &cc.name, cap_settings(cc), to);
            }
            Some(_) => {}
            None => {
                let Some((line, terminal)) = monitored_line(cap, &lines) else {
                    warn!(capacitor = %cap.name, "no line at capacitor bus, leaving it uncontrolled");
                    continue;
                };
                let name = format!("{}_capcontrol", cap.name);
                debug!(capcontrol = %name, line = %line.name, terminal, "adding capacitor controller");
                commands.push(
                    EditCommand::create(ElementClass::CapControl, &name)
                        .with("element", format!("Line.{}", line.name))
                        .with("terminal", terminal)
                        .with("capacitor", &cap.name)
                        .with("type", CapControlType::Voltage.as_str())
                        .with("ptratio", pt_ratio)
                        .with("onsetting", low.value())
                        .with("offsetting", high.value()),
                );
                log.record(UpgradeAction::add(
                    EquipmentType::CapControl,
                    UpgradeType::NewController,
                    &cap.name,
                    &name,
                    EquipmentParameters::CapControl(CapControlSettings {
                        capacitor: cap.name.clone(),
                        control_type: CapControlType::Voltage,
                        on_setting: low.value(),
                        off_setting: high.value(),
                        pt_ratio,
                    }),
                ));
            }
        }
    }
    log.extend_commands(commands.clone());
    commands
}

/// Threshold pairs to try, nearest to nominal first.
pub(crate) fn sweep_settings(params: &VoltageUpgradeParams) -> Vec<(f64, f64)> {
    let (low, high) = params.initial_limits_volts();
    let nominal = params.nominal_voltage * params.nominal_pu_voltage;
    let gap = params.capacitor_sweep_voltage_gap;
    let mut settings = Vec::new();
    let mut step = 1.0;
    loop {
        let on = nominal - step * gap;
        let off = nominal + step * gap;
        if on < low.value() || off > high.value() {
            break;
        }
        settings.push((on, off));
        step += 1.0;
    }
    settings
}

fn threshold_commands(controls: &[CapControlRecord], on: f64, off: f64) -> Vec<EditCommand> {
    controls
        .iter()
        .map(|cc| {
            EditCommand::edit(ElementClass::CapControl, &cc.name)
                .with("onsetting", on)
                .with("offsetting", off)
        })
        .collect()
}

/// Normalize controllers, then sweep thresholds. The session matches `log`
/// on return.
pub fn run_capacitor_stage<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
    log: &mut ActionLog,
) -> UpgradeResult<()> {
    let capacitors: Vec<CapacitorRecord> =
        session.capacitors().into_iter().filter(|c| c.enabled).collect();
    if capacitors.is_empty() {
        info!("no capacitors in circuit, skipping capacitor stage");
        return Ok(());
    }

    let commands = normalize_controllers(session, params, &capacitors, log);
    session.apply(&commands)?;
    let baseline = evaluate(session, params)?.unwrap_or(UNSOLVED);

    let controls: Vec<CapControlRecord> = session
        .cap_controls()
        .into_iter()
        .filter(|cc| {
            cc.enabled
                && cc.control_type == CapControlType::Voltage
                && capacitors
                    .iter()
                    .any(|cap| cap.name.eq_ignore_ascii_case(&cc.capacitor))
        })
        .collect();

    let mut best: Option<(f64, f64, Severity)> = None;
    for (on, off) in sweep_settings(params) {
        session.apply(&threshold_commands(&controls, on, off))?;
        let Some(severity) = evaluate(session, params)? else {
            debug!(on, off, "capacitor setting did not converge");
            continue;
        };
        debug!(on, off, severity = severity.deviation, "capacitor sweep point");
        if best.map_or(true, |(_, _, b)| severity.improves_on(&b)) {
            best = Some((on, off, severity));
        }
    }

    match best {
        Some((on, off, severity)) if severity.improves_on(&baseline) => {
            info!(on, off, severity = severity.deviation, "capacitor settings improved");
            log.extend_commands(threshold_commands(&controls, on, off));
            for cc in &controls {
                let to = CapControlSettings {
                    on_setting: on,
                    off_setting: off,
                    ..cap_settings(cc)
                };
                record_setting_change(log, &cc.name, cap_settings(cc), to);
            }
        }
        _ => info!("original capacitor settings are already best"),
    }
    session.reload(log.commands())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestFeeder;
    use upgrade_core::{Kilovolts, UpgradeType};

    fn capacitor() -> CapacitorRecord {
        CapacitorRecord {
            name: "c1".into(),
            bus: "a".into(),
            phases: 3,
            kv: Kilovolts(12.47),
            kvar: 600.0,
            enabled: true,
        }
    }

    fn low_voltage_feeder() -> TestFeeder {
        TestFeeder::new("src")
            .with_line("l1", "src", "a", 100.0, 400.0)
            .with_line("l2", "a", "b", 100.0, 400.0)
            .with_voltage("a", 0.93)
            .with_capacitor(capacitor())
    }

    #[test]
    fn test_sweep_settings_stay_inside_initial_limits() {
        let settings = sweep_settings(&VoltageUpgradeParams::default());
        assert_eq!(settings.first(), Some(&(119.0, 121.0)));
        assert_eq!(settings.last(), Some(&(114.0, 126.0)));
        assert_eq!(settings.len(), 6);
    }

    #[test]
    fn test_monitored_line_prefers_first_terminal() {
        let lines = vec![
            LineRecord {
                name: "into".into(),
                bus1: "src".into(),
                bus2: "a".into(),
                ..LineRecord::default()
            },
            LineRecord {
                name: "out".into(),
                bus1: "a.1.2.3".into(),
                bus2: "b".into(),
                ..LineRecord::default()
            },
        ];
        let (line, terminal) = monitored_line(&capacitor(), &lines).unwrap();
        assert_eq!(line.name, "out");
        assert_eq!(terminal, 1);
    }

    #[test]
    fn test_adds_controller_and_picks_improving_setting() {
        let mut feeder = low_voltage_feeder();
        let params = VoltageUpgradeParams::default();
        let mut log = ActionLog::new();
        feeder.reload(log.commands()).unwrap();
        run_capacitor_stage(&mut feeder, &params, &mut log).unwrap();

        let rendered: Vec<String> = log.commands().iter().map(|c| c.to_string()).collect();
        assert!(rendered[0].starts_with("New CapControl.c1_capcontrol element=Line.l2 terminal=1"));
        assert_eq!(
            rendered.last().map(String::as_str),
            Some("Edit CapControl.c1_capcontrol onsetting=119 offsetting=121")
        );
        assert_eq!(log.actions()[0].upgrade_type, UpgradeType::NewController);

        let coalesced = log.coalesced_actions();
        assert_eq!(coalesced.len(), 1);
        match &coalesced[0].parameters {
            EquipmentParameters::CapControl(settings) => {
                assert_eq!(settings.on_setting, 119.0);
                assert_eq!(settings.off_setting, 121.0);
            }
            other => panic!("unexpected parameters {:?}", other),
        }

        // The capacitor now switches on and lifts the bus into range.
        assert!((feeder.voltage("a").unwrap() - 0.96).abs() < 1e-9);
    }

    #[test]
    fn test_no_capacitors_is_a_no_op() {
        let mut feeder = TestFeeder::new("src").with_line("l1", "src", "a", 100.0, 400.0);
        let mut log = ActionLog::new();
        run_capacitor_stage(&mut feeder, &VoltageUpgradeParams::default(), &mut log).unwrap();
        assert!(log.commands().is_empty());
        assert!(log.actions().is_empty());
    }

    #[test]
    fn test_non_voltage_controller_is_normalized() {
        let mut feeder = low_voltage_feeder().with_cap_control(CapControlRecord {
            name: "cc1".into(),
            capacitor: "c1".into(),
            element: "l2".into(),
            terminal: 1,
            control_type: CapControlType::Kvar,
            on_setting: 300.0,
            off_setting: 100.0,
            pt_ratio: 1.0,
            enabled: true,
        });
        let mut log = ActionLog::new();
        feeder.reload(log.commands()).unwrap();
        run_capacitor_stage(&mut feeder, &VoltageUpgradeParams::default(), &mut log).unwrap();

        let first = log.commands()[0].to_string();
        assert!(first.starts_with("Edit CapControl.cc1 type=voltage ptratio=59.99"));
        assert!(first.ends_with("onsetting=110.004 offsetting=126.996"));
        let coalesced = log.coalesced_actions();
        assert_eq!(coalesced.len(), 2);
        match &coalesced[0].parameters {
            EquipmentParameters::CapControl(settings) => {
                assert_eq!(settings.control_type, CapControlType::Kvar)
            }
            other => panic!("unexpected parameters {:?}", other),
        }
    }
}
