use upgrade_algo::test_utils::TestFeeder;
use upgrade_algo::{
    compute_costs, run_voltage_upgrades, CostCatalog, CostType, VoltageStage,
    VoltageUpgradeParams,
};
use upgrade_algo::cost::{RegulatorCostRow, RegulatorPlacement};
use upgrade_core::{
    ActionLog, KilovoltAmperes, Kilovolts, RegControlRecord, SimulationSession, TransformerRecord,
    Volts,
};

/// Regulator `rc1` holds `a_reg` at 0.93 pu with a mis-set target.
fn regulated_feeder() -> TestFeeder {
    TestFeeder::new("src")
        .with_line("l1", "src", "a", 100.0, 400.0)
        .with_transformer(TransformerRecord {
            name: "reg1".into(),
            buses: vec!["a".into(), "a_reg".into()],
            kvs: vec![Kilovolts(12.47), Kilovolts(12.47)],
            kvas: vec![KilovoltAmperes(5000.0), KilovoltAmperes(5000.0)],
            ..TransformerRecord::default()
        })
        .with_line("l2", "a_reg", "b", 500.0, 400.0)
        .with_voltage("a_reg", 0.93)
        .with_reg_control(RegControlRecord {
            name: "rc1".into(),
            transformer: "reg1".into(),
            winding: 2,
            vreg: Volts(110.0),
            band: Volts(2.0),
            pt_ratio: 60.0,
            enabled: true,
        })
}

fn sagging_feeder() -> TestFeeder {
    TestFeeder::new("src")
        .with_line("l1", "src", "a", 100.0, 400.0)
        .with_line("l2", "a", "b", 200.0, 400.0)
        .with_line("l3", "b", "c", 200.0, 400.0)
        .with_voltage("b", 0.93)
}

fn voltages(feeder: &TestFeeder) -> Vec<(String, f64)> {
    feeder
        .bus_voltages()
        .into_iter()
        .map(|v| (v.bus, v.min_pu))
        .collect()
}

#[test]
fn existing_regulator_stage_resolves_undervoltage() {
    let mut feeder = regulated_feeder();
    let outcome =
        run_voltage_upgrades(&mut feeder, &VoltageUpgradeParams::default(), ActionLog::new())
            .unwrap();

    assert!(outcome.violations_present());
    assert!(outcome.final_severity.is_resolved());
    assert!(outcome.final_severity.improves_on(&outcome.initial_severity));

    let capacitor = outcome
        .stages
        .iter()
        .find(|s| s.stage == VoltageStage::Capacitor)
        .unwrap();
    assert!(!capacitor.accepted);
    let regulator = outcome
        .stages
        .iter()
        .find(|s| s.stage == VoltageStage::ExistingRegulator)
        .unwrap();
    assert!(regulator.accepted);
    assert!(outcome
        .log
        .commands()
        .iter()
        .any(|c| c.to_string().starts_with("Edit RegControl.rc1 vreg=")));
}

#[test]
fn live_state_matches_log_replay() {
    let mut feeder = regulated_feeder();
    let outcome =
        run_voltage_upgrades(&mut feeder, &VoltageUpgradeParams::default(), ActionLog::new())
            .unwrap();

    let mut replay = regulated_feeder();
    replay.reload(outcome.log.commands()).unwrap();
    assert_eq!(voltages(&replay), voltages(&feeder));
    assert_eq!(replay.reg_controls(), feeder.reg_controls());
}

#[test]
fn disabled_stages_leave_the_feeder_alone() {
    let mut feeder = regulated_feeder();
    let params = VoltageUpgradeParams {
        capacitor_action_flag: false,
        existing_regulator_sweep_action: false,
        ..VoltageUpgradeParams::default()
    };
    let outcome = run_voltage_upgrades(&mut feeder, &params, ActionLog::new()).unwrap();
    assert!(outcome.stages.is_empty());
    assert!(outcome.log.commands().is_empty());
    assert_eq!(outcome.final_severity, outcome.initial_severity);
}

#[test]
fn new_regulator_is_placed_and_priced() {
    let mut feeder = sagging_feeder();
    let params = VoltageUpgradeParams {
        place_new_regulators: true,
        ..VoltageUpgradeParams::default()
    };
    let outcome = run_voltage_upgrades(&mut feeder, &params, ActionLog::new()).unwrap();

    let placement = outcome
        .stages
        .iter()
        .find(|s| s.stage == VoltageStage::NewRegulator)
        .unwrap();
    assert!(placement.accepted);
    assert!(outcome.final_severity.is_resolved());

    let catalog = CostCatalog {
        regulators: vec![RegulatorCostRow {
            placement: RegulatorPlacement::InLine,
            phases: 3,
            kv: 12.47,
            kva: 8639.0,
            cost_usd: 95_000.0,
        }],
        ..CostCatalog::default()
    };
    let report = compute_costs(&[], &outcome.log.coalesced_actions(), &catalog).unwrap();
    assert_eq!(report.voltage.len(), 1);
    assert_eq!(report.voltage[0].cost_type, CostType::NewInLineRegulator);
    assert_eq!(report.voltage[0].count, 1);
    assert!((report.total_cost_usd - 95_000.0).abs() < 1e-6);
}
