use super::{transformer_parameters, NameGenerator};
use crate::catalog::{TechnicalCatalog, TransformerOption};
use crate::config::ThermalUpgradeParams;
use crate::detect::Detection;
use tracing::debug;
use upgrade_core::{
    ActionLog, EditCommand, ElementClass, EquipmentParameters, EquipmentType, KilovoltAmperes,
    TransformerParameters, TransformerRecord, UpgradeAction, UpgradeError, UpgradeResult,
    UpgradeType,
};

/// Capacity the replacement must provide, on winding 1.
fn required_capacity(xfmr: &TransformerRecord, params: &ThermalUpgradeParams) -> KilovoltAmperes {
    let loading = xfmr.per_unit_loading();
    let carried = xfmr
        .max_amp_loading
        .apparent_power(xfmr.primary_kv(), xfmr.phases);
    let mut required = carried / params.transformer_design_pu;
    if loading > params.extreme_loading_threshold {
        required = required * (loading * 0.5);
    }
    required
}

fn option_parameters(option: &TransformerOption) -> TransformerParameters {
    TransformerParameters {
        phases: option.phases,
        windings: option.windings,
        conns: option.conns.clone(),
        kvs: option.kvs.clone(),
        kvas: option.kvas.clone(),
    }
}

fn kva_values(kvas: &[KilovoltAmperes]) -> Vec<f64> {
    kvas.iter().map(|k| k.value()).collect()
}

/// Plan edits for every overloaded transformer in `detection`.
pub fn plan_transformer_upgrades(
    detection: &Detection<TransformerRecord>,
    params: &ThermalUpgradeParams,
    catalog: &TechnicalCatalog,
    names: &mut NameGenerator,
    log: &mut ActionLog,
) -> UpgradeResult<Vec<EditCommand>> {
    let mut commands = Vec::new();
    for name in &detection.violated {
        let Some(xfmr) = detection.get(name) else {
            continue;
        };
        let required = required_capacity(xfmr, params);
        let ceiling = required * params.oversize_limit;
        let candidates = catalog.transformer_candidates(xfmr);

        let fitting = candidates
            .iter()
            .find(|o| o.rated_kva() >= required)
            .filter(|o| o.rated_kva() <= ceiling)
            .filter(|o| !o.rated_kva().approx_eq(xfmr.rated_kva()));

        if let Some(option) = fitting {
            debug!(
                transformer = %xfmr.name,
                required = required.value(),
                option = %option.name,
                "upgrading transformer in place"
            );
            commands.push(
                EditCommand::edit(ElementClass::Transformer, &xfmr.name)
                    .with_list("kvas", &kva_values(&option.kvas))
                    .with("xhl", option.xhl)
                    .with("%r", option.percent_r),
            );
            log.record(UpgradeAction::remove(
                EquipmentType::Transformer,
                UpgradeType::Upgrade,
                &xfmr.name,
                EquipmentParameters::Transformer(transformer_parameters(xfmr)),
            ));
            log.record(UpgradeAction::add(
                EquipmentType::Transformer,
                UpgradeType::Upgrade,
                &xfmr.name,
                &xfmr.name,
                EquipmentParameters::Transformer(option_parameters(option)),
            ));
            continue;
        }

        let unit = candidates
            .iter()
            .rev()
            .find(|o| o.rated_kva() <= ceiling)
            .map(|o| (*o).clone())
            .unwrap_or_else(|| TransformerOption::from_record(xfmr));
        let unit_kva = unit.rated_kva();
        if unit_kva.value() <= 0.0 {
            return Err(UpgradeError::Catalog(format!(
                "no usable parallel transformer for '{}'",
                xfmr.name
            )));
        }
        let shortfall = (required - xfmr.rated_kva()).value().max(0.0);
        let count = ((shortfall / unit_kva.value()).ceil() as usize).max(1);
        if count > params.parallel_transformer_limit {
            return Err(UpgradeError::CapacityLimit {
                equipment: format!("Transformer.{}", xfmr.name),
                required: count,
                limit: params.parallel_transformer_limit,
            });
        }
        debug!(
            transformer = %xfmr.name,
            required = required.value(),
            count,
            "adding parallel transformers"
        );
        let conns: Vec<&str> = unit.conns.iter().map(|c| c.as_str()).collect();
        let kvs: Vec<f64> = unit.kvs.iter().map(|k| k.value()).collect();
        for _ in 0..count {
            let new_name = names.next(&xfmr.name);
            commands.push(
                EditCommand::create(ElementClass::Transformer, &new_name)
                    .with("phases", unit.phases)
                    .with("windings", unit.windings)
                    .with_list("buses", &xfmr.buses)
                    .with_list("conns", &conns)
                    .with_list("kvs", &kvs)
                    .with_list("kvas", &kva_values(&unit.kvas))
                    .with("xhl", unit.xhl)
                    .with("%r", unit.percent_r),
            );
            log.record(UpgradeAction::add(
                EquipmentType::Transformer,
                UpgradeType::NewParallel,
                &xfmr.name,
                new_name,
                EquipmentParameters::Transformer(option_parameters(&unit)),
            ));
        }
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::detect_transformers;
    use crate::test_utils::TestFeeder;
    use upgrade_core::{Kilovolts, SimulationSession};

    fn xfmr() -> TransformerRecord {
        TransformerRecord {
            name: "t1".into(),
            buses: vec!["a".into(), "lv".into()],
            kvs: vec![Kilovolts(12.47), Kilovolts(0.48)],
            kvas: vec![KilovoltAmperes(500.0), KilovoltAmperes(500.0)],
            ..TransformerRecord::default()
        }
    }

    fn option(kva: f64) -> TransformerOption {
        TransformerOption {
            name: format!("xfmr_{}", kva),
            kvas: vec![KilovoltAmperes(kva), KilovoltAmperes(kva)],
            ..TransformerOption::from_record(&xfmr())
        }
    }

    fn detection(loading_pu: f64) -> Detection<TransformerRecord> {
        let rated = xfmr().rated_amps().value();
        let mut feeder = TestFeeder::new("src")
            .with_line("l1", "src", "a", 100.0, 400.0)
            .with_transformer(xfmr())
            .with_load("lv", rated * loading_pu);
        feeder.reload(&[]).unwrap();
        detect_transformers(&mut feeder, 1.25, None, true).unwrap()
    }

    fn params() -> ThermalUpgradeParams {
        ThermalUpgradeParams {
            transformer_design_pu: 1.0,
            ..ThermalUpgradeParams::default()
        }
    }

    #[test]
    fn test_picks_smallest_satisfying_option() {
        let catalog = TechnicalCatalog {
            transformer_options: vec![option(500.0), option(750.0), option(1000.0)],
            ..TechnicalCatalog::default()
        };
        let mut log = ActionLog::new();
        let commands = plan_transformer_upgrades(
            &detection(1.4),
            &params(),
            &catalog,
            &mut NameGenerator::with_stamp("t"),
            &mut log,
        )
        .unwrap();
        assert_eq!(
            commands[0].to_string(),
            "Edit Transformer.t1 kvas=[750, 750] xhl=7 %r=0.5"
        );
        assert_eq!(log.actions().len(), 2);
    }

    #[test]
    fn test_parallel_transformer_duplicates_when_nothing_fits() {
        let mut log = ActionLog::new();
        let commands = plan_transformer_upgrades(
            &detection(1.4),
            &params(),
            &TechnicalCatalog::default(),
            &mut NameGenerator::with_stamp("t"),
            &mut log,
        )
        .unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].to_string(),
            "New Transformer.t1_upgrade_t_1 phases=3 windings=2 buses=[a, lv] conns=[wye, wye] kvs=[12.47, 0.48] kvas=[500, 500] xhl=7 %r=0.5"
        );
        assert_eq!(log.actions()[0].upgrade_type, UpgradeType::NewParallel);
    }

    #[test]
    fn test_transformer_parallel_limit() {
        let err = plan_transformer_upgrades(
            &detection(2.0),
            &ThermalUpgradeParams {
                parallel_transformer_limit: 0,
                ..params()
            },
            &TechnicalCatalog::default(),
            &mut NameGenerator::with_stamp("t"),
            &mut ActionLog::new(),
        )
        .unwrap_err();
        assert!(err.is_capacity_limit());
    }
}
