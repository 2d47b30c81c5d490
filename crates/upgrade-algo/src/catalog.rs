//! Technical catalog of upgrade options.
//!
//! Options come from two places: the feeder itself (every linecode,
//! geometry and transformer configuration already in service) and an
//! optional external catalog file. Options are grouped by the deciding
//! properties of the equipment they can replace:
//!
//! | Equipment | Deciding properties |
//! |-----------|---------------------|
//! | Line | phases, voltage class, switch flag, placement |
//! | Transformer | phases, winding count, connections, winding voltages |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use upgrade_core::{
    Amperes, Connection, EditCommand, ElementClass, KilovoltAmperes,
    Kilovolts, LineCodeRecord, LineGeometryRecord, LinePlacement, LineRecord, TransformerRecord,
    UpgradeError, UpgradeResult,
};

/// How a line option defines its conductors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Conductor {
    LineCode(String),
    Geometry(String),
}

impl Conductor {
    pub fn name(&self) -> &str {
        match self {
            Conductor::LineCode(name) | Conductor::Geometry(name) => name,
        }
    }

    /// `(property, value)` assignment that puts this conductor on a line.
    pub fn property(&self) -> (&'static str, &str) {
        match self {
            Conductor::LineCode(name) => ("linecode", name),
            Conductor::Geometry(name) => ("geometry", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineOption {
    pub conductor: Conductor,
    pub phases: u32,
    pub kv: Kilovolts,
    pub normamps: Amperes,
    pub emergamps: Amperes,
    #[serde(default)]
    pub line_placement: Option<LinePlacement>,
    #[serde(default)]
    pub is_switch: bool,
}

impl LineOption {
    pub fn matches(&self, line: &LineRecord) -> bool {
        self.phases == line.phases
            && self.kv.approx_eq(line.kv)
            && self.is_switch == line.is_switch
            && (self.line_placement.is_none()
                || line.line_placement.is_none()
                || self.line_placement == line.line_placement)
    }

    fn same_as(&self, other: &LineOption) -> bool {
        self.conductor == other.conductor
            && self.phases == other.phases
            && self.kv.approx_eq(other.kv)
            && self.is_switch == other.is_switch
            && self.line_placement == other.line_placement
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerOption {
    pub name: String,
    pub phases: u32,
    pub windings: u32,
    pub conns: Vec<Connection>,
    pub kvs: Vec<Kilovolts>,
    pub kvas: Vec<KilovoltAmperes>,
    #[serde(default = "default_xhl")]
    pub xhl: f64,
    #[serde(default = "default_percent_r")]
    pub percent_r: f64,
}

fn default_xhl() -> f64 {
    7.0
}

fn default_percent_r() -> f64 {
    0.5
}

impl TransformerOption {
    pub fn rated_kva(&self) -> KilovoltAmperes {
        self.kvas.first().copied().unwrap_or_default()
    }

    pub fn matches(&self, xfmr: &TransformerRecord) -> bool {
        self.phases == xfmr.phases
            && self.windings == xfmr.windings
            && self.conns == xfmr.conns
            && self.kvs.len() == xfmr.kvs.len()
            && self
                .kvs
                .iter()
                .zip(&xfmr.kvs)
                .all(|(a, b)| a.approx_eq(*b))
    }

    /// Option mirroring an existing transformer.
    pub fn from_record(xfmr: &TransformerRecord) -> Self {
        Self {
            name: xfmr.name.clone(),
            phases: xfmr.phases,
            windings: xfmr.windings,
            conns: xfmr.conns.clone(),
            kvs: xfmr.kvs.clone(),
            kvas: xfmr.kvas.clone(),
            xhl: xfmr.xhl,
            percent_r: xfmr.percent_r,
        }
    }

    fn same_as(&self, other: &TransformerOption) -> bool {
        self.phases == other.phases
            && self.windings == other.windings
            && self.conns == other.conns
            && self.kvs.len() == other.kvs.len()
            && self.kvs.iter().zip(&other.kvs).all(|(a, b)| a.approx_eq(*b))
            && self.rated_kva().approx_eq(other.rated_kva())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechnicalCatalog {
    #[serde(default)]
    pub line_options: Vec<LineOption>,
    #[serde(default)]
    pub transformer_options: Vec<TransformerOption>,
    #[serde(default)]
    pub line_codes: Vec<LineCodeRecord>,
    #[serde(default)]
    pub line_geometries: Vec<LineGeometryRecord>,
}

impl TechnicalCatalog {
    /// Harvest options from equipment already in the feeder.
    pub fn from_feeder(lines: &[LineRecord], transformers: &[TransformerRecord]) -> Self {
        let mut catalog = TechnicalCatalog::default();
        for line in lines.iter().filter(|l| l.enabled) {
            let conductor = match (&line.linecode, &line.geometry) {
                (_, Some(geometry)) => Conductor::Geometry(geometry.clone()),
                (Some(code), None) => Conductor::LineCode(code.clone()),
                (None, None) => continue,
            };
            catalog.add_line_option(LineOption {
                conductor,
                phases: line.phases,
                kv: line.kv,
                normamps: line.normamps,
                emergamps: line.emergamps,
                line_placement: line.line_placement,
                is_switch: line.is_switch,
            });
        }
        for xfmr in transformers.iter().filter(|t| t.enabled) {
            catalog.add_transformer_option(TransformerOption::from_record(xfmr));
        }
        catalog
    }

    fn add_line_option(&mut self, option: LineOption) {
        if !self.line_options.iter().any(|o| o.same_as(&option)) {
            self.line_options.push(option);
        }
    }

    fn add_transformer_option(&mut self, option: TransformerOption) {
        if !self.transformer_options.iter().any(|o| o.same_as(&option)) {
            self.transformer_options.push(option);
        }
    }

    /// Merge `other` into `self`, skipping duplicates.
    pub fn merge(&mut self, other: TechnicalCatalog) {
        for option in other.line_options {
            self.add_line_option(option);
        }
        for option in other.transformer_options {
            self.add_transformer_option(option);
        }
        for code in other.line_codes {
            if !self.line_codes.iter().any(|c| c.name == code.name) {
                self.line_codes.push(code);
            }
        }
        for geometry in other.line_geometries {
            if !self.line_geometries.iter().any(|g| g.name == geometry.name) {
                self.line_geometries.push(geometry);
            }
        }
    }

    /// Options that can replace `line`, smallest ampacity first.
    pub fn line_candidates(&self, line: &LineRecord) -> Vec<&LineOption> {
        let mut group: Vec<&LineOption> = self
            .line_options
            .iter()
            .filter(|o| o.matches(line))
            .collect();
        group.sort_by(|a, b| {
            a.normamps
                .partial_cmp(&b.normamps)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.conductor.name().cmp(b.conductor.name()))
        });
        group
    }

    /// Options that can replace `xfmr`, smallest kVA first.
    pub fn transformer_candidates(&self, xfmr: &TransformerRecord) -> Vec<&TransformerOption> {
        let mut group: Vec<&TransformerOption> = self
            .transformer_options
            .iter()
            .filter(|o| o.matches(xfmr))
            .collect();
        group.sort_by(|a, b| {
            a.rated_kva()
                .partial_cmp(&b.rated_kva())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        group
    }

    /// Commands defining `conductor` when the circuit lacks it.
    ///
    /// `defined` holds the conductor names already present (in the circuit
    /// or written earlier in this run). A conductor that is neither defined
    /// nor in the catalog cannot be written and is a catalog error.
    pub fn definition_commands(
        &self,
        conductor: &Conductor,
        defined: &mut HashSet<String>,
    ) -> UpgradeResult<Vec<EditCommand>> {
        let key = conductor.name().to_ascii_lowercase();
        if defined.contains(&key) {
            return Ok(Vec::new());
        }
        let command = match conductor {
            Conductor::LineCode(name) => {
                let code = self
                    .line_codes
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        UpgradeError::Catalog(format!(
                            "linecode '{}' is not defined in the circuit or the technical catalog",
                            name
                        ))
                    })?;
                let mut cmd = EditCommand::create(ElementClass::LineCode, &code.name)
                    .with("nphases", code.phases)
                    .with("normamps", code.normamps.value())
                    .with("emergamps", code.emergamps.value())
                    .with("units", code.units.as_str());
                for (key, value) in &code.properties {
                    cmd = cmd.with(key, value);
                }
                cmd
            }
            Conductor::Geometry(name) => {
                let geometry = self
                    .line_geometries
                    .iter()
                    .find(|g| g.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        UpgradeError::Catalog(format!(
                            "line geometry '{}' is not defined in the circuit or the technical catalog",
                            name
                        ))
                    })?;
                let mut cmd = EditCommand::create(ElementClass::LineGeometry, &geometry.name)
                    .with("nconds", geometry.conductors)
                    .with("nphases", geometry.phases)
                    .with("normamps", geometry.normamps.value())
                    .with("emergamps", geometry.emergamps.value());
                for (key, value) in &geometry.properties {
                    cmd = cmd.with(key, value);
                }
                cmd
            }
        };
        defined.insert(key);
        Ok(vec![command])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use upgrade_core::LengthUnit;

    fn line(name: &str, code: &str, amps: f64) -> LineRecord {
        LineRecord {
            name: name.into(),
            bus1: "a".into(),
            bus2: "b".into(),
            linecode: Some(code.into()),
            normamps: Amperes(amps),
            emergamps: Amperes(amps * 1.5),
            ..LineRecord::default()
        }
    }

    #[test]
    fn test_from_feeder_dedups_and_sorts() {
        let lines = vec![
            line("l1", "lc_600", 600.0),
            line("l2", "lc_400", 400.0),
            line("l3", "lc_600", 600.0),
        ];
        let catalog = TechnicalCatalog::from_feeder(&lines, &[]);
        assert_eq!(catalog.line_options.len(), 2);
        let group = catalog.line_candidates(&lines[0]);
        assert_eq!(group[0].conductor, Conductor::LineCode("lc_400".into()));
        assert_eq!(group[1].normamps, Amperes(600.0));
    }

    #[test]
    fn test_candidates_respect_deciding_properties() {
        let catalog = TechnicalCatalog::from_feeder(&[line("l1", "lc_600", 600.0)], &[]);
        let mut single_phase = line("l9", "lc_1ph", 100.0);
        single_phase.phases = 1;
        assert!(catalog.line_candidates(&single_phase).is_empty());
        let mut switch = line("sw", "lc_600", 600.0);
        switch.is_switch = true;
        assert!(catalog.line_candidates(&switch).is_empty());
    }

    #[test]
    fn test_merge_skips_duplicates() {
        let xfmr = TransformerRecord {
            name: "t1".into(),
            buses: vec!["a".into(), "b".into()],
            ..TransformerRecord::default()
        };
        let mut catalog = TechnicalCatalog::from_feeder(&[], &[xfmr.clone()]);
        let mut bigger = TransformerOption::from_record(&xfmr);
        bigger.name = "t_750".into();
        bigger.kvas = vec![KilovoltAmperes(750.0), KilovoltAmperes(750.0)];
        catalog.merge(TechnicalCatalog {
            transformer_options: vec![TransformerOption::from_record(&xfmr), bigger],
            ..TechnicalCatalog::default()
        });
        assert_eq!(catalog.transformer_options.len(), 2);
        let group = catalog.transformer_candidates(&xfmr);
        assert_eq!(group.last().map(|o| o.name.as_str()), Some("t_750"));
    }

    #[test]
    fn test_definition_commands() {
        let catalog = TechnicalCatalog {
            line_codes: vec![LineCodeRecord {
                name: "lc_800".into(),
                phases: 3,
                normamps: Amperes(800.0),
                emergamps: Amperes(1000.0),
                units: LengthUnit::Kft,
                properties: BTreeMap::from([("r1".to_string(), "0.05".to_string())]),
            }],
            ..TechnicalCatalog::default()
        };
        let mut defined = HashSet::from(["lc_400".to_string()]);

        let existing = catalog
            .definition_commands(&Conductor::LineCode("LC_400".into()), &mut defined)
            .unwrap();
        assert!(existing.is_empty());

        let new = catalog
            .definition_commands(&Conductor::LineCode("lc_800".into()), &mut defined)
            .unwrap();
        assert_eq!(
            new[0].to_string(),
            "New LineCode.lc_800 nphases=3 normamps=800 emergamps=1000 units=kft r1=0.05"
        );
        // Written once per run.
        assert!(catalog
            .definition_commands(&Conductor::LineCode("lc_800".into()), &mut defined)
            .unwrap()
            .is_empty());

        let err = catalog
            .definition_commands(&Conductor::Geometry("geo_x".into()), &mut defined)
            .unwrap_err();
        assert!(err.is_catalog());
    }
}
