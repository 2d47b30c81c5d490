//! Typed equipment snapshots read from the simulation session.
//!
//! Records are point-in-time copies; the engine never mutates them. After
//! every edit a fresh snapshot is taken from the session.

use crate::units::{Amperes, KilovoltAmperes, Kilovolts, LengthUnit, Meters, Volts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Loading status of a line or transformer against a configured upper limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingStatus {
    Normal,
    Overloaded,
    Unloaded,
}

impl LoadingStatus {
    pub fn classify(per_unit_loading: f64, upper_limit: f64) -> Self {
        if per_unit_loading > upper_limit {
            LoadingStatus::Overloaded
        } else if per_unit_loading <= 0.0 {
            LoadingStatus::Unloaded
        } else {
            LoadingStatus::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinePlacement {
    Overhead,
    Underground,
}

impl LinePlacement {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "overhead" | "oh" => Some(LinePlacement::Overhead),
            "underground" | "ug" => Some(LinePlacement::Underground),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinePlacement::Overhead => "overhead",
            LinePlacement::Underground => "underground",
        }
    }
}

/// Winding connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    #[default]
    Wye,
    Delta,
}

impl Connection {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wye" | "y" | "ln" => Some(Connection::Wye),
            "delta" | "d" | "ll" => Some(Connection::Delta),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Connection::Wye => "wye",
            Connection::Delta => "delta",
        }
    }
}

/// Strip the node suffix from a bus reference (`bus7.1.2` -> `bus7`).
pub fn bus_name(reference: &str) -> String {
    reference
        .split('.')
        .next()
        .unwrap_or(reference)
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    pub name: String,
    pub bus1: String,
    pub bus2: String,
    pub phases: u32,
    /// Line-to-line voltage class of the line's buses.
    pub kv: Kilovolts,
    pub normamps: Amperes,
    pub emergamps: Amperes,
    pub length: f64,
    pub length_units: LengthUnit,
    pub linecode: Option<String>,
    pub geometry: Option<String>,
    pub is_switch: bool,
    pub line_placement: Option<LinePlacement>,
    pub enabled: bool,
    /// Largest phase current observed in the snapshot.
    pub max_amp_loading: Amperes,
    /// Display-only pass-through fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl LineRecord {
    pub fn per_unit_loading(&self) -> f64 {
        if self.normamps.value() <= 0.0 {
            0.0
        } else {
            self.max_amp_loading / self.normamps
        }
    }

    pub fn status(&self, upper_limit: f64) -> LoadingStatus {
        LoadingStatus::classify(self.per_unit_loading(), upper_limit)
    }

    pub fn length_m(&self) -> Meters {
        self.length_units.to_meters(self.length)
    }

    /// Terminal number (1 or 2) connected to `bus`, if any.
    pub fn terminal_at(&self, bus: &str) -> Option<u32> {
        if bus_name(&self.bus1) == bus {
            Some(1)
        } else if bus_name(&self.bus2) == bus {
            Some(2)
        } else {
            None
        }
    }
}

impl Default for LineRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            bus1: String::new(),
            bus2: String::new(),
            phases: 3,
            kv: Kilovolts(12.47),
            normamps: Amperes(400.0),
            emergamps: Amperes(600.0),
            length: 0.0,
            length_units: LengthUnit::None,
            linecode: None,
            geometry: None,
            is_switch: false,
            line_placement: None,
            enabled: true,
            max_amp_loading: Amperes(0.0),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerRecord {
    pub name: String,
    pub buses: Vec<String>,
    pub phases: u32,
    pub windings: u32,
    pub conns: Vec<Connection>,
    pub kvs: Vec<Kilovolts>,
    pub kvas: Vec<KilovoltAmperes>,
    pub xhl: f64,
    pub percent_r: f64,
    pub enabled: bool,
    /// Largest winding-1 phase current observed in the snapshot.
    pub max_amp_loading: Amperes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl TransformerRecord {
    pub fn rated_kva(&self) -> KilovoltAmperes {
        self.kvas.first().copied().unwrap_or_default()
    }

    pub fn primary_kv(&self) -> Kilovolts {
        self.kvs.first().copied().unwrap_or_default()
    }

    /// Rated winding-1 current.
    pub fn rated_amps(&self) -> Amperes {
        self.rated_kva().rated_current(self.primary_kv(), self.phases)
    }

    pub fn per_unit_loading(&self) -> f64 {
        let rated = self.rated_amps();
        if rated.value() <= 0.0 {
            0.0
        } else {
            self.max_amp_loading / rated
        }
    }

    pub fn status(&self, upper_limit: f64) -> LoadingStatus {
        LoadingStatus::classify(self.per_unit_loading(), upper_limit)
    }

    pub fn bus_names(&self) -> Vec<String> {
        self.buses.iter().map(|b| bus_name(b)).collect()
    }

    pub fn connects(&self, bus: &str) -> bool {
        self.buses.iter().any(|b| bus_name(b) == bus)
    }
}

impl Default for TransformerRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            buses: Vec::new(),
            phases: 3,
            windings: 2,
            conns: vec![Connection::Wye, Connection::Wye],
            kvs: vec![Kilovolts(12.47), Kilovolts(0.48)],
            kvas: vec![KilovoltAmperes(500.0), KilovoltAmperes(500.0)],
            xhl: 7.0,
            percent_r: 0.5,
            enabled: true,
            max_amp_loading: Amperes(0.0),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacitorRecord {
    pub name: String,
    pub bus: String,
    pub phases: u32,
    pub kv: Kilovolts,
    pub kvar: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapControlType {
    Voltage,
    Current,
    Kvar,
    Time,
    Pf,
}

impl CapControlType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "voltage" | "v" => Some(CapControlType::Voltage),
            "current" | "i" => Some(CapControlType::Current),
            "kvar" => Some(CapControlType::Kvar),
            "time" | "t" => Some(CapControlType::Time),
            "pf" => Some(CapControlType::Pf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapControlType::Voltage => "voltage",
            CapControlType::Current => "current",
            CapControlType::Kvar => "kvar",
            CapControlType::Time => "time",
            CapControlType::Pf => "pf",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapControlRecord {
    pub name: String,
    pub capacitor: String,
    /// Monitored line.
    pub element: String,
    pub terminal: u32,
    pub control_type: CapControlType,
    pub on_setting: f64,
    pub off_setting: f64,
    pub pt_ratio: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegControlRecord {
    pub name: String,
    pub transformer: String,
    pub winding: u32,
    pub vreg: Volts,
    pub band: Volts,
    pub pt_ratio: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRecord {
    pub name: String,
    /// Line-to-line base voltage.
    pub kv_base: Kilovolts,
    pub phases: u32,
    pub x: Option<f64>,
    pub y: Option<f64>,
}

/// Per-bus voltage extremes across phases, in per-unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusVoltage {
    pub bus: String,
    pub max_pu: f64,
    pub min_pu: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvSystemRecord {
    pub name: String,
    pub bus: String,
    pub kva: KilovoltAmperes,
    pub pmpp: f64,
    pub enabled: bool,
}

/// Linecode defined in the circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineCodeRecord {
    pub name: String,
    pub phases: u32,
    pub normamps: Amperes,
    pub emergamps: Amperes,
    pub units: LengthUnit,
    /// Impedance and other pass-through properties, rendered verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Line geometry defined in the circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineGeometryRecord {
    pub name: String,
    pub phases: u32,
    pub conductors: u32,
    pub normamps: Amperes,
    pub emergamps: Amperes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Load level and PV state at which the circuit is solved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatingPoint {
    pub load_multiplier: f64,
    pub pv_enabled: bool,
}

impl OperatingPoint {
    pub const NOMINAL: OperatingPoint = OperatingPoint {
        load_multiplier: 1.0,
        pv_enabled: true,
    };

    pub fn with_pv(load_multiplier: f64) -> Self {
        Self {
            load_multiplier,
            pv_enabled: true,
        }
    }

    pub fn without_pv(load_multiplier: f64) -> Self {
        Self {
            load_multiplier,
            pv_enabled: false,
        }
    }
}

impl Default for OperatingPoint {
    fn default() -> Self {
        Self::NOMINAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loading_status_classification() {
        assert_eq!(LoadingStatus::classify(1.4, 1.25), LoadingStatus::Overloaded);
        assert_eq!(LoadingStatus::classify(1.25, 1.25), LoadingStatus::Normal);
        assert_eq!(LoadingStatus::classify(0.0, 1.25), LoadingStatus::Unloaded);
    }

    #[test]
    fn test_line_loading() {
        let line = LineRecord {
            name: "l1".into(),
            bus1: "a.1.2.3".into(),
            bus2: "b".into(),
            normamps: Amperes(400.0),
            max_amp_loading: Amperes(500.0),
            ..LineRecord::default()
        };
        assert!((line.per_unit_loading() - 1.25).abs() < 1e-12);
        assert_eq!(line.status(1.0), LoadingStatus::Overloaded);
        assert_eq!(line.terminal_at("a"), Some(1));
        assert_eq!(line.terminal_at("b"), Some(2));
        assert_eq!(line.terminal_at("c"), None);
    }

    #[test]
    fn test_transformer_loading_uses_winding_one() {
        let xfmr = TransformerRecord {
            name: "t1".into(),
            buses: vec!["a".into(), "b".into()],
            kvs: vec![Kilovolts(12.47), Kilovolts(0.48)],
            kvas: vec![KilovoltAmperes(500.0), KilovoltAmperes(500.0)],
            ..TransformerRecord::default()
        };
        let rated = xfmr.rated_amps();
        let loaded = TransformerRecord {
            max_amp_loading: rated * 1.4,
            ..xfmr
        };
        assert!((loaded.per_unit_loading() - 1.4).abs() < 1e-9);
        assert_eq!(loaded.status(1.25), LoadingStatus::Overloaded);
    }

    #[test]
    fn test_bus_name_strips_nodes() {
        assert_eq!(bus_name("Bus7.1.2"), "bus7");
        assert_eq!(bus_name("src"), "src");
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(Connection::parse("Delta"), Some(Connection::Delta));
        assert_eq!(LinePlacement::parse("UG"), Some(LinePlacement::Underground));
        assert_eq!(CapControlType::parse("kvar"), Some(CapControlType::Kvar));
    }
}
