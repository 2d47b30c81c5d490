//! Engine configuration.
//!
//! Every field has a default so a job file only needs to list what it
//! overrides. Loading from disk lives in `upgrade-io`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use upgrade_core::{OperatingPoint, UpgradeError, UpgradeResult, Volts};

/// Load multipliers at which the circuit is evaluated, split by PV state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadMultipliers {
    #[serde(default)]
    pub with_pv: Vec<f64>,
    #[serde(default)]
    pub without_pv: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimepointMultipliers {
    #[serde(default)]
    pub load_multipliers: LoadMultipliers,
}

impl TimepointMultipliers {
    /// Every combination to evaluate, PV-on points first.
    pub fn operating_points(&self) -> Vec<OperatingPoint> {
        let with = self
            .load_multipliers
            .with_pv
            .iter()
            .map(|&m| OperatingPoint::with_pv(m));
        let without = self
            .load_multipliers
            .without_pv
            .iter()
            .map(|&m| OperatingPoint::without_pv(m));
        with.chain(without).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.load_multipliers.with_pv.is_empty() && self.load_multipliers.without_pv.is_empty()
    }
}

/// Operating points for an optional multiplier set; nominal when absent.
pub fn operating_points(multipliers: Option<&TimepointMultipliers>) -> Vec<OperatingPoint> {
    match multipliers {
        Some(m) if !m.is_empty() => m.operating_points(),
        _ => vec![OperatingPoint::NOMINAL],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalUpgradeParams {
    #[serde(default = "default_line_upper_limit")]
    pub line_upper_limit: f64,
    #[serde(default = "default_design_pu")]
    pub line_design_pu: f64,
    #[serde(default = "default_transformer_upper_limit")]
    pub transformer_upper_limit: f64,
    #[serde(default = "default_design_pu")]
    pub transformer_design_pu: f64,
    #[serde(default = "default_final_upper")]
    pub voltage_upper_limit: f64,
    #[serde(default = "default_final_lower")]
    pub voltage_lower_limit: f64,
    #[serde(default = "default_extreme_loading_threshold")]
    pub extreme_loading_threshold: f64,
    #[serde(default = "default_oversize_limit")]
    pub oversize_limit: f64,
    #[serde(default = "default_parallel_limit")]
    pub parallel_lines_limit: usize,
    #[serde(default = "default_parallel_limit")]
    pub parallel_transformer_limit: usize,
    #[serde(default = "default_iteration_threshold")]
    pub upgrade_iteration_threshold: usize,
    #[serde(default)]
    pub timepoint_multipliers: Option<TimepointMultipliers>,
    #[serde(default)]
    pub read_external_catalog: bool,
    #[serde(default)]
    pub external_catalog: Option<PathBuf>,
}

fn default_line_upper_limit() -> f64 {
    1.0
}

fn default_design_pu() -> f64 {
    0.75
}

fn default_transformer_upper_limit() -> f64 {
    1.25
}

fn default_final_upper() -> f64 {
    1.05
}

fn default_final_lower() -> f64 {
    0.95
}

fn default_extreme_loading_threshold() -> f64 {
    2.25
}

fn default_oversize_limit() -> f64 {
    2.0
}

fn default_parallel_limit() -> usize {
    4
}

fn default_iteration_threshold() -> usize {
    5
}

impl Default for ThermalUpgradeParams {
    fn default() -> Self {
        Self {
            line_upper_limit: default_line_upper_limit(),
            line_design_pu: default_design_pu(),
            transformer_upper_limit: default_transformer_upper_limit(),
            transformer_design_pu: default_design_pu(),
            voltage_upper_limit: default_final_upper(),
            voltage_lower_limit: default_final_lower(),
            extreme_loading_threshold: default_extreme_loading_threshold(),
            oversize_limit: default_oversize_limit(),
            parallel_lines_limit: default_parallel_limit(),
            parallel_transformer_limit: default_parallel_limit(),
            upgrade_iteration_threshold: default_iteration_threshold(),
            timepoint_multipliers: None,
            read_external_catalog: false,
            external_catalog: None,
        }
    }
}

impl ThermalUpgradeParams {
    pub fn validate(&self) -> UpgradeResult<()> {
        if self.line_design_pu <= 0.0 || self.transformer_design_pu <= 0.0 {
            return Err(UpgradeError::Config(
                "design margins must be positive".to_string(),
            ));
        }
        if self.line_upper_limit <= 0.0 || self.transformer_upper_limit <= 0.0 {
            return Err(UpgradeError::Config(
                "loading limits must be positive".to_string(),
            ));
        }
        if self.voltage_lower_limit >= self.voltage_upper_limit {
            return Err(UpgradeError::Config(format!(
                "voltage lower limit {} must be below upper limit {}",
                self.voltage_lower_limit, self.voltage_upper_limit
            )));
        }
        if self.oversize_limit < 1.0 {
            return Err(UpgradeError::Config(format!(
                "oversize_limit must be at least 1.0, got {}",
                self.oversize_limit
            )));
        }
        if self.upgrade_iteration_threshold == 0 {
            return Err(UpgradeError::Config(
                "upgrade_iteration_threshold must be at least 1".to_string(),
            ));
        }
        if self.read_external_catalog && self.external_catalog.is_none() {
            return Err(UpgradeError::Config(
                "read_external_catalog is set but no external_catalog path is given".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageUpgradeParams {
    #[serde(default = "default_initial_upper")]
    pub initial_upper_limit: f64,
    #[serde(default = "default_initial_lower")]
    pub initial_lower_limit: f64,
    #[serde(default = "default_final_upper")]
    pub final_upper_limit: f64,
    #[serde(default = "default_final_lower")]
    pub final_lower_limit: f64,
    #[serde(default = "default_nominal_voltage")]
    pub nominal_voltage: f64,
    #[serde(default = "default_nominal_pu")]
    pub nominal_pu_voltage: f64,
    #[serde(default = "default_sweep_gap")]
    pub capacitor_sweep_voltage_gap: f64,
    #[serde(default = "default_bands")]
    pub reg_control_bands: Vec<f64>,
    #[serde(default = "default_reg_v_delta")]
    pub reg_v_delta: f64,
    #[serde(default = "default_max_regulators")]
    pub max_regulators: usize,
    #[serde(default)]
    pub place_new_regulators: bool,
    #[serde(default)]
    pub use_ltc_placement: bool,
    #[serde(default = "default_true")]
    pub capacitor_action_flag: bool,
    #[serde(default = "default_true")]
    pub existing_regulator_sweep_action: bool,
    #[serde(default = "default_max_control_iterations")]
    pub max_control_iterations: u32,
    #[serde(default = "default_max_control_iterations_retry")]
    pub max_control_iterations_retry: u32,
    #[serde(default = "default_band_widening_step")]
    pub band_widening_step: f64,
    #[serde(default = "default_violation_explosion_multiple")]
    pub violation_explosion_multiple: f64,
    #[serde(default)]
    pub timepoint_multipliers: Option<TimepointMultipliers>,
}

fn default_initial_upper() -> f64 {
    1.0583
}

fn default_initial_lower() -> f64 {
    0.9167
}

fn default_nominal_voltage() -> f64 {
    120.0
}

fn default_nominal_pu() -> f64 {
    1.0
}

fn default_sweep_gap() -> f64 {
    1.0
}

fn default_bands() -> Vec<f64> {
    vec![1.0, 2.0]
}

fn default_reg_v_delta() -> f64 {
    0.5
}

fn default_max_regulators() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_max_control_iterations() -> u32 {
    50
}

fn default_max_control_iterations_retry() -> u32 {
    200
}

fn default_band_widening_step() -> f64 {
    1.0
}

fn default_violation_explosion_multiple() -> f64 {
    5.0
}

impl Default for VoltageUpgradeParams {
    fn default() -> Self {
        Self {
            initial_upper_limit: default_initial_upper(),
            initial_lower_limit: default_initial_lower(),
            final_upper_limit: default_final_upper(),
            final_lower_limit: default_final_lower(),
            nominal_voltage: default_nominal_voltage(),
            nominal_pu_voltage: default_nominal_pu(),
            capacitor_sweep_voltage_gap: default_sweep_gap(),
            reg_control_bands: default_bands(),
            reg_v_delta: default_reg_v_delta(),
            max_regulators: default_max_regulators(),
            place_new_regulators: false,
            use_ltc_placement: false,
            capacitor_action_flag: true,
            existing_regulator_sweep_action: true,
            max_control_iterations: default_max_control_iterations(),
            max_control_iterations_retry: default_max_control_iterations_retry(),
            band_widening_step: default_band_widening_step(),
            violation_explosion_multiple: default_violation_explosion_multiple(),
            timepoint_multipliers: None,
        }
    }
}

impl VoltageUpgradeParams {
    pub fn nominal_volts(&self) -> Volts {
        Volts(self.nominal_voltage)
    }

    /// Sweep bounds on the controller secondary base.
    pub fn initial_limits_volts(&self) -> (Volts, Volts) {
        (
            Volts(self.initial_lower_limit * self.nominal_voltage),
            Volts(self.initial_upper_limit * self.nominal_voltage),
        )
    }

    pub fn validate(&self) -> UpgradeResult<()> {
        if self.initial_lower_limit >= self.initial_upper_limit {
            return Err(UpgradeError::Config(format!(
                "initial voltage limits are inverted: {} >= {}",
                self.initial_lower_limit, self.initial_upper_limit
            )));
        }
        if self.final_lower_limit >= self.final_upper_limit {
            return Err(UpgradeError::Config(format!(
                "final voltage limits are inverted: {} >= {}",
                self.final_lower_limit, self.final_upper_limit
            )));
        }
        if self.nominal_voltage <= 0.0 {
            return Err(UpgradeError::Config(
                "nominal_voltage must be positive".to_string(),
            ));
        }
        if self.capacitor_sweep_voltage_gap <= 0.0 || self.reg_v_delta <= 0.0 {
            return Err(UpgradeError::Config(
                "sweep step sizes must be positive".to_string(),
            ));
        }
        if self.reg_control_bands.is_empty() || self.reg_control_bands.iter().any(|b| *b <= 0.0) {
            return Err(UpgradeError::Config(
                "reg_control_bands must list at least one positive band".to_string(),
            ));
        }
        if self.max_control_iterations == 0 {
            return Err(UpgradeError::Config(
                "max_control_iterations must be at least 1".to_string(),
            ));
        }
        if self.violation_explosion_multiple < 1.0 {
            return Err(UpgradeError::Config(format!(
                "violation_explosion_multiple must be at least 1.0, got {}",
                self.violation_explosion_multiple
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeKind {
    Thermal,
    Voltage,
}

impl UpgradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeKind::Thermal => "thermal",
            UpgradeKind::Voltage => "voltage",
        }
    }
}

fn default_upgrade_order() -> Vec<UpgradeKind> {
    vec![UpgradeKind::Thermal, UpgradeKind::Voltage]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    #[serde(default)]
    pub thermal: ThermalUpgradeParams,
    #[serde(default)]
    pub voltage: VoltageUpgradeParams,
    #[serde(default = "default_upgrade_order")]
    pub upgrade_order: Vec<UpgradeKind>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            thermal: ThermalUpgradeParams::default(),
            voltage: VoltageUpgradeParams::default(),
            upgrade_order: default_upgrade_order(),
        }
    }
}

impl UpgradeConfig {
    pub fn validate(&self) -> UpgradeResult<()> {
        self.thermal.validate()?;
        self.voltage.validate()?;
        let mut seen = Vec::new();
        for kind in &self.upgrade_order {
            if seen.contains(kind) {
                return Err(UpgradeError::Config(format!(
                    "upgrade_order lists '{}' twice",
                    kind.as_str()
                )));
            }
            seen.push(*kind);
        }
        Ok(())
    }

    pub fn runs(&self, kind: UpgradeKind) -> bool {
        self.upgrade_order.contains(&kind)
    }
}
