//! Voltage severity metric.
//!
//! Severity is the sum, over every bus, of how far its worst-case voltage
//! sits outside the limits in per-unit. A bus both over and under (across
//! scenarios) contributes both distances. Zero means fully resolved; lower is
//! better. Every voltage stage ranks candidates with this one metric.

use crate::config::VoltageUpgradeParams;
use crate::detect::{detect_voltages, VoltageDetection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use upgrade_core::{BusVoltage, SimulationSession, UpgradeResult};

/// Distances below this are treated as equal.
pub const SEVERITY_TOLERANCE: f64 = 1e-9;

pub fn deviation_severity(voltages: &[BusVoltage], lower_limit: f64, upper_limit: f64) -> f64 {
    voltages
        .iter()
        .map(|v| (v.max_pu - upper_limit).max(0.0) + (lower_limit - v.min_pu).max(0.0))
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Severity {
    pub deviation: f64,
    pub violation_count: usize,
}

impl Severity {
    pub const ZERO: Severity = Severity {
        deviation: 0.0,
        violation_count: 0,
    };

    pub fn from_detection(detection: &VoltageDetection) -> Self {
        Self {
            deviation: deviation_severity(
                &detection.table,
                detection.lower_limit,
                detection.upper_limit,
            ),
            violation_count: detection.violation_count(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.violation_count == 0
    }

    /// Strict improvement; ties do not count.
    pub fn improves_on(&self, other: &Severity) -> bool {
        self.deviation < other.deviation - SEVERITY_TOLERANCE
    }

    pub fn compare(&self, other: &Severity) -> Ordering {
        self.deviation
            .partial_cmp(&other.deviation)
            .unwrap_or(Ordering::Equal)
    }
}

/// Detect voltages against the final limits and score them.
pub fn measure<S: SimulationSession>(
    session: &mut S,
    params: &VoltageUpgradeParams,
) -> UpgradeResult<(Severity, VoltageDetection)> {
    let detection = detect_voltages(
        session,
        params.final_lower_limit,
        params.final_upper_limit,
        params.timepoint_multipliers.as_ref(),
        false,
    )?;
    Ok((Severity::from_detection(&detection), detection))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(name: &str, max_pu: f64, min_pu: f64) -> BusVoltage {
        BusVoltage {
            bus: name.into(),
            max_pu,
            min_pu,
        }
    }

    #[test]
    fn test_deviation_sums_both_sides() {
        let voltages = vec![
            bus("a", 1.07, 1.0),
            bus("b", 1.0, 0.93),
            bus("c", 1.0, 0.99),
            bus("d", 1.06, 0.94),
        ];
        let severity = deviation_severity(&voltages, 0.95, 1.05);
        assert!((severity - (0.02 + 0.02 + 0.01 + 0.01)).abs() < 1e-12);
    }

    #[test]
    fn test_strict_improvement() {
        let a = Severity {
            deviation: 0.05,
            violation_count: 3,
        };
        let b = Severity {
            deviation: 0.05,
            violation_count: 1,
        };
        assert!(!b.improves_on(&a));
        assert!(Severity::ZERO.improves_on(&a));
        assert_eq!(a.compare(&Severity::ZERO), Ordering::Greater);
    }
}
