//! Unit newtypes for distribution equipment ratings.
//!
//! Feeder equipment is rated in amperes (lines), kVA (transformers) and kV
//! (voltage class), while voltages are compared in per-unit or on a 120 V
//! secondary base for controller settings. Wrapping the raw `f64` values keeps
//! an ampacity from being compared against a kVA rating by accident.
//!
//! All types are `#[repr(transparent)]` so they cost nothing at runtime.
//!
//! ```
//! use upgrade_core::units::{Amperes, Kilovolts, KilovoltAmperes};
//!
//! let rated = KilovoltAmperes(500.0).rated_current(Kilovolts(12.47), 3);
//! assert!((rated.value() - 23.15).abs() < 0.01);
//! assert!(Amperes(30.0) > rated);
//! ```

use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Implements the arithmetic every rating newtype needs.
macro_rules! impl_unit_ops {
    ($type:ty, $unit_name:literal) => {
        impl Add for $type {
            type Output = Self;
            fn add(self, rhs: Self) -> Self::Output {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $type {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self::Output {
                Self(self.0 - rhs.0)
            }
        }

        impl Neg for $type {
            type Output = Self;
            fn neg(self) -> Self::Output {
                Self(-self.0)
            }
        }

        impl Mul<f64> for $type {
            type Output = Self;
            fn mul(self, rhs: f64) -> Self::Output {
                Self(self.0 * rhs)
            }
        }

        impl Div<f64> for $type {
            type Output = Self;
            fn div(self, rhs: f64) -> Self::Output {
                Self(self.0 / rhs)
            }
        }

        /// Ratio of two ratings of the same unit.
        impl Div<$type> for $type {
            type Output = f64;
            fn div(self, rhs: $type) -> Self::Output {
                self.0 / rhs.0
            }
        }

        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:.4} {}", self.0, $unit_name)
            }
        }

        impl $type {
            #[inline]
            pub const fn new(value: f64) -> Self {
                Self(value)
            }

            #[inline]
            pub const fn value(self) -> f64 {
                self.0
            }

            #[inline]
            pub fn max(self, other: Self) -> Self {
                Self(self.0.max(other.0))
            }

            #[inline]
            pub fn min(self, other: Self) -> Self {
                Self(self.0.min(other.0))
            }

            /// Equality within a relative tolerance, used when matching
            /// catalog rows that were typed in by hand.
            #[inline]
            pub fn approx_eq(self, other: Self) -> bool {
                approx_eq(self.0, other.0)
            }
        }

        impl std::iter::Sum for $type {
            fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
                Self(iter.map(|x| x.0).sum())
            }
        }

        impl<'a> std::iter::Sum<&'a $type> for $type {
            fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
                Self(iter.map(|x| x.0).sum())
            }
        }
    };
}

/// Relative tolerance used for rating comparisons.
pub const RATING_TOLERANCE: f64 = 1e-3;

/// Compare two ratings with [`RATING_TOLERANCE`] relative slack.
pub fn approx_eq(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= RATING_TOLERANCE * scale
}

/// Current in amperes (A)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Amperes(pub f64);

impl_unit_ops!(Amperes, "A");

/// Voltage in kilovolts (kV). Line-to-line unless stated otherwise.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Kilovolts(pub f64);

impl_unit_ops!(Kilovolts, "kV");

/// Apparent power in kilovolt-amperes (kVA)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct KilovoltAmperes(pub f64);

impl_unit_ops!(KilovoltAmperes, "kVA");

/// Voltage magnitude in per-unit (pu)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct PerUnit(pub f64);

impl_unit_ops!(PerUnit, "pu");

/// Voltage in volts on a controller's secondary base (usually 120 V)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Volts(pub f64);

impl_unit_ops!(Volts, "V");

/// Length in meters, the common unit for topology weights and per-meter costs.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Meters(pub f64);

impl_unit_ops!(Meters, "m");

impl Kilovolts {
    /// Line-to-neutral magnitude for a line-to-line rating.
    ///
    /// Single-phase equipment is already rated line-to-neutral.
    #[inline]
    pub fn line_to_neutral(self, phases: u32) -> Kilovolts {
        if phases > 1 {
            Kilovolts(self.0 / 3f64.sqrt())
        } else {
            self
        }
    }

    /// Potential transformer ratio that maps this voltage onto `secondary`.
    #[inline]
    pub fn pt_ratio(self, phases: u32, secondary: Volts) -> f64 {
        if secondary.0.abs() < 1e-12 {
            return 0.0;
        }
        self.line_to_neutral(phases).0 * 1000.0 / secondary.0
    }
}

impl KilovoltAmperes {
    /// Rated current at the given voltage.
    #[inline]
    pub fn rated_current(self, kv: Kilovolts, phases: u32) -> Amperes {
        if kv.0.abs() < 1e-12 {
            return Amperes(0.0);
        }
        if phases > 1 {
            Amperes(self.0 / (3f64.sqrt() * kv.0))
        } else {
            Amperes(self.0 / kv.0)
        }
    }
}

impl Amperes {
    /// Apparent power carried at the given voltage.
    #[inline]
    pub fn apparent_power(self, kv: Kilovolts, phases: u32) -> KilovoltAmperes {
        if phases > 1 {
            KilovoltAmperes(self.0 * 3f64.sqrt() * kv.0)
        } else {
            KilovoltAmperes(self.0 * kv.0)
        }
    }
}

impl Volts {
    /// Convert to per-unit on the given nominal secondary voltage.
    #[inline]
    pub fn to_per_unit(self, nominal: Volts) -> PerUnit {
        if nominal.0.abs() < 1e-12 {
            PerUnit(0.0)
        } else {
            PerUnit(self.0 / nominal.0)
        }
    }
}

impl PerUnit {
    /// Convert to volts on the given nominal secondary voltage.
    #[inline]
    pub fn to_volts(self, nominal: Volts) -> Volts {
        Volts(self.0 * nominal.0)
    }

    pub const ONE: Self = Self(1.0);
}

/// Length units accepted by the circuit description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    #[default]
    None,
    Mi,
    Kft,
    Km,
    M,
    Ft,
    In,
    Cm,
}

impl LengthUnit {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Some(LengthUnit::None),
            "mi" => Some(LengthUnit::Mi),
            "kft" => Some(LengthUnit::Kft),
            "km" => Some(LengthUnit::Km),
            "m" => Some(LengthUnit::M),
            "ft" => Some(LengthUnit::Ft),
            "in" => Some(LengthUnit::In),
            "cm" => Some(LengthUnit::Cm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LengthUnit::None => "none",
            LengthUnit::Mi => "mi",
            LengthUnit::Kft => "kft",
            LengthUnit::Km => "km",
            LengthUnit::M => "m",
            LengthUnit::Ft => "ft",
            LengthUnit::In => "in",
            LengthUnit::Cm => "cm",
        }
    }

    /// Meters per one unit. Unitless lengths are taken as meters.
    pub fn meters_per_unit(&self) -> f64 {
        match self {
            LengthUnit::None | LengthUnit::M => 1.0,
            LengthUnit::Mi => 1609.344,
            LengthUnit::Kft => 304.8,
            LengthUnit::Km => 1000.0,
            LengthUnit::Ft => 0.3048,
            LengthUnit::In => 0.0254,
            LengthUnit::Cm => 0.01,
        }
    }

    pub fn to_meters(&self, length: f64) -> Meters {
        Meters(length * self.meters_per_unit())
    }
}
