//! Unified error type for upgrade runs.
//!
//! Every failure that aborts a remediation run is one of the typed variants of
//! [`UpgradeError`]. The first four carry the engine's fatal taxonomy
//! (convergence, catalog, invariant, capacity); the rest are plumbing for I/O,
//! parsing and the simulation session.
//!
//! # Example
//!
//! ```
//! use upgrade_core::{UpgradeError, UpgradeResult};
//!
//! fn pick_option(found: bool) -> UpgradeResult<()> {
//!     if !found {
//!         return Err(UpgradeError::Catalog("no linecode 'lc_600'".into()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(pick_option(false).unwrap_err().is_catalog());
//! ```

use crate::command::EditCommand;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpgradeError {
    /// The solver failed to find a feasible solution.
    #[error("Convergence error: {0}")]
    Convergence(String),

    /// A required equipment definition is absent from the technical or cost catalog.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// A remediation step increased the violation count it should only decrease.
    ///
    /// `partial_log` holds every edit applied up to the failure so the run can
    /// be diagnosed offline.
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        message: String,
        partial_log: Vec<EditCommand>,
    },

    /// More parallel devices are required than the configured limit allows.
    #[error("Capacity limit exceeded for {equipment}: {required} parallel units required, limit is {limit}")]
    CapacityLimit {
        equipment: String,
        required: usize,
        limit: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Topology problems (unknown bus, disconnected feeder).
    #[error("Network error: {0}")]
    Network(String),

    /// Failures reported by the simulation session itself.
    #[error("Simulation error: {0}")]
    Simulation(String),

    #[error("{0}")]
    Other(String),
}

pub type UpgradeResult<T> = Result<T, UpgradeError>;

impl UpgradeError {
    pub fn is_convergence(&self) -> bool {
        matches!(self, UpgradeError::Convergence(_))
    }

    pub fn is_catalog(&self) -> bool {
        matches!(self, UpgradeError::Catalog(_))
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, UpgradeError::InvariantViolation { .. })
    }

    pub fn is_capacity_limit(&self) -> bool {
        matches!(self, UpgradeError::CapacityLimit { .. })
    }

    /// Edit log captured when an invariant violation was raised.
    pub fn partial_log(&self) -> Option<&[EditCommand]> {
        match self {
            UpgradeError::InvariantViolation { partial_log, .. } => Some(partial_log),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for UpgradeError {
    fn from(err: anyhow::Error) -> Self {
        UpgradeError::Other(err.to_string())
    }
}

impl From<String> for UpgradeError {
    fn from(s: String) -> Self {
        UpgradeError::Other(s)
    }
}

impl From<&str> for UpgradeError {
    fn from(s: &str) -> Self {
        UpgradeError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for UpgradeError {
    fn from(err: serde_json::Error) -> Self {
        UpgradeError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ElementClass, EditCommand};

    #[test]
    fn test_error_display() {
        let err = UpgradeError::Convergence("no solution at load multiplier 1.2".into());
        assert!(err.to_string().contains("Convergence error"));
        assert!(err.to_string().contains("1.2"));
    }

    #[test]
    fn test_capacity_limit_message() {
        let err = UpgradeError::CapacityLimit {
            equipment: "Line.l12".into(),
            required: 6,
            limit: 4,
        };
        assert!(err.is_capacity_limit());
        assert!(err.to_string().contains("6 parallel units"));
    }

    #[test]
    fn test_partial_log_is_carried() {
        let err = UpgradeError::InvariantViolation {
            message: "overloads increased".into(),
            partial_log: vec![EditCommand::edit(ElementClass::Line, "l1").with("normamps", 600.0)],
        };
        assert_eq!(err.partial_log().map(|log| log.len()), Some(1));
        assert!(UpgradeError::Other("x".into()).partial_log().is_none());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: UpgradeError = io_err.into();
        assert!(matches!(err, UpgradeError::Io(_)));
    }
}
