//! Process-wide log output.

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install a formatting subscriber at `level`. Fails if another global
/// subscriber is already set.
pub fn init_tracing(level: Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| anyhow!("setting default subscriber failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_an_error() {
        let _ = init_tracing(Level::WARN);
        assert!(init_tracing(Level::WARN).is_err());
    }
}
