//! # upgrade-io: Inputs and Outputs of an Upgrade Run
//!
//! - [`config`]: engine configuration from YAML, JSON or TOML
//! - [`catalog`]: technical catalogs (JSON) and cost catalogs (CSV directory or JSON)
//! - [`output`]: JSON result documents and DSS redirect chains
//!
//! Everything here returns [`anyhow::Result`] with the offending path in the
//! error context. Typed engine errors pass through unchanged and can be
//! recovered with `downcast_ref::<upgrade_core::UpgradeError>()`.

pub mod catalog;
pub mod config;
pub mod output;

pub use catalog::{load_cost_catalog, load_technical_catalog};
pub use config::load_config;
pub use output::{write_json, write_redirect_chain, write_script, RedirectChain};
