pub mod config;
pub mod init;
pub mod receipt;
pub mod rollback;
pub mod run;

use anyhow::Context;
use enact_core::{config::Config, EnactClient};
use std::path::Path;

/// Load the project config and wire a client from it.
pub fn client(root: &Path) -> anyhow::Result<EnactClient> {
    let config = Config::load(root).context("failed to load config")?;
    EnactClient::from_config(&config, root).context("failed to set up connectors")
}
