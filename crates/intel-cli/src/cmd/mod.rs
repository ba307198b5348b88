pub mod entity;
pub mod init;
pub mod modules;
pub mod repair;
pub mod serve;
pub mod status;

use anyhow::Context;
use intel_core::config::IntelConfig;
use intel_core::store::JobStore;
use std::path::Path;

/// Load the config and open the database it points at.
pub(crate) fn open_store(root: &Path) -> anyhow::Result<(IntelConfig, JobStore)> {
    let config = IntelConfig::load(root).context("failed to load .intel/config.yaml")?;
    let db_path = config.database_path(root);
    let store = JobStore::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    Ok((config, store))
}
