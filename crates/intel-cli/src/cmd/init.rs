use anyhow::Context;
use intel_core::config::IntelConfig;
use intel_core::{io, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing intel in: {}", root.display());

    let dir = paths::intel_dir(root);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config = IntelConfig::default();
    let yaml = render_config(&config)?;
    let written = io::write_if_missing(&paths::config_path(root), yaml.as_bytes())
        .context("failed to write config.yaml")?;
    if written {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    let (config, _store) = super::open_store(root)?;
    println!("  database: {}", config.database_path(root).display());

    let missing = intel_core::registry::ModuleId::ALL
        .into_iter()
        .filter(|m| config.executors.url_for(*m).is_none())
        .count();
    if missing > 0 {
        println!("\nSet executors.base_url in {} before running `intel serve`.", paths::CONFIG_FILE);
    }
    Ok(())
}

fn render_config(config: &IntelConfig) -> anyhow::Result<String> {
    let header = "# intel orchestrator configuration\n";
    let body = config.to_yaml().context("failed to render default config")?;
    Ok(format!("{header}{body}"))
}
