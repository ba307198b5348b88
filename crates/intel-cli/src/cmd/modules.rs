use crate::output::{print_json, print_table};
use intel_core::config::IntelConfig;
use intel_core::registry::ModuleId;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = IntelConfig::load(root)?.orchestrator.to_orchestrator_config();

    if json {
        let list: Vec<serde_json::Value> = ModuleId::ALL
            .into_iter()
            .map(|m| {
                let d = m.descriptor();
                serde_json::json!({
                    "id": d.id,
                    "phase": d.phase,
                    "title": d.title,
                    "timeout_secs": config.timeout_for(m).as_secs(),
                })
            })
            .collect();
        return print_json(&list);
    }

    let rows = ModuleId::ALL
        .into_iter()
        .map(|m| {
            let d = m.descriptor();
            vec![
                d.id.to_string(),
                d.phase.to_string(),
                format!("{}s", config.timeout_for(m).as_secs()),
                d.title.to_string(),
            ]
        })
        .collect();
    print_table(&["MODULE", "PHASE", "TIMEOUT", "TITLE"], rows);
    Ok(())
}
