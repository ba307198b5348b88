use crate::output::print_json;
use std::path::Path;

/// Apply the stale-running repair to every module of `entity_id` now,
/// instead of waiting for the next run to do it.
pub fn run(root: &Path, entity_id: u64, json: bool) -> anyhow::Result<()> {
    let (config, store) = super::open_store(root)?;
    store.require_entity(entity_id)?;

    let stale_after = chrono::Duration::seconds(config.orchestrator.stale_after_secs as i64);
    let repaired = store.repair_all_stale(entity_id, stale_after)?;

    if json {
        let list: Vec<serde_json::Value> = repaired
            .iter()
            .map(|(module, status)| serde_json::json!({ "module": module, "status": status }))
            .collect();
        return print_json(&list);
    }

    if repaired.is_empty() {
        println!("No stale modules for entity {entity_id}.");
        return Ok(());
    }
    for (module, status) in &repaired {
        println!("  {module}: running → {status}");
    }
    Ok(())
}
