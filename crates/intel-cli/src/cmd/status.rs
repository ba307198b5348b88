use crate::output::{fmt_time, print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, entity_id: u64, json: bool) -> anyhow::Result<()> {
    let (_config, store) = super::open_store(root)?;
    let entity = store.require_entity(entity_id)?;
    let records = store.list_all(entity_id)?;

    if json {
        return print_json(&serde_json::json!({
            "entity": entity,
            "modules": records,
        }));
    }

    println!("{} (#{})\n", entity.name, entity.id);
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.module.to_string(),
                r.status.to_string(),
                fmt_time(r.last_completed_at),
                fmt_time(r.updated_at),
                r.error_message.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["MODULE", "STATUS", "COMPLETED", "UPDATED", "ERROR"], rows);
    Ok(())
}
