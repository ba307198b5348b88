use crate::output::{fmt_time, print_json};
use clap::Subcommand;
use intel_core::entity::EntityDescriptor;
use std::path::Path;

#[derive(Subcommand, Debug)]
pub enum EntitySubcommand {
    /// Register or update an entity
    Set {
        id: u64,
        /// Registered legal title
        name: String,
        /// Shorter display name
        #[arg(long)]
        short_name: Option<String>,
    },
    /// Show a registered entity
    Show { id: u64 },
}

pub fn run(root: &Path, subcommand: EntitySubcommand, json: bool) -> anyhow::Result<()> {
    let (_config, store) = super::open_store(root)?;
    match subcommand {
        EntitySubcommand::Set {
            id,
            name,
            short_name,
        } => {
            if name.trim().is_empty() {
                anyhow::bail!("entity name must not be empty");
            }
            let short_name = short_name
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let entity = EntityDescriptor::new(id, name.trim(), short_name);
            store.put_entity(&entity)?;
            if json {
                print_json(&entity)
            } else {
                println!("Saved entity {} ({})", entity.id, entity.display_name());
                Ok(())
            }
        }
        EntitySubcommand::Show { id } => {
            let entity = store.require_entity(id)?;
            if json {
                return print_json(&entity);
            }
            println!("id:         {}", entity.id);
            println!("name:       {}", entity.name);
            println!("short name: {}", entity.short_name.as_deref().unwrap_or("-"));
            println!("updated:    {}", fmt_time(Some(entity.updated_at)));
            Ok(())
        }
    }
}
