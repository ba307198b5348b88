//! Durable job state for intelligence modules, backed by redb.
//!
//! # Table design
//!
//! `MODULE_STATUS` uses a composite key:
//! ```text
//! [ entity_id: u64 big-endian (8 bytes) | module key: utf-8 bytes ]
//! ```
//!
//! All rows of one entity share the 8-byte prefix, so `list_all` is a single
//! prefix scan. Values are JSON-encoded `ModuleStatusRecord`s.
//!
//! Every write is an upsert performed inside one write transaction
//! (read, merge, insert, commit). redb serializes write transactions, so
//! concurrent upserts from parallel modules never lose each other's fields.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};

use crate::entity::EntityDescriptor;
use crate::error::{IntelError, Result};
use crate::registry::ModuleId;
use crate::status::{ModuleStatus, ModuleStatusRecord, StatusExtras};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Key: entity prefix ++ module key. Value: JSON `ModuleStatusRecord`.
const MODULE_STATUS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("module_status");

/// Key: entity id. Value: JSON `EntityDescriptor`.
const ENTITIES: TableDefinition<u64, &[u8]> = TableDefinition::new("entities");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn status_key(entity_id: u64, module: ModuleId) -> Vec<u8> {
    let name = module.as_str().as_bytes();
    let mut key = Vec::with_capacity(8 + name.len());
    key.extend_from_slice(&entity_id.to_be_bytes());
    key.extend_from_slice(name);
    key
}

fn store_err(e: impl std::fmt::Display) -> IntelError {
    IntelError::Store(e.to_string())
}

fn decode_record(bytes: &[u8]) -> Result<ModuleStatusRecord> {
    serde_json::from_slice(bytes).map_err(store_err)
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Persistent store for per-(entity, module) status records and entity
/// descriptors.
pub struct JobStore {
    db: Database,
}

impl JobStore {
    /// Open or create the database at `path`, creating both tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(MODULE_STATUS).map_err(store_err)?;
        wt.open_table(ENTITIES).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // Module status
    // -----------------------------------------------------------------------

    /// Upsert a module's status, stamping `updated_at` with the current time.
    pub fn upsert(
        &self,
        entity_id: u64,
        module: ModuleId,
        status: ModuleStatus,
        extras: StatusExtras,
    ) -> Result<ModuleStatusRecord> {
        self.upsert_at(entity_id, module, status, extras, Utc::now())
    }

    /// Upsert with an explicit clock value.
    pub fn upsert_at(
        &self,
        entity_id: u64,
        module: ModuleId,
        status: ModuleStatus,
        extras: StatusExtras,
        now: DateTime<Utc>,
    ) -> Result<ModuleStatusRecord> {
        let key = status_key(entity_id, module);
        let wt = self.db.begin_write().map_err(store_err)?;
        let record = {
            let mut table = wt.open_table(MODULE_STATUS).map_err(store_err)?;
            let existing = table
                .get(key.as_slice())
                .map_err(store_err)?
                .map(|v| v.value().to_vec());
            let mut record = match existing {
                Some(bytes) => decode_record(&bytes)?,
                None => ModuleStatusRecord::pending(module),
            };
            record.merge(status, extras, now);
            let value = serde_json::to_vec(&record).map_err(store_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
            record
        };
        wt.commit().map_err(store_err)?;
        Ok(record)
    }

    /// The stored record, or the implicit pending default.
    pub fn get(&self, entity_id: u64, module: ModuleId) -> Result<ModuleStatusRecord> {
        let key = status_key(entity_id, module);
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(MODULE_STATUS).map_err(store_err)?;
        match table.get(key.as_slice()).map_err(store_err)? {
            Some(v) => decode_record(v.value()),
            None => Ok(ModuleStatusRecord::pending(module)),
        }
    }

    /// Every registered module for `entity_id`, in catalog order, with
    /// missing rows filled in as pending.
    pub fn list_all(&self, entity_id: u64) -> Result<Vec<ModuleStatusRecord>> {
        let prefix = entity_id.to_be_bytes();
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(MODULE_STATUS).map_err(store_err)?;

        let mut stored = Vec::new();
        for entry in table.range(prefix.as_slice()..).map_err(store_err)? {
            let (k, v) = entry.map_err(store_err)?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            stored.push(decode_record(v.value())?);
        }

        Ok(ModuleId::ALL
            .into_iter()
            .map(|m| {
                stored
                    .iter()
                    .find(|r| r.module == m)
                    .cloned()
                    .unwrap_or_else(|| ModuleStatusRecord::pending(m))
            })
            .collect())
    }

    /// Reclassify `module` if it is stuck in `Running` for longer than
    /// `stale_after`. Returns the repaired status when a repair happened.
    ///
    /// The result and error message are left as they were; only the status
    /// and `updated_at` change.
    pub fn repair_stale(
        &self,
        entity_id: u64,
        module: ModuleId,
        stale_after: chrono::Duration,
    ) -> Result<Option<ModuleStatus>> {
        let now = Utc::now();
        let key = status_key(entity_id, module);
        let wt = self.db.begin_write().map_err(store_err)?;
        let repaired = {
            let mut table = wt.open_table(MODULE_STATUS).map_err(store_err)?;
            let existing = table
                .get(key.as_slice())
                .map_err(store_err)?
                .map(|v| v.value().to_vec());
            match existing {
                Some(bytes) => {
                    let mut record = decode_record(&bytes)?;
                    if record.is_stale(now, stale_after) {
                        record.status = record.repaired_status();
                        record.updated_at = Some(now);
                        let value = serde_json::to_vec(&record).map_err(store_err)?;
                        table
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(store_err)?;
                        Some(record.status)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        wt.commit().map_err(store_err)?;
        Ok(repaired)
    }

    /// Run `repair_stale` for every registered module of `entity_id`.
    pub fn repair_all_stale(
        &self,
        entity_id: u64,
        stale_after: chrono::Duration,
    ) -> Result<Vec<(ModuleId, ModuleStatus)>> {
        let mut repaired = Vec::new();
        for module in ModuleId::ALL {
            if let Some(status) = self.repair_stale(entity_id, module, stale_after)? {
                repaired.push((module, status));
            }
        }
        Ok(repaired)
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    pub fn put_entity(&self, entity: &EntityDescriptor) -> Result<()> {
        let value = serde_json::to_vec(entity).map_err(store_err)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(ENTITIES).map_err(store_err)?;
            table
                .insert(entity.id, value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn get_entity(&self, entity_id: u64) -> Result<Option<EntityDescriptor>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(ENTITIES).map_err(store_err)?;
        match table.get(entity_id).map_err(store_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value()).map_err(store_err)?)),
            None => Ok(None),
        }
    }

    /// Like `get_entity`, but a missing entity is `EntityNotFound`.
    pub fn require_entity(&self, entity_id: u64) -> Result<EntityDescriptor> {
        self.get_entity(entity_id)?
            .ok_or(IntelError::EntityNotFound(entity_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
