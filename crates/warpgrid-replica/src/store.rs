//! Persisted cluster configuration for the local engine.
//!
//! One redb file per storage directory. Members are JSON-serialized into a
//! `u64 → &[u8]` table keyed by node id; replacing the configuration happens
//! in a single write transaction so recovery is all-or-nothing.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use thiserror::Error;
use tracing::debug;

use crate::membership::NodeInfo;

/// redb table for members: key = node id, value = JSON bytes.
const CLUSTER: TableDefinition<u64, &[u8]> = TableDefinition::new("cluster");

/// File name of the store inside the storage directory.
pub const STORE_FILE: &str = "cluster.redb";

/// Errors from the cluster store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open cluster store: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Convert any `Display` error into a `StoreError` variant.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// redb-backed cluster configuration.
#[derive(Clone)]
pub struct ClusterStore {
    db: Arc<Database>,
}

impl ClusterStore {
    /// Open (or create) the store inside `dir`.
    ///
    /// Fails if another live store already holds the file.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(STORE_FILE);
        let db = Database::create(&path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "cluster store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(CLUSTER).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// All members, ordered by id.
    pub fn load(&self) -> StoreResult<Vec<NodeInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTER).map_err(map_err!(Table))?;
        let mut members = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let info: NodeInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Serialize))?;
            members.push(info);
        }
        Ok(members)
    }

    /// Overwrite the whole configuration with `members`.
    pub fn replace(&self, members: &[NodeInfo]) -> StoreResult<()> {
        let encoded = members
            .iter()
            .map(|m| serde_json::to_vec(m).map(|v| (m.id, v)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTER).map_err(map_err!(Table))?;
            let keys: Vec<u64> = table
                .iter()
                .map_err(map_err!(Read))?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()
                .map_err(map_err!(Read))?;
            for key in keys {
                table.remove(key).map_err(map_err!(Write))?;
            }
            for (id, value) in &encoded {
                table
                    .insert(*id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(members = members.len(), "cluster configuration replaced");
        Ok(())
    }
}
