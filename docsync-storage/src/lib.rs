//! Cold and hot storage collaborators (spec §4.4.2, §6.3): the persisted
//! snapshot of a document plus its write-ahead log of transactions since
//! that snapshot. Two implementations of each trait: an in-memory one for
//! tests and an engine that doesn't want real disk I/O, and a `redb`-backed
//! one for anything that needs to survive a restart.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use docsync_base::{err_kind, ErrorKind, Result};
use docsync_doc::Transaction;
use docsync_schema::Value;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

/// A document's durable snapshot (spec §6.3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub state: Value,
    pub version: u64,
    pub schema_version: u32,
    pub saved_at: u64,
}

/// One write-ahead log record (spec §6.3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub transaction: Transaction,
    pub version: u64,
    pub timestamp: u64,
}

/// What to do with a snapshot whose `schema_version` doesn't match what the
/// engine currently expects. No migration function is specified anywhere,
/// so the only policy is the spec's stated default: treat the mismatch as
/// if no snapshot existed at all. The variant name describes what happens
/// to the stale snapshot (rejected, not loaded), not an error outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum MigrationPolicy {
    #[default]
    RejectOnMismatch,
}

/// Reconcile a loaded snapshot against the schema version the caller
/// expects. A mismatch reconciles to `None`, i.e. "proceed as if cold
/// storage had nothing for this document".
pub fn reconcile_schema_version(stored: Option<StoredDocument>, expected_schema_version: u32, _policy: MigrationPolicy) -> Option<StoredDocument> {
    stored.filter(|doc| doc.schema_version == expected_schema_version)
}

#[async_trait]
pub trait ColdStorage: Send + Sync {
    async fn load(&self, document_id: &str) -> Result<Option<StoredDocument>>;
    async fn save(&self, document_id: &str, doc: &StoredDocument) -> Result<()>;
}

#[async_trait]
pub trait HotStorage: Send + Sync {
    async fn append(&self, document_id: &str, entry: &WalEntry) -> Result<()>;
    /// Entries with `version > since_version`, in ascending version order.
    async fn entries(&self, document_id: &str, since_version: u64) -> Result<Vec<WalEntry>>;
    /// Drop entries with `version <= up_to_version`.
    async fn truncate(&self, document_id: &str, up_to_version: u64) -> Result<()>;
}

/// In-memory [`ColdStorage`], for tests and for engines that don't need
/// durability across restarts.
#[derive(Default)]
pub struct InMemoryColdStorage {
    snapshots: Mutex<HashMap<String, StoredDocument>>,
}

impl InMemoryColdStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ColdStorage for InMemoryColdStorage {
    async fn load(&self, document_id: &str) -> Result<Option<StoredDocument>> {
        Ok(self.snapshots.lock().unwrap().get(document_id).cloned())
    }

    async fn save(&self, document_id: &str, doc: &StoredDocument) -> Result<()> {
        self.snapshots.lock().unwrap().insert(document_id.to_string(), doc.clone());
        Ok(())
    }
}

/// In-memory [`HotStorage`], keyed by document id, each a version-ordered
/// `Vec<WalEntry>`.
#[derive(Default)]
pub struct InMemoryHotStorage {
    logs: Mutex<HashMap<String, Vec<WalEntry>>>,
}

impl InMemoryHotStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HotStorage for InMemoryHotStorage {
    async fn append(&self, document_id: &str, entry: &WalEntry) -> Result<()> {
        self.logs.lock().unwrap().entry(document_id.to_string()).or_default().push(entry.clone());
        Ok(())
    }

    async fn entries(&self, document_id: &str, since_version: u64) -> Result<Vec<WalEntry>> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .get(document_id)
            .map(|v| v.iter().filter(|e| e.version > since_version).cloned().collect())
            .unwrap_or_default())
    }

    async fn truncate(&self, document_id: &str, up_to_version: u64) -> Result<()> {
        if let Some(entries) = self.logs.lock().unwrap().get_mut(document_id) {
            entries.retain(|e| e.version > up_to_version);
        }
        Ok(())
    }
}

const SNAPSHOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("docsync_snapshots");
const WAL_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("docsync_wal");

fn wal_key(document_id: &str, version: u64) -> String {
    // Zero-padded so lexicographic byte order (what redb's &str key uses)
    // matches numeric order; '\u{0}' can't occur in a document id so it's
    // a safe separator.
    format!("{document_id}\u{0}{version:020}")
}

fn wal_key_prefix(document_id: &str) -> String {
    format!("{document_id}\u{0}")
}

/// `redb`-backed [`ColdStorage`]. One table, keyed by document id, storing
/// the JSON-encoded [`StoredDocument`].
pub struct RedbColdStorage {
    db: Database,
}

impl RedbColdStorage {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = Database::create(path).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        let write_txn = db.begin_write().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        write_txn.open_table(SNAPSHOTS_TABLE).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        write_txn.commit().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        Ok(RedbColdStorage { db })
    }
}

#[async_trait]
impl ColdStorage for RedbColdStorage {
    async fn load(&self, document_id: &str) -> Result<Option<StoredDocument>> {
        let read_txn = self.db.begin_read().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        let table = match read_txn.open_table(SNAPSHOTS_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(err_kind(ErrorKind::Storage, e.to_string())),
        };
        let Some(bytes) = table.get(document_id).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))? else {
            return Ok(None);
        };
        let doc: StoredDocument =
            serde_json::from_slice(bytes.value()).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        Ok(Some(doc))
    }

    async fn save(&self, document_id: &str, doc: &StoredDocument) -> Result<()> {
        let bytes = serde_json::to_vec(doc).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        let write_txn = self.db.begin_write().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        {
            let mut table =
                write_txn.open_table(SNAPSHOTS_TABLE).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
            table.insert(document_id, bytes.as_slice()).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        }
        write_txn.commit().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        Ok(())
    }
}

/// `redb`-backed [`HotStorage`]. One table shared across documents, keyed
/// by `{document_id}\0{version:020}` so per-document entries sort together
/// in version order and a prefix scan finds them all.
pub struct RedbHotStorage {
    db: Database,
}

impl RedbHotStorage {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = Database::create(path).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        let write_txn = db.begin_write().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        write_txn.open_table(WAL_TABLE).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        write_txn.commit().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        Ok(RedbHotStorage { db })
    }
}

#[async_trait]
impl HotStorage for RedbHotStorage {
    async fn append(&self, document_id: &str, entry: &WalEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        let key = wal_key(document_id, entry.version);
        let write_txn = self.db.begin_write().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        {
            let mut table = write_txn.open_table(WAL_TABLE).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
            table.insert(key.as_str(), bytes.as_slice()).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        }
        write_txn.commit().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        Ok(())
    }

    async fn entries(&self, document_id: &str, since_version: u64) -> Result<Vec<WalEntry>> {
        let read_txn = self.db.begin_read().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        let table = match read_txn.open_table(WAL_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(err_kind(ErrorKind::Storage, e.to_string())),
        };
        let prefix = wal_key_prefix(document_id);
        let mut out = Vec::new();
        let range = table.range(prefix.as_str()..).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        for row in range {
            let (key, value) = row.map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let entry: WalEntry =
                serde_json::from_slice(value.value()).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
            if entry.version > since_version {
                out.push(entry);
            }
        }
        out.sort_by_key(|e| e.version);
        Ok(out)
    }

    async fn truncate(&self, document_id: &str, up_to_version: u64) -> Result<()> {
        let prefix = wal_key_prefix(document_id);
        let write_txn = self.db.begin_write().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        let mut to_remove = Vec::new();
        {
            let table = write_txn.open_table(WAL_TABLE).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
            let range = table.range(prefix.as_str()..).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
            for row in range {
                let (key, value) = row.map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                let entry: WalEntry =
                    serde_json::from_slice(value.value()).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
                if entry.version <= up_to_version {
                    to_remove.push(key.value().to_string());
                }
            }
        }
        {
            let mut table = write_txn.open_table(WAL_TABLE).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
            for key in &to_remove {
                table.remove(key.as_str()).map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
            }
        }
        write_txn.commit().map_err(|e| err_kind(ErrorKind::Storage, e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_schema::{Operation, OperationPath};
    use test_log::test;

    fn sample_entry(version: u64) -> WalEntry {
        WalEntry {
            transaction: Transaction {
                id: format!("tx{version}"),
                ops: vec![Operation::new("string.set", OperationPath::root(), Value::from("x"))],
                timestamp: 1000,
            },
            version,
            timestamp: 1000 + version,
        }
    }

    #[tokio::test]
    async fn in_memory_hot_storage_filters_and_orders_by_version() {
        let hot = InMemoryHotStorage::new();
        for v in [3, 1, 2] {
            hot.append("doc1", &sample_entry(v)).await.unwrap();
        }
        let entries = hot.entries("doc1", 1).await.unwrap();
        let versions: Vec<u64> = entries.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![2, 3]);
    }

    #[tokio::test]
    async fn in_memory_hot_storage_truncate_drops_up_to_version() {
        let hot = InMemoryHotStorage::new();
        for v in 1..=5 {
            hot.append("doc1", &sample_entry(v)).await.unwrap();
        }
        hot.truncate("doc1", 3).await.unwrap();
        let entries = hot.entries("doc1", 0).await.unwrap();
        let versions: Vec<u64> = entries.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![4, 5]);
    }

    #[tokio::test]
    async fn in_memory_cold_storage_round_trips() {
        let cold = InMemoryColdStorage::new();
        assert!(cold.load("doc1").await.unwrap().is_none());
        let doc = StoredDocument { state: Value::from("hi"), version: 4, schema_version: 1, saved_at: 100 };
        cold.save("doc1", &doc).await.unwrap();
        assert_eq!(cold.load("doc1").await.unwrap(), Some(doc));
    }

    #[test]
    fn reconcile_schema_version_treats_mismatch_as_absent() {
        let doc = StoredDocument { state: Value::Null, version: 1, schema_version: 2, saved_at: 0 };
        let reconciled = reconcile_schema_version(Some(doc), 3, MigrationPolicy::default());
        assert!(reconciled.is_none());
    }

    #[test]
    fn reconcile_schema_version_passes_through_on_match() {
        let doc = StoredDocument { state: Value::Null, version: 1, schema_version: 2, saved_at: 0 };
        let reconciled = reconcile_schema_version(Some(doc.clone()), 2, MigrationPolicy::default());
        assert_eq!(reconciled, Some(doc));
    }

    #[tokio::test]
    async fn redb_storage_round_trips_through_a_temp_file() {
        let dir = std::env::temp_dir().join(format!("docsync-storage-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cold = RedbColdStorage::open(dir.join("cold.redb")).unwrap();
        let doc = StoredDocument { state: Value::from("hi"), version: 1, schema_version: 1, saved_at: 1 };
        cold.save("doc1", &doc).await.unwrap();
        assert_eq!(cold.load("doc1").await.unwrap(), Some(doc));

        let hot = RedbHotStorage::open(dir.join("hot.redb")).unwrap();
        hot.append("doc1", &sample_entry(1)).await.unwrap();
        hot.append("doc1", &sample_entry(2)).await.unwrap();
        hot.append("doc2", &sample_entry(1)).await.unwrap();
        let entries = hot.entries("doc1", 0).await.unwrap();
        assert_eq!(entries.len(), 2);
        hot.truncate("doc1", 1).await.unwrap();
        assert_eq!(hot.entries("doc1", 0).await.unwrap().len(), 1);
        assert_eq!(hot.entries("doc2", 0).await.unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
