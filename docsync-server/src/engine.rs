//! `Engine` (spec §4.4.2): lazily creates [`ServerDocument`]s from cold
//! storage or a configured initial state, replays their WAL tail, and runs
//! the idle-GC and snapshot-trigger background policies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use docsync_base::Result;
use docsync_schema::{Schema, Value};
use docsync_storage::{reconcile_schema_version, ColdStorage, HotStorage, MigrationPolicy, StoredDocument, WalEntry};
use docsync_wire::ServerMessage;
use tokio::sync::RwLock;

use crate::document::{ServerDocument, SubmitResult};

pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// How a freshly-created document's starting state is chosen when cold
/// storage has nothing for it yet.
pub trait InitialState: Send + Sync {
    fn initial(&self, document_id: &str) -> Value;
}

/// The common case: every document starts from the same constant value.
pub struct ConstantInitial(pub Value);

impl InitialState for ConstantInitial {
    fn initial(&self, _document_id: &str) -> Value {
        self.0.clone()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SnapshotConfig {
    pub transaction_threshold: u64,
    pub interval_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig { transaction_threshold: 200, interval_ms: 5 * 60 * 1000 }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub schema_version: u32,
    pub max_transaction_history: usize,
    pub max_idle_time_ms: u64,
    pub gc_interval_ms: u64,
    pub migration_policy: MigrationPolicy,
    pub snapshot: SnapshotConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            schema_version: 1,
            max_transaction_history: 200,
            max_idle_time_ms: 30 * 60 * 1000,
            gc_interval_ms: 60 * 1000,
            migration_policy: MigrationPolicy::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

/// Process-wide counters, the way the idle-GC and get_or_create paths
/// publish them (spec §4.4.2).
#[derive(Default)]
pub struct Metrics {
    pub documents_created: AtomicU64,
    pub documents_restored: AtomicU64,
    pub documents_active: AtomicI64,
    pub documents_evicted: AtomicU64,
}

/// A point-in-time read of [`Metrics`], for anything that wants to publish
/// or assert on the counters without reaching into the atomics directly.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    pub documents_created: u64,
    pub documents_restored: u64,
    pub documents_active: i64,
    pub documents_evicted: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_created: self.documents_created.load(Ordering::SeqCst),
            documents_restored: self.documents_restored.load(Ordering::SeqCst),
            documents_active: self.documents_active.load(Ordering::SeqCst),
            documents_evicted: self.documents_evicted.load(Ordering::SeqCst),
        }
    }
}

struct DocumentEntry {
    server_document: Arc<ServerDocument>,
    last_activity_ms: AtomicU64,
    transactions_since_snapshot: AtomicU64,
    last_snapshot_time_ms: AtomicU64,
}

impl DocumentEntry {
    fn touch(&self, now: u64) {
        self.last_activity_ms.store(now, Ordering::SeqCst);
    }
}

pub struct Engine {
    schema: Schema,
    config: EngineConfig,
    initial: Arc<dyn InitialState>,
    cold: Arc<dyn ColdStorage>,
    hot: Arc<dyn HotStorage>,
    documents: RwLock<HashMap<String, Arc<DocumentEntry>>>,
    pub metrics: Metrics,
}

impl Engine {
    pub fn new(
        schema: Schema,
        config: EngineConfig,
        initial: Arc<dyn InitialState>,
        cold: Arc<dyn ColdStorage>,
        hot: Arc<dyn HotStorage>,
    ) -> Self {
        Engine { schema, config, initial, cold, hot, documents: RwLock::new(HashMap::new()), metrics: Metrics::default() }
    }

    async fn get_or_create(&self, document_id: &str, now: u64) -> Result<Arc<DocumentEntry>> {
        if let Some(entry) = self.documents.read().await.get(document_id) {
            entry.touch(now);
            return Ok(entry.clone());
        }

        let mut documents = self.documents.write().await;
        if let Some(entry) = documents.get(document_id) {
            entry.touch(now);
            return Ok(entry.clone());
        }

        let stored = self.cold.load(document_id).await?;
        let stored = reconcile_schema_version(stored, self.config.schema_version, self.config.migration_policy);
        let created = stored.is_none();
        let (state, version) = match stored {
            Some(StoredDocument { state, version, .. }) => (state, version),
            None => (self.initial.initial(document_id), 0),
        };

        let server_document =
            Arc::new(ServerDocument::new(self.schema.clone(), state, version, self.config.max_transaction_history));

        let wal_entries = self.hot.entries(document_id, version).await?;
        for WalEntry { transaction, version: entry_version, .. } in wal_entries {
            let tx_id = transaction.id.clone();
            if let Err(e) = server_document.replay(transaction, entry_version).await {
                tracing::warn!(target: "docsync", document_id, tx_id, error = %e, "skipping corrupt WAL entry during replay");
            }
        }

        if created {
            self.metrics.documents_created.fetch_add(1, Ordering::SeqCst);
        } else {
            self.metrics.documents_restored.fetch_add(1, Ordering::SeqCst);
        }
        self.metrics.documents_active.fetch_add(1, Ordering::SeqCst);

        let entry = Arc::new(DocumentEntry {
            server_document,
            last_activity_ms: AtomicU64::new(now),
            transactions_since_snapshot: AtomicU64::new(0),
            last_snapshot_time_ms: AtomicU64::new(now),
        });
        documents.insert(document_id.to_string(), entry.clone());
        Ok(entry)
    }

    pub async fn submit(&self, document_id: &str, t: docsync_doc::Transaction, now: u64) -> Result<SubmitResult> {
        let entry = self.get_or_create(document_id, now).await?;
        let result = entry.server_document.submit(t.clone()).await;
        if let (true, Some(version)) = (result.success, result.version) {
            self.hot.append(document_id, &WalEntry { transaction: t, version, timestamp: now }).await?;
            entry.transactions_since_snapshot.fetch_add(1, Ordering::SeqCst);
            self.maybe_snapshot(document_id, &entry, now).await?;
        }
        Ok(result)
    }

    pub async fn get_snapshot(&self, document_id: &str, now: u64) -> Result<(Value, u64)> {
        let entry = self.get_or_create(document_id, now).await?;
        Ok(entry.server_document.get_snapshot().await)
    }

    pub async fn subscribe(&self, document_id: &str, now: u64) -> Result<tokio::sync::broadcast::Receiver<ServerMessage>> {
        let entry = self.get_or_create(document_id, now).await?;
        Ok(entry.server_document.subscribe())
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn maybe_snapshot(&self, document_id: &str, entry: &DocumentEntry, now: u64) -> Result<()> {
        let count = entry.transactions_since_snapshot.load(Ordering::SeqCst);
        let last = entry.last_snapshot_time_ms.load(Ordering::SeqCst);
        if count >= self.config.snapshot.transaction_threshold || now.saturating_sub(last) >= self.config.snapshot.interval_ms {
            self.save_snapshot(document_id, entry, now).await?;
        }
        Ok(())
    }

    async fn save_snapshot(&self, document_id: &str, entry: &DocumentEntry, now: u64) -> Result<()> {
        let (state, version) = entry.server_document.get_snapshot().await;
        let stored = StoredDocument { state, version, schema_version: self.config.schema_version, saved_at: now };
        self.cold.save(document_id, &stored).await?;
        self.hot.truncate(document_id, version).await?;
        entry.transactions_since_snapshot.store(0, Ordering::SeqCst);
        entry.last_snapshot_time_ms.store(now, Ordering::SeqCst);
        Ok(())
    }

    /// One pass of the idle-GC policy (spec §4.4.2). Real deployments call
    /// this from a `tokio::time::interval` loop at `config.gc_interval_ms`;
    /// tests call it directly with a synthetic `now`.
    pub async fn run_gc_once(&self, now: u64) {
        let idle: Vec<String> = {
            let documents = self.documents.read().await;
            documents
                .iter()
                .filter(|(_, entry)| now.saturating_sub(entry.last_activity_ms.load(Ordering::SeqCst)) >= self.config.max_idle_time_ms)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for document_id in idle {
            let entry = {
                let mut documents = self.documents.write().await;
                documents.remove(&document_id)
            };
            let Some(entry) = entry else { continue };
            if let Err(e) = self.save_snapshot(&document_id, &entry, now).await {
                tracing::warn!(target: "docsync", document_id, error = %e, "best-effort snapshot on idle eviction failed");
            }
            self.metrics.documents_active.fetch_sub(1, Ordering::SeqCst);
            self.metrics.documents_evicted.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Spawn the idle-GC fiber on the current tokio runtime.
    pub fn spawn_gc_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.config.gc_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                self.run_gc_once(now_millis()).await;
            }
        })
    }

    /// Best-effort save for every live document (spec §4.4.2 Shutdown).
    pub async fn shutdown(&self) {
        let now = now_millis();
        let documents = self.documents.read().await;
        for (document_id, entry) in documents.iter() {
            if let Err(e) = self.save_snapshot(document_id, entry, now).await {
                tracing::warn!(target: "docsync", document_id, error = %e, "best-effort snapshot on shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_doc::Transaction;
    use docsync_schema::{initial_state, Operation, OperationPath};
    use docsync_storage::{InMemoryColdStorage, InMemoryHotStorage};
    use test_log::test;

    fn title_schema() -> Schema {
        Schema::struct_of([("title", Schema::String)])
    }

    fn engine(config: EngineConfig) -> Engine {
        let schema = title_schema();
        let initial = Arc::new(ConstantInitial(initial_state(&schema)));
        Engine::new(schema, config, initial, Arc::new(InMemoryColdStorage::new()), Arc::new(InMemoryHotStorage::new()))
    }

    fn set_title_tx(id: &str, text: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            ops: vec![Operation::new("string.set", OperationPath::single("title"), Value::from(text))],
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn get_or_create_seeds_from_initial_state_and_counts_created() {
        let engine = engine(EngineConfig::default());
        let (state, version) = engine.get_snapshot("doc1", 0).await.unwrap();
        assert_eq!(version, 0);
        assert_eq!(state.get("title").unwrap().as_str(), Some(""));
        let metrics = engine.metrics_snapshot();
        assert_eq!(metrics.documents_created, 1);
        assert_eq!(metrics.documents_active, 1);
    }

    #[tokio::test]
    async fn submit_appends_to_hot_storage_and_triggers_snapshot_at_threshold() {
        let mut config = EngineConfig::default();
        config.snapshot.transaction_threshold = 2;
        let engine = engine(config);

        engine.submit("doc1", set_title_tx("tx1", "a"), 0).await.unwrap();
        engine.submit("doc1", set_title_tx("tx2", "b"), 0).await.unwrap();

        let stored = engine.cold.load("doc1").await.unwrap();
        assert!(stored.is_some());
        assert_eq!(stored.unwrap().version, 2);
        let remaining_wal = engine.hot.entries("doc1", 0).await.unwrap();
        assert!(remaining_wal.is_empty());
    }

    #[tokio::test]
    async fn idle_eviction_then_reaccess_restores_from_cold_storage() {
        let mut config = EngineConfig::default();
        config.max_idle_time_ms = 100;
        let engine = Arc::new(engine(config));

        engine.submit("doc1", set_title_tx("tx1", "a"), 0).await.unwrap();
        engine.run_gc_once(200).await;
        assert_eq!(engine.metrics.documents_evicted.load(Ordering::SeqCst), 1);
        assert_eq!(engine.metrics.documents_active.load(Ordering::SeqCst), 0);

        let (state, version) = engine.get_snapshot("doc1", 201).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(state.get("title").unwrap().as_str(), Some("a"));
        assert_eq!(engine.metrics.documents_restored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupt_wal_entry_is_skipped_during_replay() {
        let schema = title_schema();
        let hot = InMemoryHotStorage::new();
        hot.append(
            "doc1",
            &WalEntry {
                transaction: Transaction {
                    id: "bad".to_string(),
                    ops: vec![Operation::new("string.set", OperationPath::single("nope"), Value::from("x"))],
                    timestamp: 0,
                },
                version: 1,
                timestamp: 0,
            },
        )
        .await
        .unwrap();
        hot.append("doc1", &WalEntry { transaction: set_title_tx("good", "ok"), version: 2, timestamp: 0 }).await.unwrap();

        let initial = Arc::new(ConstantInitial(initial_state(&schema)));
        let engine = Engine::new(schema, EngineConfig::default(), initial, Arc::new(InMemoryColdStorage::new()), Arc::new(hot));
        let (state, version) = engine.get_snapshot("doc1", 0).await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(state.get("title").unwrap().as_str(), Some("ok"));
    }

    #[tokio::test]
    async fn shutdown_saves_a_snapshot_for_every_live_document() {
        let engine = engine(EngineConfig::default());
        engine.submit("doc1", set_title_tx("tx1", "a"), 0).await.unwrap();
        engine.submit("doc2", set_title_tx("tx2", "b"), 0).await.unwrap();
        engine.shutdown().await;
        assert!(engine.cold.load("doc1").await.unwrap().is_some());
        assert!(engine.cold.load("doc2").await.unwrap().is_some());
    }
}
