//! In-memory [`StoreClient`] backed by [`DashMap`].
//!
//! Rows are kept `MsgPack`-encoded per table, the way a real client keeps
//! store-native bytes. The client supports batching and transaction binding,
//! records every applied row write in a journal, and can be told to fail on
//! chosen keys so error paths can be exercised.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use polystore_core::{EntityMetadata, EntityRecord, JoinTableDef, Value};
use uuid::Uuid;

use super::{apply_write, Batcher, StoreClient, TransactionBinder, WriteKind, WriteOp};
use crate::config::StoreConfig;
use crate::flush::join_table::JoinTableData;
use crate::transaction::TransactionResource;

/// One applied row write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub kind: WriteKind,
    pub entity: String,
    /// Canonical key string.
    pub key: String,
}

/// Call counters, as a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub finds: u64,
    pub writes: u64,
    pub deletes: u64,
    pub batch_executions: u64,
    pub join_table_writes: u64,
}

#[derive(Default)]
struct Counters {
    finds: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    batch_executions: AtomicU64,
    join_table_writes: AtomicU64,
}

type Row = BTreeMap<String, Value>;

/// Thread-safe in-memory store.
pub struct InMemoryClient {
    name: String,
    batch_size: usize,
    bindable: bool,
    /// `schema.table` -> key -> encoded record.
    tables: DashMap<String, DashMap<String, Vec<u8>>>,
    /// `schema.table` -> junction rows.
    join_tables: DashMap<String, Vec<Row>>,
    /// Session id -> queued writes.
    batches: DashMap<Uuid, Vec<WriteOp>>,
    resource: Mutex<Option<Arc<dyn TransactionResource>>>,
    journal: Mutex<Vec<JournalEntry>>,
    failing_keys: DashSet<String>,
    counters: Counters,
}

impl InMemoryClient {
    /// Creates an empty store that does not batch and accepts transaction
    /// binding.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: 0,
            bindable: true,
            tables: DashMap::new(),
            join_tables: DashMap::new(),
            batches: DashMap::new(),
            resource: Mutex::new(None),
            journal: Mutex::new(Vec::new()),
            failing_keys: DashSet::new(),
            counters: Counters::default(),
        }
    }

    /// Creates a store as described by its configuration entry.
    #[must_use]
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.name.clone()).with_batch_size(config.batch_size)
    }

    /// Enables batching with the given threshold. Zero disables it.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Removes the transaction binding capability.
    #[must_use]
    pub fn without_transactions(mut self) -> Self {
        self.bindable = false;
        self
    }

    /// Makes every write or delete of `key` fail.
    pub fn fail_on(&self, key: &Value) {
        if let Some(key) = key.to_key_string() {
            self.failing_keys.insert(key);
        }
    }

    /// Stops failing on previously configured keys.
    pub fn clear_failures(&self) {
        self.failing_keys.clear();
    }

    /// Stored row of `schema.table` under `key`.
    #[must_use]
    pub fn record(&self, schema: &str, table: &str, key: &Value) -> Option<EntityRecord> {
        let key = key.to_key_string()?;
        let table = self.tables.get(&table_name(schema, table))?;
        let bytes = table.get(&key)?;
        EntityRecord::from_msgpack(bytes.value()).ok()
    }

    /// Number of rows stored in `schema.table`.
    #[must_use]
    pub fn row_count(&self, schema: &str, table: &str) -> usize {
        self.tables
            .get(&table_name(schema, table))
            .map_or(0, |t| t.len())
    }

    /// Junction rows of `schema.table`.
    #[must_use]
    pub fn join_rows(&self, schema: &str, table: &str) -> Vec<BTreeMap<String, Value>> {
        self.join_tables
            .get(&table_name(schema, table))
            .map(|rows| rows.value().clone())
            .unwrap_or_default()
    }

    /// Applied row writes, oldest first.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    #[must_use]
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            finds: self.counters.finds.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            batch_executions: self.counters.batch_executions.load(Ordering::Relaxed),
            join_table_writes: self.counters.join_table_writes.load(Ordering::Relaxed),
        }
    }

    /// Whether a transaction resource is currently bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.resource.lock().is_some()
    }

    fn check_failure(&self, op: &WriteOp, key: &str) -> anyhow::Result<()> {
        if self.failing_keys.contains(key) {
            return Err(anyhow!(
                "injected failure writing {}#{key} to `{}`",
                op.entity,
                self.name
            ));
        }
        Ok(())
    }

    fn log(&self, op: &WriteOp, key: String) {
        self.journal.lock().push(JournalEntry {
            kind: op.kind,
            entity: op.entity.clone(),
            key,
        });
    }
}

fn table_name(schema: &str, table: &str) -> String {
    if schema.is_empty() {
        table.to_string()
    } else {
        format!("{schema}.{table}")
    }
}

fn key_string(key: &Value) -> anyhow::Result<String> {
    key.to_key_string()
        .ok_or_else(|| anyhow!("value of kind {} cannot be used as a key", key.kind()))
}

impl StoreClient for InMemoryClient {
    fn store_name(&self) -> &str {
        &self.name
    }

    fn find(&self, metadata: &EntityMetadata, key: &Value) -> anyhow::Result<Option<EntityRecord>> {
        self.counters.finds.fetch_add(1, Ordering::Relaxed);
        let key = key_string(key)?;
        let Some(table) = self.tables.get(&table_name(&metadata.schema, &metadata.table)) else {
            return Ok(None);
        };
        let Some(bytes) = table.get(&key) else {
            return Ok(None);
        };
        let record = EntityRecord::from_msgpack(bytes.value())
            .with_context(|| format!("corrupt row {}#{key}", metadata.entity))?;
        Ok(Some(record))
    }

    fn find_by_relation(
        &self,
        metadata: &EntityMetadata,
        column: &str,
        value: &Value,
    ) -> anyhow::Result<Vec<EntityRecord>> {
        self.counters.finds.fetch_add(1, Ordering::Relaxed);
        let Some(table) = self.tables.get(&table_name(&metadata.schema, &metadata.table)) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for entry in table.iter() {
            let record = EntityRecord::from_msgpack(entry.value())
                .with_context(|| format!("corrupt row {}#{}", metadata.entity, entry.key()))?;
            if record.reference(column) == Some(value) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.key.to_key_string().cmp(&b.key.to_key_string()));
        Ok(records)
    }

    fn join_table_targets(
        &self,
        join_table: &JoinTableDef,
        owner: &Value,
    ) -> anyhow::Result<Vec<Value>> {
        self.counters.finds.fetch_add(1, Ordering::Relaxed);
        let Some(rows) = self
            .join_tables
            .get(&table_name(&join_table.schema, &join_table.table))
        else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|row| row.get(&join_table.join_column) == Some(owner))
            .filter_map(|row| row.get(&join_table.inverse_join_column).cloned())
            .collect())
    }

    fn write(&self, op: &WriteOp) -> anyhow::Result<()> {
        let key = key_string(&op.key)?;
        self.check_failure(op, &key)?;
        let bytes = op
            .record
            .to_msgpack()
            .with_context(|| format!("failed to encode {}#{key}", op.entity))?;
        self.tables
            .entry(table_name(&op.schema, &op.table))
            .or_default()
            .insert(key.clone(), bytes);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.log(op, key);
        Ok(())
    }

    fn delete(&self, op: &WriteOp) -> anyhow::Result<()> {
        let key = key_string(&op.key)?;
        self.check_failure(op, &key)?;
        if let Some(table) = self.tables.get(&table_name(&op.schema, &op.table)) {
            table.remove(&key);
        }
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.log(op, key);
        Ok(())
    }

    fn persist_join_table(&self, data: &JoinTableData) -> anyhow::Result<()> {
        let mut rows = self
            .join_tables
            .entry(table_name(&data.schema, &data.table))
            .or_default();
        for target in &data.targets {
            let mut row = Row::new();
            row.insert(data.join_column.clone(), data.owner.clone());
            row.insert(data.inverse_join_column.clone(), target.clone());
            rows.push(row);
        }
        self.counters.join_table_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete_by_column(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        value: &Value,
    ) -> anyhow::Result<usize> {
        let name = table_name(schema, table);
        if let Some(mut rows) = self.join_tables.get_mut(&name) {
            let before = rows.len();
            rows.retain(|row| row.get(column) != Some(value));
            return Ok(before - rows.len());
        }
        let Some(rows) = self.tables.get(&name) else {
            return Ok(0);
        };
        let mut doomed = Vec::new();
        for entry in rows.iter() {
            let record = EntityRecord::from_msgpack(entry.value())
                .with_context(|| format!("corrupt row {name}#{}", entry.key()))?;
            let matches = record.reference(column) == Some(value)
                || record.fields.get(column) == Some(value);
            if matches {
                doomed.push(entry.key().clone());
            }
        }
        for key in &doomed {
            rows.remove(key);
        }
        Ok(doomed.len())
    }

    fn as_batcher(&self) -> Option<&dyn Batcher> {
        Some(self)
    }

    fn as_transaction_binder(&self) -> Option<&dyn TransactionBinder> {
        self.bindable.then_some(self as &dyn TransactionBinder)
    }
}

impl Batcher for InMemoryClient {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn add_batch(&self, session: Uuid, op: WriteOp) {
        self.batches.entry(session).or_default().push(op);
    }

    fn pending_batch(&self, session: Uuid) -> usize {
        self.batches.get(&session).map_or(0, |ops| ops.len())
    }

    fn execute_batch(&self, session: Uuid) -> anyhow::Result<Vec<WriteOp>> {
        let Some((_, ops)) = self.batches.remove(&session) else {
            return Ok(Vec::new());
        };
        if ops.is_empty() {
            return Ok(ops);
        }
        self.counters.batch_executions.fetch_add(1, Ordering::Relaxed);
        for op in &ops {
            apply_write(self, op)?;
        }
        Ok(ops)
    }

    fn clear_batch(&self, session: Uuid) {
        self.batches.remove(&session);
    }
}

impl TransactionBinder for InMemoryClient {
    fn bind(&self, resource: Arc<dyn TransactionResource>) {
        *self.resource.lock() = Some(resource);
    }

    fn unbind(&self) {
        self.resource.lock().take();
    }
}
