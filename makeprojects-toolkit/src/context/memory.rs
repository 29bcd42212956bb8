//! In-process persistence context
//!
//! [`MemoryStore`] plays the role of the database: it is shared between
//! contexts and survives them. [`MemoryContext`] is the per-request handle with
//! its own change tracker and optional transaction.
//!
//! Transactions run against a snapshot of the store. Flushes inside the
//! transaction write to the snapshot and are recorded; commit replays the
//! recorded flushes against the shared store with the same version checks, so
//! the first committer wins and a conflicting commit applies nothing.
//!
//! Row versions are drawn from one store-wide counter, so a row never gets a
//! version it carried before, even after a delete and re-insert or a rolled
//! back transaction.
//!
//! # Example
//!
//! ```rust
//! use makeprojects_toolkit::context::memory::MemoryStore;
//! use makeprojects_toolkit::context::ContextFactory;
//!
//! let store = MemoryStore::new();
//! let request_a = store.create_context();
//! let request_b = store.create_context();
//! // Both contexts see the same rows once changes are flushed.
//! # let _ = (request_a, request_b);
//! ```

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use super::{
    ChangeTracker, ContextFactory, ContextTransaction, EntryState, PersistenceContext,
    StagedEntry, StoreResult,
};
use crate::entity::{Entity, EntityKey};
use crate::error::{ConflictEntry, StoreError};

// ============================================================================
// Tables
// ============================================================================

struct Row<E> {
    value: E,
    version: u64,
}

impl<E: Clone> Clone for Row<E> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            version: self.version,
        }
    }
}

struct Table<E> {
    rows: BTreeMap<String, Row<E>>,
}

impl<E> Default for Table<E> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

/// Type-erased view of a [`Table`]
trait AnyTable: Send + Sync {
    fn clone_table(&self) -> Box<dyn AnyTable>;
    fn version_of(&self, key: &str) -> Option<u64>;
    fn remove(&mut self, key: &str);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<E: Entity> AnyTable for Table<E> {
    fn clone_table(&self) -> Box<dyn AnyTable> {
        Box::new(Table {
            rows: self.rows.clone(),
        })
    }

    fn version_of(&self, key: &str) -> Option<u64> {
        self.rows.get(key).map(|row| row.version)
    }

    fn remove(&mut self, key: &str) {
        self.rows.remove(key);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
struct Tables {
    by_type: HashMap<TypeId, Box<dyn AnyTable>>,
}

impl Clone for Tables {
    fn clone(&self) -> Self {
        Self {
            by_type: self
                .by_type
                .iter()
                .map(|(ty, table)| (*ty, table.clone_table()))
                .collect(),
        }
    }
}

impl Tables {
    fn table<E: Entity>(&self) -> Option<&Table<E>> {
        self.by_type
            .get(&TypeId::of::<E>())
            .and_then(|table| table.as_any().downcast_ref::<Table<E>>())
    }

    fn table_mut<E: Entity>(&mut self) -> &mut Table<E> {
        self.by_type
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Table::<E>::default()))
            .as_any_mut()
            .downcast_mut::<Table<E>>()
            .expect("tables are keyed by their entity TypeId")
    }

    fn version_of(&self, type_id: TypeId, key: &str) -> Option<u64> {
        self.by_type
            .get(&type_id)
            .and_then(|table| table.version_of(key))
    }

    fn remove(&mut self, type_id: TypeId, key: &str) {
        if let Some(table) = self.by_type.get_mut(&type_id) {
            table.remove(key);
        }
    }
}

// ============================================================================
// Staged writes
// ============================================================================

/// Writes a staged entity value into a table
trait RowWriter: Send + Sync {
    fn write(&self, tables: &mut Tables, key: &str, version: u64);
}

struct Put<E>(E);

impl<E: Entity> RowWriter for Put<E> {
    fn write(&self, tables: &mut Tables, key: &str, version: u64) {
        tables.table_mut::<E>().rows.insert(
            key.to_string(),
            Row {
                value: self.0.clone(),
                version,
            },
        );
    }
}

type Payload = Arc<dyn RowWriter>;

/// A staged entry together with the version it was expected to have
#[derive(Clone)]
struct FlushedChange {
    entry: StagedEntry<Payload>,
    expected: Option<u64>,
}

/// Outcome of a written change: `Some(version)` or `None` when deleted
struct Written {
    type_id: TypeId,
    key: String,
    version: Option<u64>,
}

/// Validate a batch against `tables`, then write it
///
/// Each row appears at most once per batch, so validating every change before
/// writing any of them keeps the batch atomic.
fn apply_batch(
    tables: &mut Tables,
    batch: &[FlushedChange],
    next_version: &dyn Fn() -> u64,
) -> StoreResult<Vec<Written>> {
    let mut conflicts = Vec::new();
    for change in batch {
        let entry = &change.entry;
        let current = tables.version_of(entry.type_id, &entry.key);
        match entry.state {
            EntryState::Added => {
                if current.is_some() {
                    return Err(StoreError::DuplicateKey {
                        entity: entry.entity,
                        key: entry.key.clone(),
                    });
                }
            }
            EntryState::Modified | EntryState::Deleted => {
                let stale = match (current, change.expected) {
                    (None, _) => true,
                    (Some(current), Some(expected)) => current != expected,
                    (Some(_), None) => false,
                };
                if stale {
                    conflicts.push(ConflictEntry {
                        type_id: entry.type_id,
                        entity: entry.entity,
                        key: entry.key.clone(),
                    });
                }
            }
        }
    }

    if !conflicts.is_empty() {
        return Err(StoreError::Concurrency { entries: conflicts });
    }

    let mut written = Vec::with_capacity(batch.len());
    for change in batch {
        let entry = &change.entry;
        let version = match (entry.state, &entry.payload) {
            (EntryState::Deleted, _) | (_, None) => {
                tables.remove(entry.type_id, &entry.key);
                None
            }
            (_, Some(writer)) => {
                let version = next_version();
                writer.write(tables, &entry.key, version);
                Some(version)
            }
        };
        written.push(Written {
            type_id: entry.type_id,
            key: entry.key.clone(),
            version,
        });
    }
    Ok(written)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Track the versions a successful write left behind
fn record_written(tracker: &mut ChangeTracker<Payload>, written: &[Written]) {
    for w in written {
        match w.version {
            Some(version) => tracker.remember(w.type_id, &w.key, version),
            None => tracker.forget(w.type_id, &w.key),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
struct StoreInner {
    tables: Mutex<Tables>,
    sequence: AtomicU64,
    versions: AtomicU64,
}

/// Shared in-process backing store
///
/// Cloning is cheap; clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows of entity type `E`
    pub fn row_count<E: Entity>(&self) -> usize {
        lock(&self.inner.tables)
            .table::<E>()
            .map_or(0, |table| table.rows.len())
    }

    fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_version(&self) -> u64 {
        self.inner.versions.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl ContextFactory for MemoryStore {
    type Context = MemoryContext;

    fn create_context(&self) -> MemoryContext {
        MemoryContext::new(self.clone())
    }
}

// ============================================================================
// Context
// ============================================================================

struct OpenTransaction {
    id: u64,
    snapshot: Tables,
    log: Vec<Vec<FlushedChange>>,
    /// Tracked versions at begin, put back if the transaction does not commit
    saved_versions: HashMap<(TypeId, String), u64>,
}

#[derive(Default)]
struct ContextState {
    tracker: ChangeTracker<Payload>,
    transaction: Option<OpenTransaction>,
    transactions_started: u64,
}

/// Per-request persistence context over a [`MemoryStore`]
///
/// The internal mutex is never held across `.await` points.
pub struct MemoryContext {
    store: MemoryStore,
    state: Arc<Mutex<ContextState>>,
}

impl MemoryContext {
    /// Create a context over `store`
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(ContextState::default())),
        }
    }

    /// Whether a transaction is currently open on this context
    pub fn in_transaction(&self) -> bool {
        lock(&self.state).transaction.is_some()
    }

    /// Number of staged, unflushed changes
    pub fn pending_changes(&self) -> usize {
        lock(&self.state).tracker.staged_len()
    }

    fn stage<E: Entity>(&self, entity: &E, state: EntryState) {
        let payload: Option<Payload> = match state {
            EntryState::Deleted => None,
            _ => Some(Arc::new(Put(entity.clone()))),
        };
        lock(&self.state).tracker.stage(StagedEntry {
            type_id: TypeId::of::<E>(),
            entity: E::entity_name(),
            key: entity.key().to_string(),
            state,
            payload,
        });
    }

    /// Run `f` against the tables visible to this context
    fn read<R>(&self, state: &ContextState, f: impl FnOnce(&Tables) -> R) -> R {
        match &state.transaction {
            Some(tx) => f(&tx.snapshot),
            None => f(&lock(&self.store.inner.tables)),
        }
    }
}

impl PersistenceContext for MemoryContext {
    type Transaction = MemoryTransaction;

    async fn find<E: Entity>(&self, key: &E::Key) -> StoreResult<Option<E>> {
        let key = key.to_string();
        let mut state = lock(&self.state);
        let found = self.read(&state, |tables| {
            tables
                .table::<E>()
                .and_then(|table| table.rows.get(&key))
                .cloned()
        });

        Ok(found.map(|row| {
            state.tracker.observe(TypeId::of::<E>(), &key, row.version);
            row.value
        }))
    }

    async fn query_all<E: Entity>(&self) -> StoreResult<Vec<E>> {
        let state = lock(&self.state);
        Ok(self.read(&state, |tables| {
            tables
                .table::<E>()
                .map(|table| table.rows.values().map(|row| row.value.clone()).collect())
                .unwrap_or_default()
        }))
    }

    async fn add<E: Entity>(&self, mut entity: E) -> StoreResult<E> {
        if !entity.key().is_set() {
            let key = E::Key::generate(self.store.next_sequence()).ok_or(
                StoreError::MissingKey {
                    entity: E::entity_name(),
                },
            )?;
            entity.set_key(key);
        }
        self.stage(&entity, EntryState::Added);
        Ok(entity)
    }

    fn update<E: Entity>(&self, entity: &E) -> StoreResult<()> {
        self.stage(entity, EntryState::Modified);
        Ok(())
    }

    fn remove<E: Entity>(&self, entity: &E) -> StoreResult<()> {
        self.stage(entity, EntryState::Deleted);
        Ok(())
    }

    async fn save_changes(&self, cancel: Option<&CancellationToken>) -> StoreResult<usize> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(StoreError::Cancelled);
        }

        let mut guard = lock(&self.state);
        let state = &mut *guard;

        let staged = state.tracker.take_staged();
        if staged.is_empty() {
            return Ok(0);
        }

        let batch: Vec<FlushedChange> = staged
            .into_iter()
            .map(|entry| FlushedChange {
                expected: state.tracker.version(entry.type_id, &entry.key),
                entry,
            })
            .collect();

        let next_version = || self.store.next_version();
        let result = match state.transaction.as_mut() {
            Some(tx) => apply_batch(&mut tx.snapshot, &batch, &next_version).inspect(|_| {
                tx.log.push(batch.clone());
            }),
            None => apply_batch(&mut lock(&self.store.inner.tables), &batch, &next_version),
        };

        match result {
            Ok(written) => {
                record_written(&mut state.tracker, &written);
                Ok(written.len())
            }
            Err(err) => {
                state
                    .tracker
                    .restore_staged(batch.into_iter().map(|change| change.entry));
                Err(err)
            }
        }
    }

    async fn reload(&self, entries: &[ConflictEntry]) -> StoreResult<()> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        for entry in entries {
            let current = match &state.transaction {
                Some(tx) => tx.snapshot.version_of(entry.type_id, &entry.key),
                None => lock(&self.store.inner.tables).version_of(entry.type_id, &entry.key),
            };
            state.tracker.discard(entry.type_id, &entry.key);
            match current {
                Some(version) => state.tracker.remember(entry.type_id, &entry.key, version),
                None => state.tracker.forget(entry.type_id, &entry.key),
            }
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> StoreResult<MemoryTransaction> {
        let mut state = lock(&self.state);
        if state.transaction.is_some() {
            return Err(StoreError::TransactionInProgress);
        }

        state.transactions_started += 1;
        let id = state.transactions_started;
        let snapshot = lock(&self.store.inner.tables).clone();
        let saved_versions = state.tracker.versions_snapshot();
        state.transaction = Some(OpenTransaction {
            id,
            snapshot,
            log: Vec::new(),
            saved_versions,
        });

        Ok(MemoryTransaction {
            id,
            state: Arc::clone(&self.state),
            store: self.store.clone(),
            open: true,
        })
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Transaction handle for a [`MemoryContext`]
pub struct MemoryTransaction {
    id: u64,
    state: Arc<Mutex<ContextState>>,
    store: MemoryStore,
    open: bool,
}

impl MemoryTransaction {
    /// Detach this handle's transaction from the context, if still attached
    fn take(&mut self) -> Option<OpenTransaction> {
        if !self.open {
            return None;
        }
        self.open = false;

        let mut state = lock(&self.state);
        match &state.transaction {
            Some(tx) if tx.id == self.id => state.transaction.take(),
            _ => None,
        }
    }

    /// Detach the transaction without applying it
    fn discard(&mut self) {
        if let Some(tx) = self.take() {
            lock(&self.state).tracker.restore_versions(tx.saved_versions);
        }
    }
}

impl ContextTransaction for MemoryTransaction {
    async fn commit(&mut self) -> StoreResult<()> {
        let Some(tx) = self.take() else {
            return Ok(());
        };

        let replayed = {
            let mut tables = lock(&self.store.inner.tables);
            let mut working = tables.clone();
            let next_version = || self.store.next_version();
            let replayed = tx
                .log
                .iter()
                .map(|batch| apply_batch(&mut working, batch, &next_version))
                .collect::<StoreResult<Vec<_>>>();
            if replayed.is_ok() {
                *tables = working;
            }
            replayed
        };

        let mut state = lock(&self.state);
        match replayed {
            Ok(batches) => {
                for written in &batches {
                    record_written(&mut state.tracker, written);
                }
                Ok(())
            }
            Err(err) => {
                state.tracker.restore_versions(tx.saved_versions);
                Err(err)
            }
        }
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.discard();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.discard();
    }
}
