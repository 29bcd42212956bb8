//! PostgreSQL persistence context
//!
//! Every entity type shares a single table keyed by `(entity_type, entity_key)`;
//! the entity itself is stored as JSONB next to a version used for optimistic
//! concurrency. Versions come from a sequence, which never hands out a value
//! twice even across rolled back transactions. Call [`ensure_schema`] once at
//! startup.
//!
//! While a transaction is open, every statement issued by the context runs on
//! the transaction's connection. Each flush additionally runs inside its own
//! (nested) transaction so a conflicting batch leaves nothing behind.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use sqlx::{Acquire, PgExecutor, PgPool, Postgres, Transaction};
use tokio_util::sync::CancellationToken;

use super::{
    ChangeTracker, ContextFactory, ContextTransaction, EntryState, PersistenceContext,
    StagedEntry, StoreResult,
};
use crate::entity::{Entity, EntityKey};
use crate::error::{ConflictEntry, StoreError};

/// Table holding every entity row
pub const ENTITY_TABLE: &str = "toolkit_entities";

/// Sequence feeding generated keys
pub const KEY_SEQUENCE: &str = "toolkit_entity_key_seq";

/// Sequence feeding row versions
pub const VERSION_SEQUENCE: &str = "toolkit_entity_version_seq";

/// Create the entity table and key sequence if they do not exist
pub async fn ensure_schema(pool: &PgPool) -> StoreResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS toolkit_entities (
            entity_type TEXT NOT NULL,
            entity_key TEXT NOT NULL,
            version BIGINT NOT NULL,
            body JSONB NOT NULL,
            PRIMARY KEY (entity_type, entity_key)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE SEQUENCE IF NOT EXISTS toolkit_entity_key_seq")
        .execute(pool)
        .await?;

    sqlx::query("CREATE SEQUENCE IF NOT EXISTS toolkit_entity_version_seq")
        .execute(pool)
        .await?;

    tracing::info!(
        table = ENTITY_TABLE,
        keys = KEY_SEQUENCE,
        versions = VERSION_SEQUENCE,
        "Entity schema ready"
    );
    Ok(())
}

type TransactionSlot = Arc<tokio::sync::Mutex<Option<Transaction<'static, Postgres>>>>;
type SharedTracker = Arc<Mutex<ChangeTracker<Value>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn fetch_row<'e>(
    executor: impl PgExecutor<'e>,
    entity: &str,
    key: &str,
) -> Result<Option<(i64, Value)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT version, body FROM toolkit_entities WHERE entity_type = $1 AND entity_key = $2",
    )
    .bind(entity)
    .bind(key)
    .fetch_optional(executor)
    .await
}

async fn fetch_bodies<'e>(
    executor: impl PgExecutor<'e>,
    entity: &str,
) -> Result<Vec<(Value,)>, sqlx::Error> {
    sqlx::query_as("SELECT body FROM toolkit_entities WHERE entity_type = $1")
        .bind(entity)
        .fetch_all(executor)
        .await
}

/// Outcome of one written entry: `Some(version)` or `None` when deleted
struct Written {
    type_id: TypeId,
    key: String,
    version: Option<u64>,
}

/// Per-request persistence context over a PostgreSQL pool
pub struct PgContext {
    pool: PgPool,
    tracker: SharedTracker,
    transaction: TransactionSlot,
}

impl PgContext {
    /// Create a context over `pool`
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tracker: Arc::new(Mutex::new(ChangeTracker::default())),
            transaction: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    fn stage<E: Entity>(&self, entity: &E, state: EntryState) -> StoreResult<()> {
        let payload = match state {
            EntryState::Deleted => None,
            _ => Some(serde_json::to_value(entity)?),
        };
        lock(&self.tracker).stage(StagedEntry {
            type_id: TypeId::of::<E>(),
            entity: E::entity_name(),
            key: entity.key().to_string(),
            state,
            payload,
        });
        Ok(())
    }

    async fn write_batch(
        conn: &mut sqlx::PgConnection,
        batch: &[(StagedEntry<Value>, Option<u64>)],
    ) -> StoreResult<Vec<Written>> {
        let mut conflicts = Vec::new();
        let mut written = Vec::with_capacity(batch.len());

        for (entry, expected) in batch {
            let expected = expected.map(|v| v as i64);
            let version: Option<u64> = match (entry.state, &entry.payload) {
                (EntryState::Added, Some(body)) => {
                    let inserted: Option<(i64,)> = sqlx::query_as(
                        "INSERT INTO toolkit_entities (entity_type, entity_key, version, body)
                         VALUES ($1, $2, nextval('toolkit_entity_version_seq'), $3)
                         ON CONFLICT DO NOTHING
                         RETURNING version",
                    )
                    .bind(entry.entity)
                    .bind(&entry.key)
                    .bind(body)
                    .fetch_optional(&mut *conn)
                    .await?;
                    let Some((version,)) = inserted else {
                        return Err(StoreError::DuplicateKey {
                            entity: entry.entity,
                            key: entry.key.clone(),
                        });
                    };
                    Some(version as u64)
                }
                (EntryState::Modified, Some(body)) => {
                    let updated: Option<(i64,)> = sqlx::query_as(
                        "UPDATE toolkit_entities
                         SET body = $3, version = nextval('toolkit_entity_version_seq')
                         WHERE entity_type = $1 AND entity_key = $2
                           AND ($4::BIGINT IS NULL OR version = $4)
                         RETURNING version",
                    )
                    .bind(entry.entity)
                    .bind(&entry.key)
                    .bind(body)
                    .bind(expected)
                    .fetch_optional(&mut *conn)
                    .await?;
                    match updated {
                        Some((version,)) => Some(version as u64),
                        None => {
                            conflicts.push(ConflictEntry {
                                type_id: entry.type_id,
                                entity: entry.entity,
                                key: entry.key.clone(),
                            });
                            continue;
                        }
                    }
                }
                _ => {
                    let deleted = sqlx::query(
                        "DELETE FROM toolkit_entities
                         WHERE entity_type = $1 AND entity_key = $2
                           AND ($3::BIGINT IS NULL OR version = $3)",
                    )
                    .bind(entry.entity)
                    .bind(&entry.key)
                    .bind(expected)
                    .execute(&mut *conn)
                    .await?;
                    if deleted.rows_affected() == 0 {
                        conflicts.push(ConflictEntry {
                            type_id: entry.type_id,
                            entity: entry.entity,
                            key: entry.key.clone(),
                        });
                        continue;
                    }
                    None
                }
            };

            written.push(Written {
                type_id: entry.type_id,
                key: entry.key.clone(),
                version,
            });
        }

        if conflicts.is_empty() {
            Ok(written)
        } else {
            Err(StoreError::Concurrency { entries: conflicts })
        }
    }
}

impl ContextFactory for PgPool {
    type Context = PgContext;

    fn create_context(&self) -> PgContext {
        PgContext::new(self.clone())
    }
}

impl PersistenceContext for PgContext {
    type Transaction = PgTransaction;

    async fn find<E: Entity>(&self, key: &E::Key) -> StoreResult<Option<E>> {
        let key = key.to_string();
        let mut slot = self.transaction.lock().await;
        let row = match slot.as_mut() {
            Some(tx) => fetch_row(&mut **tx, E::entity_name(), &key).await?,
            None => fetch_row(&self.pool, E::entity_name(), &key).await?,
        };
        drop(slot);

        let Some((version, body)) = row else {
            return Ok(None);
        };
        let entity: E = serde_json::from_value(body)?;
        lock(&self.tracker).observe(TypeId::of::<E>(), &key, version as u64);
        Ok(Some(entity))
    }

    async fn query_all<E: Entity>(&self) -> StoreResult<Vec<E>> {
        let mut slot = self.transaction.lock().await;
        let rows = match slot.as_mut() {
            Some(tx) => fetch_bodies(&mut **tx, E::entity_name()).await?,
            None => fetch_bodies(&self.pool, E::entity_name()).await?,
        };
        drop(slot);

        rows.into_iter()
            .map(|(body,)| serde_json::from_value(body).map_err(StoreError::from))
            .collect()
    }

    async fn add<E: Entity>(&self, mut entity: E) -> StoreResult<E> {
        if !entity.key().is_set() {
            let (sequence,): (i64,) = sqlx::query_as("SELECT nextval('toolkit_entity_key_seq')")
                .fetch_one(&self.pool)
                .await?;
            let key = E::Key::generate(sequence as u64).ok_or(StoreError::MissingKey {
                entity: E::entity_name(),
            })?;
            entity.set_key(key);
        }
        self.stage(&entity, EntryState::Added)?;
        Ok(entity)
    }

    fn update<E: Entity>(&self, entity: &E) -> StoreResult<()> {
        self.stage(entity, EntryState::Modified)
    }

    fn remove<E: Entity>(&self, entity: &E) -> StoreResult<()> {
        self.stage(entity, EntryState::Deleted)
    }

    async fn save_changes(&self, cancel: Option<&CancellationToken>) -> StoreResult<usize> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(StoreError::Cancelled);
        }

        let batch: Vec<(StagedEntry<Value>, Option<u64>)> = {
            let mut tracker = lock(&self.tracker);
            let staged = tracker.take_staged();
            staged
                .into_iter()
                .map(|entry| {
                    let expected = tracker.version(entry.type_id, &entry.key);
                    (entry, expected)
                })
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let result = async {
            let mut slot = self.transaction.lock().await;
            let mut local: Transaction<'_, Postgres> = match slot.as_mut() {
                Some(outer) => Acquire::begin(&mut **outer).await?,
                None => self.pool.begin().await?,
            };
            let written = Self::write_batch(&mut local, &batch).await?;
            local.commit().await?;
            Ok::<_, StoreError>(written)
        }
        .await;

        let mut tracker = lock(&self.tracker);
        match result {
            Ok(written) => {
                for w in &written {
                    match w.version {
                        Some(version) => tracker.remember(w.type_id, &w.key, version),
                        None => tracker.forget(w.type_id, &w.key),
                    }
                }
                Ok(written.len())
            }
            Err(err) => {
                tracker.restore_staged(batch.into_iter().map(|(entry, _)| entry));
                Err(err)
            }
        }
    }

    async fn reload(&self, entries: &[ConflictEntry]) -> StoreResult<()> {
        let mut slot = self.transaction.lock().await;
        let mut current = Vec::with_capacity(entries.len());
        for entry in entries {
            let row = match slot.as_mut() {
                Some(tx) => fetch_row(&mut **tx, entry.entity, &entry.key).await?,
                None => fetch_row(&self.pool, entry.entity, &entry.key).await?,
            };
            current.push(row.map(|(version, _)| version as u64));
        }
        drop(slot);

        let mut tracker = lock(&self.tracker);
        for (entry, version) in entries.iter().zip(current) {
            tracker.discard(entry.type_id, &entry.key);
            match version {
                Some(version) => tracker.remember(entry.type_id, &entry.key, version),
                None => tracker.forget(entry.type_id, &entry.key),
            }
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> StoreResult<PgTransaction> {
        let mut slot = self.transaction.lock().await;
        if slot.is_some() {
            return Err(StoreError::TransactionInProgress);
        }
        *slot = Some(self.pool.begin().await?);

        Ok(PgTransaction {
            slot: Arc::clone(&self.transaction),
            tracker: Arc::clone(&self.tracker),
            saved_versions: lock(&self.tracker).versions_snapshot(),
            open: true,
        })
    }
}

/// Transaction handle for a [`PgContext`]
pub struct PgTransaction {
    slot: TransactionSlot,
    tracker: SharedTracker,
    /// Tracked versions at begin, put back if the transaction does not commit
    saved_versions: HashMap<(TypeId, String), u64>,
    open: bool,
}

impl PgTransaction {
    fn restore_versions(&mut self) {
        let saved = std::mem::take(&mut self.saved_versions);
        lock(&self.tracker).restore_versions(saved);
    }
}

impl ContextTransaction for PgTransaction {
    async fn commit(&mut self) -> StoreResult<()> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        let tx = self.slot.lock().await.take();
        if let Some(tx) = tx {
            if let Err(err) = tx.commit().await {
                self.restore_versions();
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        self.restore_versions();
        let tx = self.slot.lock().await.take();
        if let Some(tx) = tx {
            tx.rollback().await?;
        }
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        self.restore_versions();
        // sqlx rolls back a transaction that is dropped uncommitted. If the slot
        // is busy the transaction stays attached until the context is dropped.
        if let Ok(mut slot) = self.slot.try_lock() {
            slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{BaseRepository, Repository};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tag {
        id: String,
        label: String,
    }

    impl Entity for Tag {
        type Key = String;

        fn key(&self) -> &String {
            &self.id
        }

        fn set_key(&mut self, key: String) {
            self.id = key;
        }
    }

    fn tag(id: &str, label: &str) -> Tag {
        Tag {
            id: id.to_string(),
            label: label.to_string(),
        }
    }

    /// Pool against the database named by `DATABASE_URL`, schema in place
    async fn live_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must name a test database");
        let pool = PgPool::connect(&url).await.expect("connect to test database");
        ensure_schema(&pool).await.expect("create schema");
        pool
    }

    /// A key no earlier run has used
    fn fresh_key() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    async fn seed(pool: &PgPool, entity: Tag) -> Tag {
        let ctx = pool.create_context();
        let entity = ctx.add(entity).await.unwrap();
        ctx.save_changes(None).await.unwrap();
        entity
    }

    #[test]
    fn test_schema_names() {
        assert_eq!(ENTITY_TABLE, "toolkit_entities");
        assert_eq!(KEY_SEQUENCE, "toolkit_entity_key_seq");
        assert_eq!(VERSION_SEQUENCE, "toolkit_entity_version_seq");
    }

    #[tokio::test]
    async fn test_staging_serializes_entities() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        let ctx = pool.create_context();
        ctx.update(&tag("rust", "lang")).unwrap();
        ctx.remove(&tag("go", "lang")).unwrap();
        assert_eq!(lock(&ctx.tracker).staged_len(), 2);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_stale_update_conflicts_until_reloaded() {
        let pool = live_pool().await;
        let key = fresh_key();
        seed(&pool, tag(&key, "original")).await;

        let stale = pool.create_context();
        let mut mine = stale.find::<Tag>(&key).await.unwrap().unwrap();

        let other = pool.create_context();
        let mut theirs = other.find::<Tag>(&key).await.unwrap().unwrap();
        theirs.label = "theirs".into();
        other.update(&theirs).unwrap();
        other.save_changes(None).await.unwrap();

        mine.label = "mine".into();
        stale.update(&mine).unwrap();
        let StoreError::Concurrency { entries } = stale.save_changes(None).await.unwrap_err() else {
            panic!("expected a concurrency conflict");
        };
        assert_eq!(entries.len(), 1);

        stale.reload(&entries).await.unwrap();
        stale.update(&mine).unwrap();
        assert_eq!(stale.save_changes(None).await.unwrap(), 1);

        let fresh = pool.create_context();
        assert_eq!(fresh.find::<Tag>(&key).await.unwrap().unwrap().label, "mine");
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_repository_update_retries_after_conflict() {
        let pool = live_pool().await;
        let key = fresh_key();
        seed(&pool, tag(&key, "original")).await;

        let repo = BaseRepository::<PgContext, Tag>::new(Arc::new(pool.create_context()));
        let mut mine = repo.find_by_id(&key).await.unwrap().unwrap();

        let other = BaseRepository::<PgContext, Tag>::new(Arc::new(pool.create_context()));
        other.update(tag(&key, "theirs")).await.unwrap();

        mine.label = "mine".into();
        assert_eq!(repo.update(mine).await.unwrap().label, "mine");
        let stored = other.context().find::<Tag>(&key).await.unwrap().unwrap();
        assert_eq!(stored.label, "mine");
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_stale_delete_conflicts() {
        let pool = live_pool().await;
        let key = fresh_key();
        seed(&pool, tag(&key, "original")).await;

        let stale = pool.create_context();
        let loaded = stale.find::<Tag>(&key).await.unwrap().unwrap();

        let other = pool.create_context();
        other.update(&tag(&key, "theirs")).unwrap();
        other.save_changes(None).await.unwrap();

        stale.remove(&loaded).unwrap();
        let err = stale.save_changes(None).await.unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert!(other.find::<Tag>(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_duplicate_insert_is_rejected() {
        let pool = live_pool().await;
        let key = fresh_key();
        seed(&pool, tag(&key, "original")).await;

        let ctx = pool.create_context();
        ctx.add(tag(&key, "again")).await.unwrap();
        let err = ctx.save_changes(None).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(lock(&ctx.tracker).staged_len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_failed_flush_in_transaction_keeps_it_usable() {
        let pool = live_pool().await;
        let taken = fresh_key();
        let free = fresh_key();
        seed(&pool, tag(&taken, "original")).await;

        let ctx = pool.create_context();
        let mut tx = ctx.begin_transaction().await.unwrap();
        ctx.add(tag(&taken, "clash")).await.unwrap();
        assert!(ctx.save_changes(None).await.is_err());
        ctx.reload(&[ConflictEntry {
            type_id: TypeId::of::<Tag>(),
            entity: Tag::entity_name(),
            key: taken.clone(),
        }])
        .await
        .unwrap();

        ctx.add(tag(&free, "fine")).await.unwrap();
        assert_eq!(ctx.save_changes(None).await.unwrap(), 1);
        tx.commit().await.unwrap();

        let fresh = pool.create_context();
        assert_eq!(fresh.find::<Tag>(&free).await.unwrap().unwrap().label, "fine");
        assert_eq!(fresh.find::<Tag>(&taken).await.unwrap().unwrap().label, "original");
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_rollback_discards_writes_and_versions() {
        let pool = live_pool().await;
        let key = fresh_key();
        seed(&pool, tag(&key, "original")).await;

        let mine = pool.create_context();
        let mut loaded = mine.find::<Tag>(&key).await.unwrap().unwrap();
        let mut tx = mine.begin_transaction().await.unwrap();
        loaded.label = "draft".into();
        mine.update(&loaded).unwrap();
        mine.save_changes(None).await.unwrap();
        tx.rollback().await.unwrap();

        let other = pool.create_context();
        assert_eq!(other.find::<Tag>(&key).await.unwrap().unwrap().label, "original");
        other.update(&tag(&key, "theirs")).unwrap();
        other.save_changes(None).await.unwrap();

        loaded.label = "mine".into();
        mine.update(&loaded).unwrap();
        let err = mine.save_changes(None).await.unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert_eq!(other.find::<Tag>(&key).await.unwrap().unwrap().label, "theirs");
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_commit_makes_writes_visible() {
        let pool = live_pool().await;
        let key = fresh_key();

        let ctx = pool.create_context();
        let mut tx = ctx.begin_transaction().await.unwrap();
        ctx.add(tag(&key, "inside")).await.unwrap();
        ctx.save_changes(None).await.unwrap();

        let outside = pool.create_context();
        assert!(outside.find::<Tag>(&key).await.unwrap().is_none());

        tx.commit().await.unwrap();
        assert!(outside.find::<Tag>(&key).await.unwrap().is_some());
    }
}
