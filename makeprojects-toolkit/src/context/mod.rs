//! Persistence-context abstraction
//!
//! A persistence context is the stateful, request-scoped handle between the
//! repositories and the backing store. It stages changes in a change tracker,
//! flushes them on [`PersistenceContext::save_changes`], and owns at most one
//! open transaction at a time.
//!
//! # Backends
//!
//! - [`memory`]: in-process store shared between contexts (feature `memory`)
//! - [`postgres`]: JSONB-backed PostgreSQL store (feature `database`)
//!
//! # Optimistic concurrency
//!
//! Contexts remember the version of every row they write, and the version a row
//! had when it was first read; re-reading does not refresh it. Staged
//! updates and deletes of a remembered row only succeed if the stored row still
//! carries that version; otherwise the flush fails with
//! [`StoreError::Concurrency`] and nothing is written. [`PersistenceContext::reload`]
//! refreshes the remembered versions so a caller can retry.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::entity::{Entity, EntityKey};
use crate::error::{ConflictEntry, StoreError};

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "database")]
pub mod postgres;

mod tracker;

pub use tracker::EntryState;
pub(crate) use tracker::{ChangeTracker, StagedEntry};

/// Result type for persistence-context operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// ORM-style change-tracking context over a backing store
pub trait PersistenceContext: Send + Sync + 'static {
    /// Transaction handle type
    type Transaction: ContextTransaction;

    /// Point lookup by key; tracks the loaded row's version if not yet tracked
    fn find<E: Entity>(
        &self,
        key: &E::Key,
    ) -> impl Future<Output = StoreResult<Option<E>>> + Send;

    /// All rows of an entity type, without tracking
    fn query_all<E: Entity>(&self) -> impl Future<Output = StoreResult<Vec<E>>> + Send;

    /// Stage an insert, filling an unset key from the store's generator
    fn add<E: Entity>(&self, entity: E) -> impl Future<Output = StoreResult<E>> + Send;

    /// Stage an update of an existing row
    fn update<E: Entity>(&self, entity: &E) -> StoreResult<()>;

    /// Stage a delete of an existing row
    fn remove<E: Entity>(&self, entity: &E) -> StoreResult<()>;

    /// Whether the entity's key holds a real value
    fn is_key_set<E: Entity>(&self, entity: &E) -> bool {
        entity.key().is_set()
    }

    /// Flush staged changes, returning the number of entries written
    ///
    /// A cancelled token fails the flush with [`StoreError::Cancelled`] before
    /// anything is written. On failure the staged changes are kept.
    fn save_changes(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> impl Future<Output = StoreResult<usize>> + Send;

    /// Refresh the tracked versions of conflicting entries from the store and
    /// discard their staged changes
    fn reload(&self, entries: &[ConflictEntry]) -> impl Future<Output = StoreResult<()>> + Send;

    /// Open a transaction; fails if one is already open on this context
    fn begin_transaction(&self) -> impl Future<Output = StoreResult<Self::Transaction>> + Send;
}

/// Handle to an open transaction
///
/// Dropping a handle that was neither committed nor rolled back rolls the
/// transaction back.
pub trait ContextTransaction: Send + 'static {
    /// Make the transaction's writes durable
    fn commit(&mut self) -> impl Future<Output = StoreResult<()>> + Send;

    /// Discard the transaction's writes
    fn rollback(&mut self) -> impl Future<Output = StoreResult<()>> + Send;
}

/// Creates one persistence context per request scope
pub trait ContextFactory: Clone + Send + Sync + 'static {
    /// Context type produced by this factory
    type Context: PersistenceContext;

    /// Create a fresh context
    fn create_context(&self) -> Self::Context;
}
