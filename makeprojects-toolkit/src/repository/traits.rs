//! Repository trait definition
//!
//! Uses RPITIT (Return Position Impl Trait In Traits) for async methods without
//! requiring `async_trait`.

use std::future::Future;

use crate::entity::Entity;
use crate::error::Result;

/// Generic CRUD repository for one entity type
///
/// Mutating operations flush to the store before returning; batching several
/// changes into one transaction is the job of a
/// [`UnitOfWork`](crate::unit_of_work::UnitOfWork).
pub trait Repository<E: Entity>: Send + Sync {
    /// Find an entity by its key
    ///
    /// Returns `Ok(None)` when no row exists; absence is never an error here.
    fn find_by_id(&self, id: &E::Key) -> impl Future<Output = Result<Option<E>>> + Send;

    /// All entities of this type, unordered
    fn get_all(&self) -> impl Future<Output = Result<Vec<E>>> + Send;

    /// Insert an entity and flush
    ///
    /// Returns the entity as stored, including a generated key if it had none.
    fn add(&self, entity: E) -> impl Future<Output = Result<E>> + Send;

    /// Update an existing entity and flush
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the entity's key is unset.
    fn update(&self, entity: E) -> impl Future<Output = Result<E>> + Send;

    /// Delete the entity with the given key and flush
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for an unset key, `NotFound` if no row exists.
    fn remove(&self, id: &E::Key) -> impl Future<Output = Result<bool>> + Send;
}
