use std::future::Future;

use crate::entity::Entity;
use crate::error::Result;

/// Marker for domain services resolved from a request scope
pub trait Service: Send + Sync {
    /// Optional human-readable description
    fn description(&self) -> Option<&str> {
        None
    }
}

/// CRUD operations for one entity type
///
/// `create` and `update` accept anything convertible into `Option<E>`; `None`
/// stands for an absent entity and fails with `InvalidArgument`.
pub trait CrudService<E: Entity>: Service {
    /// Persist a new entity
    fn create(&self, entity: impl Into<Option<E>> + Send)
        -> impl Future<Output = Result<E>> + Send;

    /// Fetch an entity, failing with `NotFound` when absent
    fn get_by_id(&self, id: &E::Key) -> impl Future<Output = Result<E>> + Send;

    /// All entities of this type
    fn get_all(&self) -> impl Future<Output = Result<Vec<E>>> + Send;

    /// Persist changes to an existing entity
    fn update(&self, entity: impl Into<Option<E>> + Send)
        -> impl Future<Output = Result<E>> + Send;

    /// Delete an entity by key
    fn delete(&self, id: &E::Key) -> impl Future<Output = Result<bool>> + Send;
}
