//! Default repository over a persistence context

use std::marker::PhantomData;
use std::sync::Arc;

use super::traits::Repository;
use crate::context::PersistenceContext;
use crate::entity::{Entity, EntityKey};
use crate::error::{Error, Result, StoreError};

/// Generic repository for entity type `E` over context `C`
///
/// Holds no state beyond the shared context, so it is cheap to clone and can be
/// created on demand for any entity type.
pub struct BaseRepository<C, E> {
    context: Arc<C>,
    _entity: PhantomData<fn() -> E>,
}

impl<C, E> Clone for BaseRepository<C, E> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            _entity: PhantomData,
        }
    }
}

impl<C: PersistenceContext, E: Entity> BaseRepository<C, E> {
    /// Create a repository over a shared context
    pub fn new(context: Arc<C>) -> Self {
        Self {
            context,
            _entity: PhantomData,
        }
    }

    /// The underlying context
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }
}

impl<C: PersistenceContext, E: Entity> Repository<E> for BaseRepository<C, E> {
    async fn find_by_id(&self, id: &E::Key) -> Result<Option<E>> {
        Ok(self.context.find::<E>(id).await?)
    }

    async fn get_all(&self) -> Result<Vec<E>> {
        Ok(self.context.query_all::<E>().await?)
    }

    async fn add(&self, entity: E) -> Result<E> {
        let entity = self.context.add(entity).await?;
        self.context.save_changes(None).await?;
        Ok(entity)
    }

    async fn update(&self, entity: E) -> Result<E> {
        if !self.context.is_key_set(&entity) {
            return Err(Error::InvalidOperation(
                "Entity must have a key set to be updated.".to_string(),
            ));
        }

        self.context.update(&entity)?;
        match self.context.save_changes(None).await {
            Ok(_) => Ok(entity),
            Err(StoreError::Concurrency { entries }) => {
                tracing::warn!(
                    entity = E::entity_name(),
                    key = %entity.key(),
                    conflicts = entries.len(),
                    "Concurrency conflict on update, reloading and retrying once"
                );
                self.context.reload(&entries).await?;
                self.context.update(&entity)?;
                self.context.save_changes(None).await?;
                Ok(entity)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &E::Key) -> Result<bool> {
        if !id.is_set() {
            return Err(Error::InvalidOperation(
                "Entity must have a key set to be removed.".to_string(),
            ));
        }

        let Some(entity) = self.context.find::<E>(id).await? else {
            return Err(Error::NotFound(format!("Entity with key {id} not found.")));
        };
        if !self.context.is_key_set(&entity) {
            return Err(Error::InvalidOperation(
                "Entity must have a key set to be removed.".to_string(),
            ));
        }

        self.context.remove(&entity)?;
        self.context.save_changes(None).await?;
        Ok(true)
    }
}
