//! Generic repositories over a persistence context
//!
//! This module provides the generic CRUD contract every entity repository
//! satisfies, plus a default implementation that works for any entity type on
//! any [`PersistenceContext`](crate::context::PersistenceContext).
//!
//! # Features
//!
//! - **Generic CRUD**: [`Repository`] trait for lookup, listing, insert, update, delete
//! - **Immediate flush**: every mutating operation persists before returning
//! - **Concurrency retry**: [`BaseRepository::update`](Repository::update) reloads and
//!   retries once on an optimistic concurrency conflict
//!
//! # Example
//!
//! ```rust,ignore
//! use makeprojects_toolkit::context::memory::MemoryStore;
//! use makeprojects_toolkit::repository::{BaseRepository, Repository};
//!
//! let store = MemoryStore::new();
//! let repo = BaseRepository::<_, Project>::new(Arc::new(store.create_context()));
//!
//! let project = repo.add(Project::new("Apollo")).await?;
//! assert!(repo.find_by_id(&project.id).await?.is_some());
//! ```

mod base;
mod traits;

pub use base::BaseRepository;
pub use traits::Repository;
