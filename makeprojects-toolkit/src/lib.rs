//! # makeprojects-toolkit
//!
//! Data-access and request-handling foundation for MakeProjects services.
//!
//! ## Features
//!
//! - **Generic repositories**: CRUD over any serializable entity with immediate flush
//!   and a single reload-and-retry on optimistic concurrency conflicts
//! - **Unit of Work**: idempotent transaction boundary scoped to one request
//! - **CRUD services**: uniform logging envelope with presence validation
//! - **Error-response middleware**: one recovery point mapping failures to JSON bodies
//! - **Registration**: per-request scopes sharing one persistence context
//! - **Backends**: in-process store (`memory`, default) and PostgreSQL (`database`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use makeprojects_toolkit::prelude::*;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Project {
//!     id: i64,
//!     name: String,
//! }
//!
//! impl Entity for Project {
//!     type Key = i64;
//!
//!     fn key(&self) -> &i64 {
//!         &self.id
//!     }
//!
//!     fn set_key(&mut self, key: i64) {
//!         self.id = key;
//!     }
//! }
//!
//! type Projects = BaseCrudService<Project, BaseRepository<MemoryContext, Project>>;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let provider = ServiceCollection::new(MemoryStore::new())
//!         .add_infrastructure(|services| {
//!             services.add_scoped(|scope| Ok(Projects::new(scope.repository::<Project>()?)));
//!         })
//!         .build();
//!
//!     let scope = provider.create_scope();
//!     let projects = scope.resolve::<Projects>()?;
//!     let created = projects
//!         .create(Project { id: 0, name: "Apollo".into() })
//!         .await?;
//!     info!(id = created.id, "created project");
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod registration;
pub mod repository;
pub mod service;
pub mod unit_of_work;

#[cfg(feature = "database")]
pub mod database;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, DatabaseConfig, ServiceConfig};

    pub use crate::context::{
        ContextFactory, ContextTransaction, EntryState, PersistenceContext, StoreResult,
    };

    #[cfg(feature = "memory")]
    pub use crate::context::memory::{MemoryContext, MemoryStore, MemoryTransaction};

    #[cfg(feature = "database")]
    pub use crate::context::postgres::{ensure_schema, PgContext, PgTransaction};

    #[cfg(feature = "database")]
    pub use crate::database::create_pool;

    pub use crate::entity::{Entity, EntityKey};
    pub use crate::error::{ConflictEntry, Error, ErrorKind, Result, StoreError};

    pub use crate::middleware::{
        handle_requests, ErrorBody, RequestHandlingExt, GENERIC_ERROR_MESSAGE,
    };

    pub use crate::observability::init_tracing;
    pub use crate::registration::{
        ContextOf, DomainServices, Scope, ServiceCollection, ServiceProvider,
    };
    pub use crate::repository::{BaseRepository, Repository};
    pub use crate::service::{BaseCrudService, CrudService, OperationScope, Service};
    pub use crate::unit_of_work::{ContextUnitOfWork, UnitOfWork};

    pub use axum::{
        extract::{Path, State},
        http::StatusCode,
        response::{IntoResponse, Json, Response},
        routing::{delete, get, post, put},
        Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros
    pub use tracing::{debug, error, info, trace, warn};

    // Re-export tokio for async runtime
    pub use tokio;

    pub use tokio_util::sync::CancellationToken;

    pub use uuid::Uuid;
}
