//! Dependency registration and request scopes
//!
//! A [`ServiceCollection`] gathers the wiring a host application needs at
//! startup; [`ServiceCollection::build`] freezes it into a cloneable
//! [`ServiceProvider`]. Each request then opens a [`Scope`] that owns one
//! persistence context. Repositories, the unit of work, and domain services
//! resolved from the same scope all share that context.
//!
//! # Example
//!
//! ```rust,ignore
//! let provider = ServiceCollection::new(MemoryStore::new())
//!     .add_infrastructure(|services| {
//!         services.add_scoped(|scope| Ok(ProjectService::new(scope.repository::<Project>()?)));
//!     })
//!     .build();
//!
//! let scope = provider.create_scope();
//! let projects = scope.resolve::<ProjectService<_>>()?;
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;

use crate::context::ContextFactory;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::repository::BaseRepository;
use crate::service::Service;
use crate::unit_of_work::ContextUnitOfWork;

type Resolved = Arc<dyn Any + Send + Sync>;
type ServiceFactory<F> = Arc<dyn Fn(&Scope<F>) -> Result<Resolved> + Send + Sync>;

/// Context type produced by factory `F`
pub type ContextOf<F> = <F as ContextFactory>::Context;

struct Registrations<F: ContextFactory> {
    repositories: bool,
    services: HashMap<TypeId, ServiceFactory<F>>,
}

/// Registry handed to [`ServiceCollection::add_domain_services`]
pub struct DomainServices<F: ContextFactory> {
    services: HashMap<TypeId, ServiceFactory<F>>,
}

impl<F: ContextFactory> DomainServices<F> {
    /// Register a service created once per scope
    ///
    /// Registering the same type again replaces the earlier factory.
    pub fn add_scoped<T, B>(&mut self, build: B) -> &mut Self
    where
        T: Service + 'static,
        B: Fn(&Scope<F>) -> Result<T> + Send + Sync + 'static,
    {
        let factory: ServiceFactory<F> =
            Arc::new(move |scope| build(scope).map(|service| Arc::new(service) as Resolved));
        self.services.insert(TypeId::of::<T>(), factory);
        self
    }
}

/// Startup-time registration surface
pub struct ServiceCollection<F: ContextFactory> {
    factory: F,
    registrations: Registrations<F>,
}

impl<F: ContextFactory> ServiceCollection<F> {
    /// Start a collection whose scopes draw contexts from `factory`
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            registrations: Registrations {
                repositories: false,
                services: HashMap::new(),
            },
        }
    }

    /// Register the unit of work and generic repositories
    pub fn add_repositories(mut self) -> Self {
        self.registrations.repositories = true;
        self
    }

    /// Register domain services
    pub fn add_domain_services(mut self, register: impl FnOnce(&mut DomainServices<F>)) -> Self {
        let mut services = DomainServices {
            services: std::mem::take(&mut self.registrations.services),
        };
        register(&mut services);
        self.registrations.services = services.services;
        self
    }

    /// Register repositories, the unit of work, and domain services
    pub fn add_infrastructure(self, register: impl FnOnce(&mut DomainServices<F>)) -> Self {
        self.add_repositories().add_domain_services(register)
    }

    /// Freeze the registrations
    pub fn build(self) -> ServiceProvider<F> {
        tracing::debug!(
            repositories = self.registrations.repositories,
            services = self.registrations.services.len(),
            "Service provider built"
        );
        ServiceProvider {
            factory: self.factory,
            registrations: Arc::new(self.registrations),
        }
    }
}

/// Cloneable source of request scopes
pub struct ServiceProvider<F: ContextFactory> {
    factory: F,
    registrations: Arc<Registrations<F>>,
}

impl<F: ContextFactory> Clone for ServiceProvider<F> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            registrations: Arc::clone(&self.registrations),
        }
    }
}

impl<F: ContextFactory> ServiceProvider<F> {
    /// Open a scope with a fresh persistence context
    pub fn create_scope(&self) -> Scope<F> {
        Scope {
            context: Arc::new(self.factory.create_context()),
            registrations: Arc::clone(&self.registrations),
            unit_of_work: OnceLock::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// The context factory
    pub fn factory(&self) -> &F {
        &self.factory
    }
}

/// One request's worth of services over a single persistence context
///
/// Dropping the scope rolls back a still-open transaction and releases the
/// context.
pub struct Scope<F: ContextFactory> {
    context: Arc<ContextOf<F>>,
    registrations: Arc<Registrations<F>>,
    unit_of_work: OnceLock<Arc<ContextUnitOfWork<ContextOf<F>>>>,
    resolved: Mutex<HashMap<TypeId, Resolved>>,
}

impl<F: ContextFactory> Scope<F> {
    /// The scope's persistence context
    pub fn context(&self) -> &Arc<ContextOf<F>> {
        &self.context
    }

    fn require_repositories(&self) -> Result<()> {
        if self.registrations.repositories {
            Ok(())
        } else {
            Err(Error::InvalidOperation(
                "Repositories are not registered; call add_repositories() first.".to_string(),
            ))
        }
    }

    /// Repository for entity type `E` over the scope's context
    pub fn repository<E: Entity>(&self) -> Result<BaseRepository<ContextOf<F>, E>> {
        self.require_repositories()?;
        Ok(BaseRepository::new(Arc::clone(&self.context)))
    }

    /// The scope's unit of work, created on first use
    pub fn unit_of_work(&self) -> Result<Arc<ContextUnitOfWork<ContextOf<F>>>> {
        self.require_repositories()?;
        let uow = self
            .unit_of_work
            .get_or_init(|| Arc::new(ContextUnitOfWork::new(Arc::clone(&self.context))));
        Ok(Arc::clone(uow))
    }

    /// Resolve a registered domain service, created once per scope
    pub fn resolve<T: Service + 'static>(&self) -> Result<Arc<T>> {
        let id = TypeId::of::<T>();
        let cached = self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();

        let service = match cached {
            Some(service) => service,
            None => {
                let factory = self.registrations.services.get(&id).ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "No service of type {} has been registered.",
                        type_name::<T>()
                    ))
                })?;
                // The lock is released while building so factories can resolve
                // their own dependencies
                let built = factory(self)?;
                Arc::clone(
                    self.resolved
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entry(id)
                        .or_insert(built),
                )
            }
        };

        service.downcast::<T>().map_err(|_| {
            Error::Internal(format!(
                "Registered service does not match type {}",
                type_name::<T>()
            ))
        })
    }
}

impl<S, F> FromRequestParts<S> for Scope<F>
where
    S: Send + Sync,
    F: ContextFactory,
    ServiceProvider<F>: FromRef<S>,
{
    type Rejection = Infallible;

    async fn from_request_parts(_parts: &mut Parts, state: &S) -> std::result::Result<Self, Self::Rejection> {
        Ok(ServiceProvider::<F>::from_ref(state).create_scope())
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::context::memory::{MemoryContext, MemoryStore};
    use crate::error::ErrorKind;
    use crate::repository::Repository;
    use crate::service::{BaseCrudService, CrudService};
    use crate::unit_of_work::UnitOfWork;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        id: i64,
        total: u32,
    }

    impl Entity for Invoice {
        type Key = i64;

        fn key(&self) -> &i64 {
            &self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = key;
        }
    }

    type InvoiceService = BaseCrudService<Invoice, BaseRepository<MemoryContext, Invoice>>;

    fn provider() -> ServiceProvider<MemoryStore> {
        ServiceCollection::new(MemoryStore::new())
            .add_infrastructure(|services| {
                services.add_scoped(|scope| {
                    Ok(InvoiceService::new(scope.repository::<Invoice>()?).with_description("Invoices"))
                });
            })
            .build()
    }

    #[tokio::test]
    async fn test_scope_shares_one_context() {
        let provider = provider();
        let scope = provider.create_scope();

        let uow = scope.unit_of_work().unwrap();
        let service = scope.resolve::<InvoiceService>().unwrap();
        assert!(Arc::ptr_eq(uow.context(), service.repository().context()));

        uow.begin_transaction().await.unwrap();
        service.create(Invoice { id: 0, total: 120 }).await.unwrap();
        uow.rollback_transaction().await.unwrap();

        assert_eq!(provider.factory().row_count::<Invoice>(), 0);
    }

    #[test]
    fn test_services_are_cached_per_scope() {
        let provider = provider();
        let scope = provider.create_scope();
        let first = scope.resolve::<InvoiceService>().unwrap();
        let second = scope.resolve::<InvoiceService>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.description(), Some("Invoices"));

        let other = provider.create_scope().resolve::<InvoiceService>().unwrap();
        assert!(!Arc::ptr_eq(&first, &other));

        assert!(Arc::ptr_eq(
            &scope.unit_of_work().unwrap(),
            &scope.unit_of_work().unwrap()
        ));
    }

    #[tokio::test]
    async fn test_scopes_see_committed_rows() {
        let provider = provider();
        let created = provider
            .create_scope()
            .repository::<Invoice>()
            .unwrap()
            .add(Invoice { id: 0, total: 40 })
            .await
            .unwrap();

        let found = provider
            .create_scope()
            .resolve::<InvoiceService>()
            .unwrap()
            .get_by_id(&created.id)
            .await
            .unwrap();
        assert_eq!(found.total, 40);
    }

    #[test]
    fn test_unregistered_lookups_fail() {
        let bare = ServiceCollection::new(MemoryStore::new()).build();
        let scope = bare.create_scope();

        let err = scope.repository::<Invoice>().err().expect("repositories are not registered");
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        let err = scope.unit_of_work().err().expect("unit of work is not registered");
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        let err = scope.resolve::<InvoiceService>().err().expect("service is not registered");
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_hooks_compose() {
        let provider = ServiceCollection::new(MemoryStore::new())
            .add_domain_services(|services| {
                services.add_scoped(|scope| Ok(InvoiceService::new(scope.repository::<Invoice>()?)));
            })
            .build();

        // Domain services alone do not enable repositories
        let err = provider
            .create_scope()
            .resolve::<InvoiceService>()
            .err()
            .expect("repositories are not registered");
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }
}
