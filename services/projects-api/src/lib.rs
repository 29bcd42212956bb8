pub mod handlers;
pub mod models;
pub mod services;

use axum::extract::FromRef;
use makeprojects_toolkit::context::memory::MemoryStore;
use makeprojects_toolkit::prelude::*;

use crate::models::Project;
use crate::services::{ProjectRepository, ProjectService};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub provider: ServiceProvider<MemoryStore>,
}

impl AppState {
    pub fn new(config: Config, store: MemoryStore) -> Self {
        Self {
            config,
            provider: build_provider(store),
        }
    }
}

impl FromRef<AppState> for ServiceProvider<MemoryStore> {
    fn from_ref(state: &AppState) -> Self {
        state.provider.clone()
    }
}

/// Register repositories, the unit of work, and the project service
pub fn build_provider(store: MemoryStore) -> ServiceProvider<MemoryStore> {
    ServiceCollection::new(store)
        .add_infrastructure(|services| {
            services.add_scoped(|scope| {
                let repository: ProjectRepository = scope.repository::<Project>()?;
                Ok(ProjectService::new(repository))
            });
        })
        .build()
}

/// Project routes, without state or middleware
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::readiness))
        .route(
            "/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        .route(
            "/projects/{id}",
            get(handlers::get_project)
                .put(handlers::update_project)
                .delete(handlers::delete_project),
        )
}

/// Complete application router with the error-response middleware installed
pub fn router(state: AppState) -> Router {
    routes().with_state(state).with_request_handling()
}
