use makeprojects_toolkit::context::memory::MemoryStore;
use makeprojects_toolkit::prelude::*;

use crate::models::Project;

/// Health check endpoint
///
/// Returns "ok" if the service is running.
pub async fn health() -> &'static str {
    "ok"
}

/// Readiness check endpoint
///
/// Returns "ready" once a request scope can be opened and the project store read.
pub async fn readiness(scope: Scope<MemoryStore>) -> Result<&'static str> {
    scope.repository::<Project>()?.get_all().await?;
    Ok("ready")
}
