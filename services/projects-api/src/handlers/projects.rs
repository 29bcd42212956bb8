use axum::extract::rejection::JsonRejection;
use makeprojects_toolkit::context::memory::MemoryStore;
use makeprojects_toolkit::prelude::*;

use crate::models::Project;
use crate::services::ProjectService;

type RequestScope = Scope<MemoryStore>;

/// JSON body that may be `null`; a malformed body is a bad request
type ProjectBody = std::result::Result<Json<Option<Project>>, JsonRejection>;

/// List all projects
pub async fn list_projects(scope: RequestScope) -> Result<Json<Vec<Project>>> {
    let projects = scope.resolve::<ProjectService>()?.get_all().await?;
    Ok(Json(projects))
}

/// Fetch one project
pub async fn get_project(scope: RequestScope, Path(id): Path<String>) -> Result<Json<Project>> {
    let project = scope.resolve::<ProjectService>()?.get_by_id(&id).await?;
    Ok(Json(project))
}

/// Create a project; a `null` body is rejected as a missing argument
pub async fn create_project(
    scope: RequestScope,
    body: ProjectBody,
) -> Result<(StatusCode, Json<Project>)> {
    let Json(project) = body?;
    let created = scope.resolve::<ProjectService>()?.create(project).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Replace a project inside a transaction
///
/// The key in the path wins over any key in the body.
pub async fn update_project(
    scope: RequestScope,
    Path(id): Path<String>,
    body: ProjectBody,
) -> Result<Json<Project>> {
    let Json(project) = body?;
    let project = project.map(|mut p| {
        p.id = id;
        p
    });

    let uow = scope.unit_of_work()?;
    uow.begin_transaction().await?;
    let updated = scope.resolve::<ProjectService>()?.update(project).await?;
    uow.commit_transaction().await?;

    Ok(Json(updated))
}

/// Delete a project
pub async fn delete_project(scope: RequestScope, Path(id): Path<String>) -> Result<StatusCode> {
    scope.resolve::<ProjectService>()?.delete(&id).await?;
    tracing::info!(project_id = %id, "Project deleted");
    Ok(StatusCode::NO_CONTENT)
}
