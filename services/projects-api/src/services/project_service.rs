use makeprojects_toolkit::context::memory::MemoryContext;
use makeprojects_toolkit::prelude::*;

use crate::models::Project;

/// Repository used by the service when running on the in-process store
pub type ProjectRepository = BaseRepository<MemoryContext, Project>;

/// Project CRUD with name validation and an existence check before updates
pub struct ProjectService<R = ProjectRepository> {
    inner: BaseCrudService<Project, R>,
}

impl<R: Repository<Project>> ProjectService<R> {
    pub fn new(repository: R) -> Self {
        Self {
            inner: BaseCrudService::new(repository).with_description("Manages MakeProjects projects"),
        }
    }
}

fn validate(project: &Project) -> Result<()> {
    if project.name.trim().is_empty() {
        return Err(Error::invalid_argument("name", "Project name is required."));
    }
    Ok(())
}

impl<R: Repository<Project>> Service for ProjectService<R> {
    fn description(&self) -> Option<&str> {
        self.inner.description()
    }
}

impl<R: Repository<Project>> CrudService<Project> for ProjectService<R> {
    async fn create(&self, project: impl Into<Option<Project>> + Send) -> Result<Project> {
        let project = project.into();
        if let Some(project) = &project {
            validate(project)?;
        }
        self.inner.create(project).await
    }

    async fn get_by_id(&self, id: &String) -> Result<Project> {
        self.inner.get_by_id(id).await
    }

    async fn get_all(&self) -> Result<Vec<Project>> {
        self.inner.get_all().await
    }

    async fn update(&self, project: impl Into<Option<Project>> + Send) -> Result<Project> {
        let project = project.into();
        OperationScope::of::<Project>("ProjectService::update")
            .run(async {
                if let Some(existing) = &project {
                    validate(existing)?;
                    if existing.key().is_set()
                        && self.inner.repository().find_by_id(&existing.id).await?.is_none()
                    {
                        return Err(Error::NotFound(format!(
                            "Entity of type {} not found for update.",
                            Project::entity_name()
                        )));
                    }
                }
                self.inner.update(project).await
            })
            .await
    }

    async fn delete(&self, id: &String) -> Result<bool> {
        self.inner.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use makeprojects_toolkit::context::memory::MemoryStore;
    use std::sync::Arc;

    fn service(store: &MemoryStore) -> ProjectService {
        ProjectService::new(ProjectRepository::new(Arc::new(store.create_context())))
    }

    #[tokio::test]
    async fn test_blank_name_is_rejected() {
        let store = MemoryStore::new();
        let err = service(&store).create(Project::new("A1", "  ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(store.row_count::<Project>(), 0);
    }

    #[tokio::test]
    async fn test_update_of_unknown_project_is_not_found() {
        let store = MemoryStore::new();
        let err = service(&store).update(Project::new("Z9", "Ghost")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "Entity of type Project not found for update.");
    }

    #[tokio::test]
    async fn test_update_persists_changes() {
        let store = MemoryStore::new();
        service(&store).create(Project::new("A1", "Apollo")).await.unwrap();

        let mut renamed = Project::new("A1", "Artemis");
        renamed.archived = true;
        service(&store).update(renamed.clone()).await.unwrap();

        assert_eq!(service(&store).get_by_id(&"A1".to_string()).await.unwrap(), renamed);
    }

    #[test]
    fn test_description() {
        let store = MemoryStore::new();
        assert_eq!(service(&store).description(), Some("Manages MakeProjects projects"));
    }
}
