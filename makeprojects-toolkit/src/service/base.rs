//! Default CRUD service and the operation envelope it runs in

use std::future::Future;
use std::marker::PhantomData;

use super::traits::{CrudService, Service};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::repository::Repository;

/// Logging envelope around one service operation
///
/// Traces entry, logs failures at error level, and traces exit. The exit trace
/// is emitted from a drop guard, so it also runs when the future is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct OperationScope {
    operation: &'static str,
    entity: &'static str,
}

impl OperationScope {
    /// Scope for `operation` on entity type `entity`
    pub fn new(operation: &'static str, entity: &'static str) -> Self {
        Self { operation, entity }
    }

    /// Scope for `operation` on entity type `E`
    pub fn of<E: Entity>(operation: &'static str) -> Self {
        Self::new(operation, E::entity_name())
    }

    /// Run `body` inside the envelope, returning its result unchanged
    pub async fn run<T>(self, body: impl Future<Output = Result<T>>) -> Result<T> {
        tracing::trace!(entity = self.entity, "ENTRY: {} for entity={}", self.operation, self.entity);
        let _exit = ExitGuard(self);

        body.await.inspect_err(|e| {
            tracing::error!(
                error = %e,
                kind = %e.kind(),
                entity = self.entity,
                "Exception in {} for entity={}",
                self.operation,
                self.entity
            );
        })
    }
}

struct ExitGuard(OperationScope);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        tracing::trace!(entity = self.0.entity, "EXIT: {} for entity={}", self.0.operation, self.0.entity);
    }
}

/// Default [`CrudService`] over a repository
///
/// Adds presence checks and the [`OperationScope`] envelope; everything else is
/// delegated to the repository.
pub struct BaseCrudService<E, R> {
    repository: R,
    description: Option<String>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity, R: Repository<E>> BaseCrudService<E, R> {
    /// Create a service over `repository`
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            description: None,
            _entity: PhantomData,
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The wrapped repository
    pub fn repository(&self) -> &R {
        &self.repository
    }
}

fn require_key<E: Entity>(id: &E::Key) -> Result<()> {
    if id.to_string().is_empty() {
        return Err(Error::invalid_argument(
            "id",
            "Entity primary key cannot be null",
        ));
    }
    Ok(())
}

fn require_entity<E>(entity: Option<E>) -> Result<E> {
    entity.ok_or_else(|| Error::invalid_argument("entity", "Entity cannot be null"))
}

impl<E: Entity, R: Repository<E>> Service for BaseCrudService<E, R> {
    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl<E: Entity, R: Repository<E>> CrudService<E> for BaseCrudService<E, R> {
    async fn create(&self, entity: impl Into<Option<E>> + Send) -> Result<E> {
        let entity = entity.into();
        OperationScope::of::<E>("BaseCrudService::create")
            .run(async move {
                let entity = require_entity(entity)?;
                self.repository.add(entity).await
            })
            .await
    }

    async fn get_by_id(&self, id: &E::Key) -> Result<E> {
        OperationScope::of::<E>("BaseCrudService::get_by_id")
            .run(async {
                require_key::<E>(id)?;
                self.repository.find_by_id(id).await?.ok_or_else(|| {
                    Error::NotFound(format!(
                        "Entity of type {} with ID {} not found.",
                        E::entity_name(),
                        id
                    ))
                })
            })
            .await
    }

    async fn get_all(&self) -> Result<Vec<E>> {
        OperationScope::of::<E>("BaseCrudService::get_all")
            .run(self.repository.get_all())
            .await
    }

    async fn update(&self, entity: impl Into<Option<E>> + Send) -> Result<E> {
        let entity = entity.into();
        OperationScope::of::<E>("BaseCrudService::update")
            .run(async move {
                let entity = require_entity(entity)?;
                self.repository.update(entity).await
            })
            .await
    }

    async fn delete(&self, id: &E::Key) -> Result<bool> {
        OperationScope::of::<E>("BaseCrudService::delete")
            .run(async {
                require_key::<E>(id)?;
                self.repository.remove(id).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::error::ErrorKind;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ticket {
        id: String,
        summary: String,
    }

    impl Entity for Ticket {
        type Key = String;

        fn key(&self) -> &String {
            &self.id
        }

        fn set_key(&mut self, key: String) {
            self.id = key;
        }
    }

    fn ticket(id: &str, summary: &str) -> Ticket {
        Ticket {
            id: id.to_string(),
            summary: summary.to_string(),
        }
    }

    /// Map-backed repository that counts every call
    #[derive(Default)]
    struct RecordingRepository {
        rows: Mutex<HashMap<String, Ticket>>,
        calls: AtomicUsize,
        fail_with_conflict: bool,
    }

    impl RecordingRepository {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn touch(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_conflict {
                return Err(Error::Conflict("ticket is locked".into()));
            }
            Ok(())
        }
    }

    impl Repository<Ticket> for Arc<RecordingRepository> {
        async fn find_by_id(&self, id: &String) -> Result<Option<Ticket>> {
            self.touch()?;
            Ok(self.rows.lock().unwrap().get(id).cloned())
        }

        async fn get_all(&self) -> Result<Vec<Ticket>> {
            self.touch()?;
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }

        async fn add(&self, entity: Ticket) -> Result<Ticket> {
            self.touch()?;
            self.rows
                .lock()
                .unwrap()
                .insert(entity.id.clone(), entity.clone());
            Ok(entity)
        }

        async fn update(&self, entity: Ticket) -> Result<Ticket> {
            self.touch()?;
            self.rows
                .lock()
                .unwrap()
                .insert(entity.id.clone(), entity.clone());
            Ok(entity)
        }

        async fn remove(&self, id: &String) -> Result<bool> {
            self.touch()?;
            Ok(self.rows.lock().unwrap().remove(id).is_some())
        }
    }

    fn service() -> (
        Arc<RecordingRepository>,
        BaseCrudService<Ticket, Arc<RecordingRepository>>,
    ) {
        let repo = Arc::new(RecordingRepository::default());
        (Arc::clone(&repo), BaseCrudService::new(repo))
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (_, service) = service();
        service.create(ticket("A1", "broken build")).await.unwrap();

        let found = service.get_by_id(&"A1".to_string()).await.unwrap();
        assert_eq!(found, ticket("A1", "broken build"));
    }

    #[tokio::test]
    async fn test_absent_entity_never_reaches_repository() {
        let (repo, service) = service();

        let err = service.create(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "Entity cannot be null");

        let err = service.update(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        assert_eq!(repo.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_key_is_invalid_argument() {
        let (repo, service) = service();

        let err = service.get_by_id(&String::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = service.delete(&String::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        assert_eq!(repo.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let (_, service) = service();
        let err = service.get_by_id(&"Q7".to_string()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "Entity of type Ticket with ID Q7 not found.");
    }

    #[tokio::test]
    async fn test_repository_errors_pass_through() {
        let repo = Arc::new(RecordingRepository {
            fail_with_conflict: true,
            ..Default::default()
        });
        let service = BaseCrudService::<Ticket, _>::new(Arc::clone(&repo));

        let err = service.update(ticket("A1", "x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "ticket is locked");
        let err = service.get_all().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_description() {
        let (repo, plain) = service();
        assert_eq!(plain.description(), None);

        let described = BaseCrudService::<Ticket, _>::new(repo).with_description("Ticket desk");
        assert_eq!(described.description(), Some("Ticket desk"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_envelope_logs_entry_error_and_exit() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (_, service) = service();
        let _ = service.get_by_id(&"missing".to_string()).await;

        let text = logs.text();
        assert!(text.contains("ENTRY: BaseCrudService::get_by_id for entity=Ticket"));
        assert!(text.contains("Exception in BaseCrudService::get_by_id"));
        assert!(text.contains("EXIT: BaseCrudService::get_by_id for entity=Ticket"));
    }

    #[tokio::test]
    async fn test_exit_is_traced_when_cancelled() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let scope = OperationScope::new("slow", "Ticket");
        let pending = scope.run(std::future::pending::<Result<()>>());
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(5), pending).await;
        assert!(timed_out.is_err());

        let text = logs.text();
        assert!(text.contains("ENTRY: slow for entity=Ticket"));
        assert!(text.contains("EXIT: slow for entity=Ticket"));
    }
}
