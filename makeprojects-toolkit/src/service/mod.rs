//! Domain services
//!
//! [`CrudService`] is the uniform CRUD surface for one entity type, and
//! [`BaseCrudService`] its default implementation over any
//! [`Repository`](crate::repository::Repository). Every operation runs inside
//! an [`OperationScope`]: entry and exit are traced, inputs are checked for
//! presence, and failures are logged before being returned unchanged.
//!
//! Concrete services wrap a `BaseCrudService` and delegate whatever they do not
//! override:
//!
//! ```rust,ignore
//! struct ProjectService<R> {
//!     inner: BaseCrudService<Project, R>,
//! }
//!
//! impl<R: Repository<Project>> CrudService<Project> for ProjectService<R> {
//!     async fn create(&self, project: impl Into<Option<Project>> + Send) -> Result<Project> {
//!         let project = project.into();
//!         if let Some(p) = &project {
//!             p.validate()?;
//!         }
//!         self.inner.create(project).await
//!     }
//!     // get_by_id, get_all, update, delete delegate to `self.inner`
//! }
//! ```

mod base;
mod traits;

pub use base::{BaseCrudService, OperationScope};
pub use traits::{CrudService, Service};
