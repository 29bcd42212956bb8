pub mod health;
pub mod projects;

pub use health::{health, readiness};
pub use projects::{create_project, delete_project, get_project, list_projects, update_project};
