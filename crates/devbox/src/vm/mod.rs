//! Container records and the lifecycle orchestrator.

mod error;
mod models;
mod repository;
mod service;

pub use error::{OrchestratorError, OrchestratorResult};
pub use models::{ContainerRecord, VmState, VmStatus};
pub use repository::VmRepository;
pub use service::Orchestrator;
