//! Compilation orchestration core

pub mod gateway;
pub mod mirror;
pub mod process_registry;
pub mod readiness;
pub mod sample;
pub mod workflow;

pub use gateway::{ArtifactGateway, GatewayError, MaterializeReport, PersistReport};
pub use process_registry::{
    ProcessEvent, ProcessInfo, ProcessRegistry, RegistryError, SharedProcessRegistry,
};
pub use readiness::ReadinessWaiter;
pub use workflow::{Stage, Workflow, WorkflowError, WorkflowSummary};
