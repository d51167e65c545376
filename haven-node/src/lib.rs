//! Haven Node
//!
//! The backend's top layer: reads recovery state at boot, drives the
//! hidden-service and transport launch sequence exactly once per
//! community, persists peer-connection telemetry, and owns teardown.

pub mod data_dir;
pub mod local_db;
pub mod orchestrator;
pub mod providers;

// Re-exports
pub use data_dir::DataDir;
pub use local_db::{LocalDb, LocalDbError, StateKey};
pub use orchestrator::{
    LaunchPayload, NetworkIdentity, NetworkOrchestrator, OrchestratorBuilder, OrchestratorError,
    OverlayProvider,
};
pub use providers::{IrohOverlayProvider, MemoryOverlayProvider};
