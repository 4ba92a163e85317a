// Shopfloor Library - workflow and bulk orchestration for small-business back offices
// This exposes the core components for testing and integration

pub mod bulk;
pub mod config;
pub mod gateway;
pub mod observability;
pub mod shutdown;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use bulk::{
    BulkOperation, BulkOperationOrchestrator, BulkStatus, OperationId, OperationProgress, OperationProgressTracker,
    OperationResult, OperationType, ProgressEvent, UnitError,
};
pub use config::{config, EngineConfig, ObservabilityConfig, ShopfloorConfig};
pub use gateway::{ActionGateway, GatewayError, GatewayRequest, GatewayResponse, InMemoryStore, RemoteStore};
pub use observability::{GatewayMetrics, OperationTimer};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflow::{
    available_transitions, Entity, EntityId, TransitionError, TransitionName, WorkflowStateMachine, WorkflowStatus,
};
