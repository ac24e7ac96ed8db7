// ============================================================================
// Saga Execution Engine
// ============================================================================
//
// Replays a saga definition: forward statements stage by stage, each with
// its own retry budget, then compensations in reverse stage order when the
// policy or the rollback tag asks for backward recovery.
//
// Every step is logged to saga persistence so a saga interrupted by a crash
// can be finished by `SagaExecutor::recover`.
//
// ============================================================================

pub mod executor;
pub mod graph;

pub use executor::{RecoveryReport, SagaExecutor, SagaOutcome};
pub use graph::{SagaGraph, SagaNode};
