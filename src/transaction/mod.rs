// ============================================================================
// Transaction Context Model
// ============================================================================
//
// In-memory bookkeeping of a logical transaction that spans several physical
// data sources, and the manager that turns it into a saga on commit or
// rollback.
//
// ============================================================================

pub mod context;
pub mod group;
pub mod manager;
pub mod state;

pub use context::{BranchHandle, SagaTransaction, SharedConnection};
pub use group::LogicSqlGroup;
pub use manager::{SagaSession, SagaTransactionManager};
pub use state::{BranchKey, BranchTransaction, ExecuteStatus};
