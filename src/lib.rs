// ============================================================================
// ShardSaga Library
// ============================================================================
//
// Saga-based distributed transactions for sharded SQL. Each routed physical
// statement is recorded as a branch with a precomputed compensation; on
// commit or rollback the branches are replayed as a saga that either finishes
// forward or compensates backward.
//
// ============================================================================

pub mod config;
pub mod connection;
pub mod core;
pub mod definition;
pub mod engine;
pub mod persistence;
pub mod revert;
pub mod transaction;
pub mod transport;

pub use config::{PersistenceConfig, SagaConfiguration};
pub use connection::{DataSource, DataSourceRegistry, ResultRow, SqlConnection};
pub use crate::core::{Params, Result, SagaError, Value};
pub use definition::{
    RecoveryPolicy, SagaDefinition, SagaDefinitionBuilder, SagaRequest, SqlOperation, ROLLBACK_TAG,
};
pub use engine::{RecoveryReport, SagaExecutor, SagaGraph, SagaOutcome};
pub use persistence::{
    open_persistence, EmptySagaPersistence, FileSagaPersistence, MemorySagaPersistence, SagaEvent,
    SagaEventType, SagaPersistence, SagaSnapshot,
};
pub use revert::{revert, RevertSqlResult, RoutedStatement, StatementKind};
pub use transaction::{
    BranchKey, BranchTransaction, ExecuteStatus, SagaSession, SagaTransaction,
    SagaTransactionManager,
};
pub use transport::{
    DirectTransport, SagaTransport, ShardingTransport, TransportMode, TransportOutcome,
    TransportRequest,
};
