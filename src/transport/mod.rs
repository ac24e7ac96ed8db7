//! Execution of a single saga request against a physical data source.
//!
//! [`ShardingTransport`] replays a live transaction through its cached
//! connections and skips branches whose status says they must not run again.
//! [`DirectTransport`] executes unconditionally and is what crash recovery
//! uses once the original transaction is gone.

mod direct;
mod sharding;

pub use direct::DirectTransport;
pub use sharding::{ShardingTransport, TransportMode};

use crate::core::{Params, Result, SagaError};
use crate::definition::SagaRequest;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Forward,
    Compensation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Forward => write!(f, "forward"),
            Phase::Compensation => write!(f, "compensation"),
        }
    }
}

/// One statement the engine wants executed.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub request_id: String,
    pub data_source: String,
    pub sql: String,
    pub params: Vec<Params>,
    pub phase: Phase,
}

impl TransportRequest {
    pub fn forward(request: &SagaRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            data_source: request.datasource.clone(),
            sql: request.transaction.sql.clone(),
            params: request.transaction.params.clone(),
            phase: Phase::Forward,
        }
    }

    pub fn compensation(request: &SagaRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            data_source: request.datasource.clone(),
            sql: request.compensation.sql.clone(),
            params: request.compensation.params.clone(),
            phase: Phase::Compensation,
        }
    }

    /// Nothing to run, e.g. a compensation whose snapshot matched no rows.
    pub fn is_noop(&self) -> bool {
        self.sql.trim().is_empty()
    }
}

/// What a successful [`SagaTransport::execute`] did to the data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOutcome {
    /// The statement's effect is in the database, whether it ran now or
    /// during routing.
    Applied,
    /// Nothing is in the database for this request.
    Skipped,
}

impl TransportOutcome {
    pub fn is_applied(self) -> bool {
        self == TransportOutcome::Applied
    }
}

#[async_trait]
pub trait SagaTransport: Send + Sync {
    /// Run `request`. A SQL failure comes back as `TransportExecution` so the
    /// engine can retry it.
    async fn execute(&self, request: &TransportRequest) -> Result<TransportOutcome>;
}

/// Wrap a data source failure for the retry loop. Errors already raised as
/// transport or rollback signals pass through untouched.
pub(crate) fn into_transport_error(data_source: &str, err: SagaError) -> SagaError {
    match err {
        SagaError::TransportExecution { .. } | SagaError::ForcedRollback(_) => err,
        other => SagaError::transport(data_source, other.to_string()),
    }
}
