// ============================================================================
// Saga Definition
// ============================================================================
//
// Serializable DAG of requests, one per branch transaction, each carrying its
// forward statement and its compensation. The JSON shape is shared with
// persisted saga logs and must stay stable:
//
//   {"policy":"ForwardRecovery","requests":[{"id":"1","datasource":"ds_0",
//    "type":"sql","transaction":{"sql":..,"params":[[..]],"retries":5},
//    "compensation":{"sql":..,"params":[[..]],"retries":5},
//    "parents":[],"failRetryDelayMilliseconds":5000}]}
//
// ============================================================================

pub mod builder;

pub use builder::SagaDefinitionBuilder;

use crate::config::SagaConfiguration;
use crate::core::{Params, Result, SagaError};
use crate::transaction::{ExecuteStatus, SagaTransaction};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Sentinel used as id, data source and SQL of the forced-rollback node.
pub const ROLLBACK_TAG: &str = "rollbackTag";

/// Request type carried by every SQL request.
pub const SQL_REQUEST_TYPE: &str = "sql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryPolicy {
    /// Keep retrying failed forward statements.
    #[serde(rename = "ForwardRecovery")]
    Forward,

    /// Compensate everything that already succeeded.
    #[serde(rename = "BackwardRecovery")]
    Backward,
}

impl fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryPolicy::Forward => write!(f, "ForwardRecovery"),
            RecoveryPolicy::Backward => write!(f, "BackwardRecovery"),
        }
    }
}

impl FromStr for RecoveryPolicy {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forwardrecovery" | "forward" => Ok(RecoveryPolicy::Forward),
            "backwardrecovery" | "backward" => Ok(RecoveryPolicy::Backward),
            _ => Err(SagaError::Config(format!("Unknown recovery policy '{}'", s))),
        }
    }
}

/// One SQL statement of a request, forward or compensating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlOperation {
    pub sql: String,
    pub params: Vec<Params>,
    pub retries: u32,
}

impl SqlOperation {
    pub fn new(sql: impl Into<String>, params: Vec<Params>, retries: u32) -> Self {
        Self {
            sql: sql.into(),
            params,
            retries,
        }
    }

    /// A branch whose snapshot matched nothing carries no compensation.
    pub fn is_noop(&self) -> bool {
        self.sql.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRequest {
    pub id: String,
    pub datasource: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub transaction: SqlOperation,
    pub compensation: SqlOperation,
    pub parents: Vec<String>,
    #[serde(rename = "failRetryDelayMilliseconds")]
    pub fail_retry_delay_milliseconds: u64,
}

impl SagaRequest {
    pub fn is_rollback_tag(&self) -> bool {
        self.transaction.sql == ROLLBACK_TAG
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.fail_retry_delay_milliseconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub policy: RecoveryPolicy,
    pub requests: Vec<SagaRequest>,
}

impl SagaDefinition {
    /// Lay out the branches of `transaction` stage by stage.
    ///
    /// Request ids are "1", "2", ... in registration order. Every request of a
    /// logic SQL group depends on every request of the previous group. Under
    /// backward recovery a rollback-tag sink is appended after the last group.
    pub fn from_transaction(
        transaction: &SagaTransaction,
        policy: RecoveryPolicy,
        config: &SagaConfiguration,
    ) -> Self {
        let mut builder = SagaDefinitionBuilder::new(policy)
            .transaction_max_retries(config.transaction_max_retries)
            .compensation_max_retries(config.compensation_max_retries)
            .transaction_retry_delay(config.transaction_retry_delay)
            .compensation_retry_delay(config.compensation_retry_delay);

        let mut next_id = 1usize;
        for group in transaction.groups() {
            if group.branches().is_empty() {
                continue;
            }
            for branch in group.branches() {
                let (compensation_sql, compensation_params) = match branch.revert() {
                    Some(revert) => (revert.sql.clone(), revert.params.clone()),
                    None => (String::new(), Vec::new()),
                };
                builder.add_child_request(
                    next_id.to_string(),
                    branch.data_source(),
                    branch.sql(),
                    branch.params().to_vec(),
                    compensation_sql,
                    compensation_params,
                );
                next_id += 1;
            }
            builder.switch_parents();
        }

        if policy == RecoveryPolicy::Backward {
            builder.add_rollback_request();
        }
        builder.build()
    }

    /// Ids, as numbered by [`from_transaction`](Self::from_transaction), of the
    /// branches whose forward statement already succeeded during routing.
    pub fn routed_requests(transaction: &SagaTransaction) -> Result<HashSet<String>> {
        Ok(transaction
            .branch_statuses()?
            .into_iter()
            .enumerate()
            .filter(|(_, status)| {
                matches!(status, ExecuteStatus::Success | ExecuteStatus::Compensating)
            })
            .map(|(idx, _)| (idx + 1).to_string())
            .collect())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| SagaError::InvalidDefinition(format!("cannot parse saga definition: {}", err)))
    }

    pub fn request(&self, id: &str) -> Option<&SagaRequest> {
        self.requests.iter().find(|request| request.id == id)
    }

    pub fn has_rollback_tag(&self) -> bool {
        self.requests.iter().any(SagaRequest::is_rollback_tag)
    }
}
