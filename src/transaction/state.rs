// ============================================================================
// Branch Transaction State
// ============================================================================
//
// Each physical statement moves through:
//
//   EXECUTING ──> SUCCESS ──────────┐
//       │            ^              ├──> COMPENSATING
//       └──────> FAILURE ───────────┘
//
// FAILURE -> SUCCESS happens when forward recovery replays the statement.
// COMPENSATING is terminal.
//
// ============================================================================

use crate::core::{Params, Result, SagaError};
use crate::revert::RevertSqlResult;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecuteStatus {
    Executing,
    Success,
    Failure,
    Compensating,
}

impl ExecuteStatus {
    pub fn can_transition_to(&self, next: ExecuteStatus) -> bool {
        use ExecuteStatus::*;

        matches!(
            (self, next),
            (Executing, Success)
                | (Executing, Failure)
                | (Failure, Success)
                | (Failure, Compensating)
                | (Success, Compensating)
        )
    }

    pub fn transition(&self, next: ExecuteStatus) -> Result<ExecuteStatus> {
        if !self.can_transition_to(next) {
            return Err(SagaError::InvalidState(format!(
                "branch cannot move from {} to {}",
                self, next
            )));
        }
        Ok(next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecuteStatus::Compensating)
    }
}

impl fmt::Display for ExecuteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteStatus::Executing => write!(f, "EXECUTING"),
            ExecuteStatus::Success => write!(f, "SUCCESS"),
            ExecuteStatus::Failure => write!(f, "FAILURE"),
            ExecuteStatus::Compensating => write!(f, "COMPENSATING"),
        }
    }
}

/// Identity of a branch: data source, SQL text and the serialized parameter
/// sets. Used to find a branch again when the saga replays it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchKey {
    pub data_source: String,
    pub sql: String,
    pub params: String,
}

impl BranchKey {
    pub fn new(data_source: &str, sql: &str, params: &[Params]) -> Result<Self> {
        Ok(Self {
            data_source: data_source.to_string(),
            sql: sql.to_string(),
            params: serde_json::to_string(params)?,
        })
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.data_source, self.sql, self.params)
    }
}

/// One physical statement against one physical data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchTransaction {
    data_source: String,
    sql: String,
    params: Vec<Params>,
    actual_table: String,
    revert: Option<RevertSqlResult>,
}

impl BranchTransaction {
    pub fn new(
        data_source: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<Params>,
        actual_table: impl Into<String>,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            sql: sql.into(),
            params,
            actual_table: actual_table.into(),
            revert: None,
        }
    }

    pub fn with_revert(mut self, revert: Option<RevertSqlResult>) -> Self {
        self.revert = revert;
        self
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Params] {
        &self.params
    }

    pub fn actual_table(&self) -> &str {
        &self.actual_table
    }

    pub fn revert(&self) -> Option<&RevertSqlResult> {
        self.revert.as_ref()
    }

    pub fn key(&self) -> Result<BranchKey> {
        BranchKey::new(&self.data_source, &self.sql, &self.params)
    }

    /// Key the compensation statement will be replayed under.
    pub fn compensation_key(&self) -> Result<Option<BranchKey>> {
        self.revert
            .as_ref()
            .map(|revert| BranchKey::new(&self.data_source, &revert.sql, &revert.params))
            .transpose()
    }
}
