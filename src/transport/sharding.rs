use super::{into_transport_error, Phase, SagaTransport, TransportOutcome, TransportRequest};
use crate::core::{Result, SagaError};
use crate::definition::{RecoveryPolicy, ROLLBACK_TAG};
use crate::connection::SqlConnection;
use crate::transaction::{BranchKey, ExecuteStatus, SagaTransaction, SharedConnection};
use async_trait::async_trait;
use std::sync::Arc;

/// Why the transaction is being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Commit,
    Rollback,
}

/// Replays saga requests on the connections cached by a live transaction.
///
/// Forward statements only run again for a FAILURE branch while committing
/// under forward recovery. Compensations only run for COMPENSATING branches.
/// Anything else is answered without touching the database, reporting whether
/// routing already applied the statement.
#[derive(Debug, Clone)]
pub struct ShardingTransport {
    transaction: Arc<SagaTransaction>,
    mode: TransportMode,
}

impl ShardingTransport {
    pub fn new(transaction: Arc<SagaTransaction>, mode: TransportMode) -> Self {
        Self { transaction, mode }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    fn should_replay_forward(&self) -> bool {
        self.mode == TransportMode::Commit && self.transaction.policy() == RecoveryPolicy::Forward
    }

    fn connection(&self, request: &TransportRequest) -> Result<SharedConnection> {
        self.transaction
            .cached_connection(&request.data_source)
            .ok_or_else(|| {
                SagaError::transport(
                    &request.data_source,
                    format!("transaction {} holds no connection", self.transaction.id()),
                )
            })
    }

    async fn execute_on(conn: &mut dyn SqlConnection, request: &TransportRequest) -> Result<()> {
        conn.set_auto_commit(true)
            .await
            .map_err(|err| into_transport_error(&request.data_source, err))?;
        conn.execute_batch(&request.sql, &request.params)
            .await
            .map_err(|err| into_transport_error(&request.data_source, err))?;
        Ok(())
    }

    /// Replay the first FAILURE occurrence of `key`. The occurrence is picked
    /// while holding the data source's connection, so identical requests
    /// running in one stage never replay the same branch twice.
    async fn replay(&self, key: &BranchKey, request: &TransportRequest) -> Result<TransportOutcome> {
        let conn = self.connection(request)?;
        let mut guard = conn.lock().await;
        let failed = self
            .transaction
            .occurrence_statuses(key)
            .iter()
            .position(|status| *status == ExecuteStatus::Failure);
        let Some(occurrence) = failed else {
            return Ok(TransportOutcome::Applied);
        };

        Self::execute_on(&mut **guard, request).await?;
        self.transaction
            .set_status(key, occurrence, ExecuteStatus::Success)?;
        log::debug!(
            "Forward request {} replayed on {}",
            request.request_id,
            request.data_source
        );
        Ok(TransportOutcome::Applied)
    }

    async fn forward(&self, request: &TransportRequest) -> Result<TransportOutcome> {
        if request.sql == ROLLBACK_TAG {
            let flipped = self.transaction.mark_successful_compensating()?;
            log::info!(
                "Transaction {}: rollback tag reached, {} branches to compensate",
                self.transaction.id(),
                flipped
            );
            return Err(SagaError::ForcedRollback(format!(
                "transaction {}",
                self.transaction.id()
            )));
        }

        let key = BranchKey::new(&request.data_source, &request.sql, &request.params)?;
        let statuses = self.transaction.occurrence_statuses(&key);
        let failed = statuses
            .iter()
            .position(|status| *status == ExecuteStatus::Failure);

        match failed {
            Some(_) if self.should_replay_forward() => self.replay(&key, request).await,
            Some(_) => {
                log::debug!("Skipping failed forward request {}", request.request_id);
                Ok(TransportOutcome::Skipped)
            }
            None => {
                let applied = statuses.iter().any(|status| {
                    matches!(status, ExecuteStatus::Success | ExecuteStatus::Compensating)
                });
                log::debug!("Skipping forward request {} ({:?})", request.request_id, statuses);
                Ok(if applied {
                    TransportOutcome::Applied
                } else {
                    TransportOutcome::Skipped
                })
            }
        }
    }

    async fn compensate(&self, request: &TransportRequest) -> Result<TransportOutcome> {
        if request.sql == ROLLBACK_TAG {
            return Ok(TransportOutcome::Skipped);
        }

        let key = BranchKey::new(&request.data_source, &request.sql, &request.params)?;
        let status = self
            .transaction
            .branch_for_compensation(&key)
            .and_then(|(branch, occurrence)| self.transaction.status_at(branch, occurrence));
        if status != Some(ExecuteStatus::Compensating) {
            log::debug!("Skipping compensation {} ({:?})", request.request_id, status);
            return Ok(TransportOutcome::Skipped);
        }

        let conn = self.connection(request)?;
        let mut guard = conn.lock().await;
        Self::execute_on(&mut **guard, request).await?;
        log::debug!("Compensation {} applied on {}", request.request_id, request.data_source);
        Ok(TransportOutcome::Applied)
    }
}

#[async_trait]
impl SagaTransport for ShardingTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportOutcome> {
        if request.is_noop() {
            return Ok(TransportOutcome::Skipped);
        }
        match request.phase {
            Phase::Forward => self.forward(request).await,
            Phase::Compensation => self.compensate(request).await,
        }
    }
}
