// ============================================================================
// Transaction Manager
// ============================================================================

use super::SagaTransaction;
use crate::config::SagaConfiguration;
use crate::connection::DataSourceRegistry;
use crate::core::{Result, SagaError};
use crate::definition::{RecoveryPolicy, SagaDefinition};
use crate::engine::{RecoveryReport, SagaExecutor, SagaOutcome};
use crate::persistence::{open_persistence, SagaPersistence};
use crate::revert::{RoutedStatement, StatementKind};
use crate::transport::{DirectTransport, ShardingTransport, TransportMode};
use std::sync::Arc;

/// Process-wide entry point: owns the configuration, the data sources, the
/// saga worker pool and the saga log.
pub struct SagaTransactionManager {
    config: SagaConfiguration,
    data_sources: DataSourceRegistry,
    executor: Arc<SagaExecutor>,
    persistence: Arc<dyn SagaPersistence>,
}

impl SagaTransactionManager {
    /// Build a manager whose saga log is the one `config.persistence` selects.
    pub async fn new(config: SagaConfiguration, data_sources: DataSourceRegistry) -> Result<Self> {
        config.validate()?;
        let persistence = open_persistence(&config.persistence).await?;
        Ok(Self::with_persistence(config, data_sources, persistence))
    }

    pub fn with_persistence(
        config: SagaConfiguration,
        data_sources: DataSourceRegistry,
        persistence: Arc<dyn SagaPersistence>,
    ) -> Self {
        let executor = Arc::new(SagaExecutor::new(config.executor_size, persistence.clone()));
        Self {
            config,
            data_sources,
            executor,
            persistence,
        }
    }

    pub fn config(&self) -> &SagaConfiguration {
        &self.config
    }

    pub fn data_sources(&self) -> &DataSourceRegistry {
        &self.data_sources
    }

    pub fn executor(&self) -> &Arc<SagaExecutor> {
        &self.executor
    }

    pub fn persistence(&self) -> &Arc<dyn SagaPersistence> {
        &self.persistence
    }

    pub fn begin(&self) -> SagaTransaction {
        let transaction = SagaTransaction::new(self.config.recovery_policy, self.persistence.clone());
        log::debug!("Transaction {} started", transaction.id());
        transaction
    }

    /// Finish `transaction`.
    ///
    /// Nothing is replayed unless some branch failed. Otherwise the saga runs
    /// under the configured policy; if it ends up compensating, the commit
    /// reports `RolledBack`.
    pub async fn commit(&self, transaction: SagaTransaction) -> Result<()> {
        let transaction = Arc::new(transaction);
        let outcome = if transaction.contains_exception() {
            let definition = SagaDefinition::from_transaction(
                &transaction,
                self.config.recovery_policy,
                &self.config,
            );
            self.execute(&transaction, &definition, TransportMode::Commit)
                .await
                .and_then(|outcome| match outcome {
                    SagaOutcome::Completed => Ok(()),
                    SagaOutcome::Compensated => Err(SagaError::RolledBack(format!(
                        "transaction {} was compensated",
                        transaction.id()
                    ))),
                })
        } else {
            log::debug!("Transaction {} committed without saga", transaction.id());
            Ok(())
        };

        self.release(&transaction, outcome).await
    }

    /// Undo every successful branch of `transaction` through a backward saga.
    pub async fn rollback(&self, transaction: SagaTransaction) -> Result<()> {
        let transaction = Arc::new(transaction);
        let outcome = if transaction.branch_count() > 0 {
            let definition =
                SagaDefinition::from_transaction(&transaction, RecoveryPolicy::Backward, &self.config);
            self.execute(&transaction, &definition, TransportMode::Rollback)
                .await
                .map(|outcome| {
                    log::debug!("Transaction {} rollback saga: {:?}", transaction.id(), outcome);
                })
        } else {
            log::debug!("Transaction {} rolled back with no branches", transaction.id());
            Ok(())
        };

        self.release(&transaction, outcome).await
    }

    /// Finish sagas a previous process left open.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let transport = Arc::new(DirectTransport::new(self.data_sources.clone()));
        let report = self.executor.recover(transport).await?;
        if report.total() > 0 {
            log::info!(
                "Saga recovery: {} completed, {} compensated, {} failed",
                report.completed.len(),
                report.compensated.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    pub fn session(&self) -> SagaSession<'_> {
        SagaSession {
            manager: self,
            transaction: None,
        }
    }

    async fn execute(
        &self,
        transaction: &Arc<SagaTransaction>,
        definition: &SagaDefinition,
        mode: TransportMode,
    ) -> Result<SagaOutcome> {
        log::info!(
            "Transaction {}: running {:?} saga with {} requests",
            transaction.id(),
            mode,
            definition.requests.len()
        );
        let routed = SagaDefinition::routed_requests(transaction)?;
        let transport = Arc::new(ShardingTransport::new(transaction.clone(), mode));
        self.executor
            .run_after_routing(definition, &routed, transport)
            .await
    }

    /// Drop the transaction's snapshots; the saga outcome wins over a cleanup
    /// error.
    async fn release(&self, transaction: &SagaTransaction, outcome: Result<()>) -> Result<()> {
        let cleaned = self.persistence.clean_snapshots(transaction.id()).await;
        match (outcome, cleaned) {
            (Err(err), cleaned) => {
                if let Err(clean_err) = cleaned {
                    log::warn!(
                        "Transaction {}: snapshot cleanup failed: {}",
                        transaction.id(),
                        clean_err
                    );
                }
                Err(err)
            }
            (Ok(()), cleaned) => cleaned,
        }
    }
}

impl std::fmt::Debug for SagaTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaTransactionManager")
            .field("config", &self.config)
            .field("data_sources", &self.data_sources)
            .field("executor", &self.executor)
            .finish()
    }
}

/// Request-scoped handle on at most one open transaction.
///
/// With no transaction open every statement goes straight to its data
/// source on a fresh auto-commit connection.
pub struct SagaSession<'a> {
    manager: &'a SagaTransactionManager,
    transaction: Option<SagaTransaction>,
}

impl<'a> SagaSession<'a> {
    pub fn begin(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(SagaError::InvalidState("Transaction already active".to_string()));
        }
        self.transaction = Some(self.manager.begin());
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction(&self) -> Option<&SagaTransaction> {
        self.transaction.as_ref()
    }

    /// Announce the logical statement the following routed statements belong to.
    pub fn next_logic_sql(&mut self, logic_sql: &str, kind: &StatementKind) {
        if let Some(transaction) = self.transaction.as_mut() {
            transaction.begin_logic_group(logic_sql, kind.is_dml());
        }
    }

    pub async fn execute(&mut self, statement: &RoutedStatement) -> Result<u64> {
        match self.transaction.as_mut() {
            Some(transaction) => {
                transaction
                    .execute_branch(statement, &self.manager.data_sources)
                    .await
            }
            None => {
                let mut conn = self
                    .manager
                    .data_sources
                    .get(&statement.data_source)?
                    .connect()
                    .await?;
                conn.set_auto_commit(true).await?;
                conn.execute_batch(&statement.sql, &statement.parameters).await
            }
        }
    }

    /// Commit the open transaction. A no-op without one.
    pub async fn commit(&mut self) -> Result<()> {
        match self.transaction.take() {
            Some(transaction) => self.manager.commit(transaction).await,
            None => Ok(()),
        }
    }

    /// Roll back the open transaction. A no-op without one.
    pub async fn rollback(&mut self) -> Result<()> {
        match self.transaction.take() {
            Some(transaction) => self.manager.rollback(transaction).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SagaSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaSession")
            .field("transaction", &self.transaction)
            .finish()
    }
}
