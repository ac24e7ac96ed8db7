// ============================================================================
// Saga Transaction Context
// ============================================================================
//
// Bookkeeping for one logical transaction: its logic SQL groups, their
// physical branches, one cached connection per data source and the status of
// every branch.
//
// The owner mutates groups and connections while routing. Once handed to the
// saga engine at commit/rollback the transaction is shared read-only; only
// branch statuses change after that, behind their own lock.
//
// ============================================================================

use super::{BranchKey, BranchTransaction, ExecuteStatus, LogicSqlGroup};
use crate::connection::{DataSourceRegistry, SqlConnection};
use crate::core::{Result, SagaError};
use crate::definition::RecoveryPolicy;
use crate::persistence::{SagaPersistence, SagaSnapshot};
use crate::revert::{self, RoutedStatement};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Connection shared between the routing path and the saga transport.
pub type SharedConnection = Arc<Mutex<Box<dyn SqlConnection>>>;

/// Handle returned by [`SagaTransaction::start_branch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchHandle {
    key: BranchKey,
    /// Position among the registered branches sharing `key`; `None` when the
    /// statement was not registered (non-DML).
    occurrence: Option<usize>,
    snapshot_id: u64,
}

impl BranchHandle {
    pub fn key(&self) -> &BranchKey {
        &self.key
    }

    pub fn occurrence(&self) -> Option<usize> {
        self.occurrence
    }
}

pub struct SagaTransaction {
    id: String,
    policy: RecoveryPolicy,
    groups: Vec<LogicSqlGroup>,
    /// Whether the group opened last accepts branches (DML only).
    current_group_is_dml: bool,
    connections: HashMap<String, SharedConnection>,
    /// One status per registered branch with that key, in registration order.
    statuses: RwLock<HashMap<BranchKey, Vec<ExecuteStatus>>>,
    /// Compensation key -> (branch key, occurrence).
    compensations: HashMap<BranchKey, (BranchKey, usize)>,
    persistence: Arc<dyn SagaPersistence>,
    next_snapshot_id: u64,
}

impl SagaTransaction {
    pub fn new(policy: RecoveryPolicy, persistence: Arc<dyn SagaPersistence>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            policy,
            groups: Vec::new(),
            current_group_is_dml: false,
            connections: HashMap::new(),
            statuses: RwLock::new(HashMap::new()),
            compensations: HashMap::new(),
            persistence,
            next_snapshot_id: 1,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    pub fn groups(&self) -> &[LogicSqlGroup] {
        &self.groups
    }

    pub fn branches(&self) -> impl Iterator<Item = &BranchTransaction> {
        self.groups.iter().flat_map(|group| group.branches().iter())
    }

    pub fn branch_count(&self) -> usize {
        self.branches().count()
    }

    /// Start the group for the next logical statement, closing the previous
    /// one. Non-DML groups are not retained.
    pub fn begin_logic_group(&mut self, logic_sql: &str, is_dml: bool) {
        self.current_group_is_dml = is_dml;
        if is_dml {
            self.groups.push(LogicSqlGroup::new(logic_sql));
        } else {
            log::debug!("Transaction {}: skipping non-DML statement group", self.id);
        }
    }

    /// Attach `branch` to the current group. Returns false when the current
    /// group is not DML (or none was started) and the branch was dropped.
    pub fn add_branch(&mut self, branch: BranchTransaction) -> Result<bool> {
        Ok(self.register(branch)?.is_some())
    }

    /// Register `branch` as EXECUTING and return its occurrence among the
    /// branches with the same key. Running the same statement twice yields
    /// two branches with independent statuses.
    fn register(&mut self, branch: BranchTransaction) -> Result<Option<usize>> {
        if !self.current_group_is_dml {
            return Ok(None);
        }
        let Some(group) = self.groups.last_mut() else {
            return Ok(None);
        };

        let key = branch.key()?;
        let compensation_key = branch.compensation_key()?;
        let occurrence = {
            let mut statuses = self.statuses.write()?;
            let occurrences = statuses.entry(key.clone()).or_default();
            occurrences.push(ExecuteStatus::Executing);
            occurrences.len() - 1
        };
        if let Some(compensation_key) = compensation_key {
            self.compensations.insert(compensation_key, (key, occurrence));
        }
        group.push(branch);
        Ok(Some(occurrence))
    }

    /// True iff any branch of any group ended in FAILURE.
    pub fn contains_exception(&self) -> bool {
        self.statuses
            .read()
            .map(|statuses| {
                statuses
                    .values()
                    .flatten()
                    .any(|status| *status == ExecuteStatus::Failure)
            })
            .unwrap_or(true)
    }

    /// Status of the latest branch registered under `key`.
    pub fn status_of(&self, key: &BranchKey) -> Option<ExecuteStatus> {
        self.statuses.read().ok()?.get(key)?.last().copied()
    }

    pub fn status_at(&self, key: &BranchKey, occurrence: usize) -> Option<ExecuteStatus> {
        self.statuses.read().ok()?.get(key)?.get(occurrence).copied()
    }

    /// Statuses of every branch registered under `key`, oldest first.
    pub fn occurrence_statuses(&self, key: &BranchKey) -> Vec<ExecuteStatus> {
        self.statuses
            .read()
            .ok()
            .and_then(|statuses| statuses.get(key).cloned())
            .unwrap_or_default()
    }

    /// Status of every branch in [`branches`](Self::branches) order.
    pub fn branch_statuses(&self) -> Result<Vec<ExecuteStatus>> {
        let statuses = self.statuses.read()?;
        let mut seen: HashMap<BranchKey, usize> = HashMap::new();
        let mut out = Vec::with_capacity(self.branch_count());
        for branch in self.branches() {
            let key = branch.key()?;
            let occurrence = seen.entry(key.clone()).or_insert(0);
            let status = statuses
                .get(&key)
                .and_then(|occurrences| occurrences.get(*occurrence))
                .copied()
                .ok_or_else(|| SagaError::InvalidState(format!("unregistered branch {}", key)))?;
            *occurrence += 1;
            out.push(status);
        }
        Ok(out)
    }

    pub fn set_status(&self, key: &BranchKey, occurrence: usize, status: ExecuteStatus) -> Result<()> {
        let mut statuses = self.statuses.write()?;
        let current = statuses
            .get_mut(key)
            .and_then(|occurrences| occurrences.get_mut(occurrence))
            .ok_or_else(|| {
                SagaError::InvalidState(format!("unknown branch {} #{}", key, occurrence))
            })?;
        if *current == status {
            return Ok(());
        }
        *current = current.transition(status)?;
        Ok(())
    }

    /// Flip every successful branch to COMPENSATING; returns how many flipped.
    pub fn mark_successful_compensating(&self) -> Result<usize> {
        let mut statuses = self.statuses.write()?;
        let mut flipped = 0;
        for status in statuses.values_mut().flatten() {
            if *status == ExecuteStatus::Success {
                *status = ExecuteStatus::Compensating;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    /// Branch (key and occurrence) whose compensation is `compensation_key`.
    pub fn branch_for_compensation(&self, compensation_key: &BranchKey) -> Option<(&BranchKey, usize)> {
        self.compensations
            .get(compensation_key)
            .map(|(key, occurrence)| (key, *occurrence))
    }

    pub fn cached_connection(&self, data_source: &str) -> Option<SharedConnection> {
        self.connections.get(data_source).cloned()
    }

    /// The transaction's connection to `data_source`, opened on first use.
    pub async fn connection(
        &mut self,
        data_source: &str,
        registry: &DataSourceRegistry,
    ) -> Result<SharedConnection> {
        if let Some(conn) = self.connections.get(data_source) {
            return Ok(conn.clone());
        }

        let conn = registry.get(data_source)?.connect().await?;
        let shared: SharedConnection = Arc::new(Mutex::new(conn));
        self.connections
            .insert(data_source.to_string(), shared.clone());
        log::debug!("Transaction {}: opened connection to {}", self.id, data_source);
        Ok(shared)
    }

    /// Register `statement` as EXECUTING and capture its compensation over
    /// `conn` before the forward statement is allowed to run.
    ///
    /// A snapshot failure is returned as-is and nothing is registered.
    pub async fn start_branch(
        &mut self,
        statement: &RoutedStatement,
        conn: &mut dyn SqlConnection,
    ) -> Result<BranchHandle> {
        let revert = if statement.is_dml() {
            revert::revert(statement, conn).await?
        } else {
            None
        };

        let branch = BranchTransaction::new(
            &statement.data_source,
            &statement.sql,
            statement.parameters.clone(),
            &statement.actual_table,
        )
        .with_revert(revert);
        let key = branch.key()?;

        let snapshot_id = self.next_snapshot_id;
        self.next_snapshot_id += 1;
        if statement.is_dml() {
            let snapshot = SagaSnapshot::new(
                &self.id,
                snapshot_id,
                serde_json::to_string(&branch)?,
                serde_json::to_string(&branch.revert())?,
                ExecuteStatus::Executing,
            );
            self.persistence.persist_snapshot(snapshot).await?;
        }

        let occurrence = if statement.is_dml() {
            self.register(branch)?
        } else {
            None
        };
        if let Some(occurrence) = occurrence {
            log::debug!("Transaction {}: branch registered {} #{}", self.id, key, occurrence);
        }
        Ok(BranchHandle {
            key,
            occurrence,
            snapshot_id,
        })
    }

    pub async fn finish_success(&self, handle: &BranchHandle) -> Result<()> {
        self.finish(handle, ExecuteStatus::Success).await
    }

    pub async fn finish_failure(&self, handle: &BranchHandle) -> Result<()> {
        self.finish(handle, ExecuteStatus::Failure).await
    }

    async fn finish(&self, handle: &BranchHandle, status: ExecuteStatus) -> Result<()> {
        // Non-DML branches were never registered.
        let Some(occurrence) = handle.occurrence else {
            return Ok(());
        };
        self.set_status(&handle.key, occurrence, status)?;
        self.persistence
            .update_snapshot_status(&self.id, handle.snapshot_id, status)
            .await
    }

    /// Execute a routed statement as a branch of this transaction: capture the
    /// snapshot, run the forward statement with auto-commit on, record the
    /// outcome.
    pub async fn execute_branch(
        &mut self,
        statement: &RoutedStatement,
        registry: &DataSourceRegistry,
    ) -> Result<u64> {
        let conn = self.connection(&statement.data_source, registry).await?;
        let mut guard = conn.lock().await;
        guard.set_auto_commit(true).await?;

        let handle = self.start_branch(statement, &mut **guard).await?;
        match guard.execute_batch(&statement.sql, &statement.parameters).await {
            Ok(affected) => {
                self.finish_success(&handle).await?;
                Ok(affected)
            }
            Err(err) => {
                log::warn!(
                    "Transaction {}: branch failed on {}: {}",
                    self.id,
                    statement.data_source,
                    err
                );
                // The statement error is what the caller must see.
                if let Err(record_err) = self.finish_failure(&handle).await {
                    log::error!(
                        "Transaction {}: could not record failure of {}: {}",
                        self.id,
                        handle.key,
                        record_err
                    );
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for SagaTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaTransaction")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("groups", &self.groups.len())
            .field("branches", &self.branch_count())
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .finish()
    }
}
