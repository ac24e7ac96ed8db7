use super::{pending_chains, SagaEvent, SagaPersistence, SagaSnapshot};
use crate::core::Result;
use crate::transaction::ExecuteStatus;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Process-local event and snapshot log.
#[derive(Debug, Default)]
pub struct MemorySagaPersistence {
    events: Mutex<Vec<SagaEvent>>,
    snapshots: Mutex<Vec<SagaSnapshot>>,
}

impl MemorySagaPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event offered so far, in offer order.
    pub fn events(&self) -> Result<Vec<SagaEvent>> {
        Ok(self.events.lock()?.clone())
    }

    pub fn snapshot_count(&self) -> Result<usize> {
        Ok(self.snapshots.lock()?.len())
    }
}

#[async_trait]
impl SagaPersistence for MemorySagaPersistence {
    async fn offer(&self, mut event: SagaEvent) -> Result<()> {
        let mut events = self.events.lock()?;
        event.id = events.len() as u64 + 1;
        events.push(event);
        Ok(())
    }

    async fn find_pending_saga_events(&self) -> Result<BTreeMap<String, Vec<SagaEvent>>> {
        let events = self.events.lock()?;
        Ok(pending_chains(events.iter()))
    }

    async fn persist_snapshot(&self, mut snapshot: SagaSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.lock()?;
        snapshot.id = snapshots.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        snapshots.push(snapshot);
        Ok(())
    }

    async fn update_snapshot_status(
        &self,
        transaction_id: &str,
        snapshot_id: u64,
        status: ExecuteStatus,
    ) -> Result<()> {
        let mut snapshots = self.snapshots.lock()?;
        for snapshot in snapshots.iter_mut().filter(|s| {
            s.transaction_id == transaction_id && s.snapshot_id == snapshot_id
        }) {
            snapshot.execute_status = status;
        }
        Ok(())
    }

    async fn find_snapshots(&self, transaction_id: &str) -> Result<Vec<SagaSnapshot>> {
        let snapshots = self.snapshots.lock()?;
        Ok(snapshots
            .iter()
            .filter(|s| s.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn clean_snapshots(&self, transaction_id: &str) -> Result<()> {
        self.snapshots
            .lock()?
            .retain(|s| s.transaction_id != transaction_id);
        Ok(())
    }
}
