//! Saga event and branch snapshot log.
//!
//! Events let a restarted process find sagas that never reached
//! `SagaEndedEvent` and finish them. Snapshots keep the per-branch pre-image
//! and status while its transaction is open.

pub mod event;
mod file;
mod memory;

pub use event::{SagaEvent, SagaEventType, SagaSnapshot};
pub use file::FileSagaPersistence;
pub use memory::MemorySagaPersistence;

use crate::config::PersistenceConfig;
use crate::core::{Result, SagaError};
use crate::transaction::ExecuteStatus;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait SagaPersistence: Send + Sync {
    /// Durably append one saga event.
    async fn offer(&self, event: SagaEvent) -> Result<()>;

    /// Event chains, keyed by saga id, of every saga without a terminal event.
    async fn find_pending_saga_events(&self) -> Result<BTreeMap<String, Vec<SagaEvent>>>;

    async fn persist_snapshot(&self, snapshot: SagaSnapshot) -> Result<()>;

    async fn update_snapshot_status(
        &self,
        transaction_id: &str,
        snapshot_id: u64,
        status: ExecuteStatus,
    ) -> Result<()>;

    async fn find_snapshots(&self, transaction_id: &str) -> Result<Vec<SagaSnapshot>>;

    /// Drop every snapshot of a finished transaction.
    async fn clean_snapshots(&self, transaction_id: &str) -> Result<()>;
}

/// Persistence for deployments that do not need crash recovery.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySagaPersistence;

#[async_trait]
impl SagaPersistence for EmptySagaPersistence {
    async fn offer(&self, _event: SagaEvent) -> Result<()> {
        Ok(())
    }

    async fn find_pending_saga_events(&self) -> Result<BTreeMap<String, Vec<SagaEvent>>> {
        Ok(BTreeMap::new())
    }

    async fn persist_snapshot(&self, _snapshot: SagaSnapshot) -> Result<()> {
        Ok(())
    }

    async fn update_snapshot_status(
        &self,
        _transaction_id: &str,
        _snapshot_id: u64,
        _status: ExecuteStatus,
    ) -> Result<()> {
        Ok(())
    }

    async fn find_snapshots(&self, _transaction_id: &str) -> Result<Vec<SagaSnapshot>> {
        Ok(Vec::new())
    }

    async fn clean_snapshots(&self, _transaction_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Group events by saga and keep only the chains with no terminal event.
pub(crate) fn pending_chains<'a, I>(events: I) -> BTreeMap<String, Vec<SagaEvent>>
where
    I: IntoIterator<Item = &'a SagaEvent>,
{
    let mut chains: BTreeMap<String, Vec<SagaEvent>> = BTreeMap::new();
    for event in events {
        chains
            .entry(event.saga_id.clone())
            .or_default()
            .push(event.clone());
    }
    chains.retain(|_, chain| !chain.iter().any(|event| event.event_type.is_terminal()));
    for chain in chains.values_mut() {
        chain.sort_by_key(|event| event.id);
    }
    chains
}

/// Pick the store `config` asks for.
pub async fn open_persistence(config: &PersistenceConfig) -> Result<Arc<dyn SagaPersistence>> {
    config.validate()?;
    if !config.enabled {
        return Ok(Arc::new(EmptySagaPersistence));
    }

    let dir = config
        .directory()
        .ok_or_else(|| SagaError::Config("saga persistence location missing".to_string()))?;
    log::info!("Saga persistence enabled at {}", dir.display());
    Ok(Arc::new(FileSagaPersistence::open(dir).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_chains_drop_ended_sagas() {
        let mut events = vec![
            SagaEvent::new("a", SagaEventType::SagaStartedEvent, "{}"),
            SagaEvent::new("b", SagaEventType::SagaStartedEvent, "{}"),
            SagaEvent::new("a", SagaEventType::SagaEndedEvent, "{}"),
            SagaEvent::new("b", SagaEventType::TransactionStartedEvent, "{}"),
        ];
        for (i, event) in events.iter_mut().enumerate() {
            event.id = i as u64 + 1;
        }

        let pending = pending_chains(&events);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending["b"].len(), 2);
        assert_eq!(pending["b"][0].event_type, SagaEventType::SagaStartedEvent);
    }

    #[tokio::test]
    async fn test_disabled_config_opens_empty_store() {
        let store = open_persistence(&PersistenceConfig::default()).await.unwrap();
        store
            .offer(SagaEvent::new("x", SagaEventType::SagaStartedEvent, "{}"))
            .await
            .unwrap();
        assert!(store.find_pending_saga_events().await.unwrap().is_empty());
    }
}
