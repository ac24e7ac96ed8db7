use super::{into_transport_error, Phase, SagaTransport, TransportOutcome, TransportRequest};
use crate::connection::DataSourceRegistry;
use crate::core::{Result, SagaError};
use crate::definition::ROLLBACK_TAG;
use crate::transaction::SharedConnection;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Executes every request it is given, one cached connection per data source.
pub struct DirectTransport {
    registry: DataSourceRegistry,
    connections: Mutex<HashMap<String, SharedConnection>>,
}

impl DirectTransport {
    pub fn new(registry: DataSourceRegistry) -> Self {
        Self {
            registry,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self, data_source: &str) -> Result<SharedConnection> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(data_source) {
            return Ok(conn.clone());
        }
        let conn = self
            .registry
            .get(data_source)?
            .connect()
            .await
            .map_err(|err| into_transport_error(data_source, err))?;
        let shared: SharedConnection = Arc::new(Mutex::new(conn));
        connections.insert(data_source.to_string(), shared.clone());
        Ok(shared)
    }
}

#[async_trait]
impl SagaTransport for DirectTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportOutcome> {
        if request.is_noop() {
            return Ok(TransportOutcome::Skipped);
        }
        if request.sql == ROLLBACK_TAG {
            return match request.phase {
                Phase::Forward => Err(SagaError::ForcedRollback(format!(
                    "request {}",
                    request.request_id
                ))),
                Phase::Compensation => Ok(TransportOutcome::Skipped),
            };
        }

        let conn = self.connection(&request.data_source).await?;
        let mut guard = conn.lock().await;
        guard
            .set_auto_commit(true)
            .await
            .map_err(|err| into_transport_error(&request.data_source, err))?;
        guard
            .execute_batch(&request.sql, &request.params)
            .await
            .map_err(|err| into_transport_error(&request.data_source, err))?;
        log::debug!(
            "Recovered {} request {} on {}",
            request.phase,
            request.request_id,
            request.data_source
        );
        Ok(TransportOutcome::Applied)
    }
}

impl std::fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectTransport")
            .field("registry", &self.registry)
            .finish()
    }
}
