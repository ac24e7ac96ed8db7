//! Physical data source seam.
//!
//! The saga layer never owns a driver. It talks to whatever the SQL execution
//! path hands it through these two traits, one connection per data source per
//! transaction.

use crate::core::{Params, Result, SagaError, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// One row read back from a snapshot query, columns in select-list order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRow {
    columns: Vec<(String, Value)>,
}

impl ResultRow {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    /// Case-insensitive column lookup.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.columns.iter().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// An open connection to one physical data source.
#[async_trait]
pub trait SqlConnection: Send {
    async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()>;

    /// Runs a mutating statement with one parameter tuple and returns the
    /// affected row count.
    async fn execute_update(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<ResultRow>>;

    /// Runs `sql` once per parameter set, or once without parameters when the
    /// batch is empty.
    async fn execute_batch(&mut self, sql: &str, batch: &[Params]) -> Result<u64> {
        if batch.is_empty() {
            return self.execute_update(sql, &[]).await;
        }

        let mut affected = 0;
        for params in batch {
            affected += self.execute_update(sql, params).await?;
        }
        Ok(affected)
    }
}

/// Factory for connections to a named physical data source.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn SqlConnection>>;
}

/// Name → data source lookup shared by the transaction manager and the
/// recovery transport.
#[derive(Clone, Default)]
pub struct DataSourceRegistry {
    sources: HashMap<String, Arc<dyn DataSource>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn DataSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn with(mut self, source: Arc<dyn DataSource>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DataSource>> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| SagaError::Config(format!("Data source '{}' is not registered", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceRegistry")
            .field("sources", &self.names())
            .finish()
    }
}
