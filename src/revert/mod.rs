// ============================================================================
// Snapshot & Revert Engine
// ============================================================================
//
// Derives the compensating statement for a routed DML statement from a
// pre-image read before the forward statement is allowed to run.
//
//   INSERT -> DELETE by inserted primary keys (no query)
//   UPDATE -> UPDATE back to the snapshot values of the assigned columns
//   DELETE -> INSERT of every snapshot row
//
// ============================================================================

pub mod builder;
mod delete;
mod insert;
pub mod statement;
mod update;

pub use builder::SqlBuilder;
pub use statement::{
    Assignment, DeleteStatement, InsertStatement, RoutedStatement, SqlExpr, StatementKind,
    TextRange, UpdateStatement,
};

use crate::connection::{ResultRow, SqlConnection};
use crate::core::{Params, Result, SagaError, Value};
use serde::{Deserialize, Serialize};

/// Compensating statement plus one parameter tuple per affected row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertSqlResult {
    pub sql: String,
    pub params: Vec<Params>,
}

impl RevertSqlResult {
    pub fn new(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Capture the pre-image of `statement` over `conn` and synthesize its
/// compensation.
///
/// Returns `Ok(None)` when there is nothing to undo (snapshot matched no
/// rows). Any failure is fatal for the branch: the forward statement must not
/// run when its compensation could not be derived.
pub async fn revert(
    statement: &RoutedStatement,
    conn: &mut dyn SqlConnection,
) -> Result<Option<RevertSqlResult>> {
    let result = match &statement.kind {
        StatementKind::Insert(insert) => insert::revert_insert(statement, insert)?,
        StatementKind::Update(update) => update::revert_update(statement, update, conn).await?,
        StatementKind::Delete(delete) => delete::revert_delete(statement, delete, conn).await?,
        StatementKind::Select => {
            return Err(SagaError::UnsupportedStatement(
                "SELECT has no compensation".to_string(),
            ));
        }
        StatementKind::Other(kind) => {
            return Err(SagaError::UnsupportedStatement(format!(
                "{} cannot be compensated",
                kind
            )));
        }
    };

    match &result {
        Some(revert) => log::debug!(
            "Captured revert for {} on {}.{}: {} ({} row(s))",
            statement.kind.name(),
            statement.data_source,
            statement.actual_table,
            revert.sql,
            revert.params.len()
        ),
        None => log::debug!(
            "Nothing to revert for {} on {}.{}",
            statement.kind.name(),
            statement.data_source,
            statement.actual_table
        ),
    }

    Ok(result)
}

/// Runs a snapshot SELECT once per parameter set and concatenates the rows.
async fn query_snapshot(
    conn: &mut dyn SqlConnection,
    sql: &str,
    parameter_sets: Vec<Vec<Value>>,
) -> Result<Vec<ResultRow>> {
    let mut rows = Vec::new();
    for params in parameter_sets {
        let mut batch = conn
            .query(sql, &params)
            .await
            .map_err(|err| SagaError::SnapshotCapture(format!("snapshot query failed: {}", err)))?;
        rows.append(&mut batch);
    }
    Ok(rows)
}

/// `FROM <table> [alias] [<where clause>]`
fn from_clause(
    builder: SqlBuilder,
    statement: &RoutedStatement,
    alias: Option<&str>,
    where_clause: Option<TextRange>,
) -> Result<SqlBuilder> {
    let mut builder = builder.keyword("FROM").identifier(&statement.actual_table);
    if let Some(alias) = alias.filter(|alias| !alias.eq_ignore_ascii_case(&statement.actual_table)) {
        builder = builder.identifier(alias);
    }
    if let Some(range) = where_clause {
        builder = builder.fragment(range.extract(&statement.sql)?);
    }
    Ok(builder)
}

fn snapshot_value(row: &ResultRow, column: &str) -> Result<Value> {
    row.get(column).cloned().ok_or_else(|| {
        SagaError::SnapshotCapture(format!("snapshot row is missing column '{}'", column))
    })
}
