use super::{from_clause, query_snapshot, DeleteStatement, RevertSqlResult, RoutedStatement, SqlBuilder};
use crate::connection::SqlConnection;
use crate::core::{Result, SagaError};

/// DELETE is undone by re-inserting the full pre-image of every row the
/// WHERE clause matches.
pub(super) async fn revert_delete(
    statement: &RoutedStatement,
    delete: &DeleteStatement,
    conn: &mut dyn SqlConnection,
) -> Result<Option<RevertSqlResult>> {
    let snapshot_sql = from_clause(
        SqlBuilder::new().keyword("SELECT").keyword("*"),
        statement,
        delete.alias.as_deref(),
        delete.where_clause,
    )?
    .build();

    let parameter_sets = statement
        .parameter_sets()
        .into_iter()
        .map(<[_]>::to_vec)
        .collect();
    let rows = query_snapshot(conn, &snapshot_sql, parameter_sets).await?;

    let Some(first) = rows.first() else {
        return Ok(None);
    };
    let columns: Vec<String> = first.column_names().map(str::to_string).collect();

    let mut result = RevertSqlResult::new(
        SqlBuilder::new()
            .keyword("INSERT")
            .keyword("INTO")
            .identifier(&statement.actual_table)
            .identifier_list(&columns)
            .keyword("VALUES")
            .placeholder_list(columns.len())
            .build(),
    );

    for row in &rows {
        if row.len() != columns.len() {
            return Err(SagaError::SnapshotCapture(format!(
                "snapshot of '{}' returned rows of differing width",
                statement.actual_table
            )));
        }
        result.params.push(row.values().cloned().collect());
    }

    Ok(Some(result))
}
