use super::{
    from_clause, query_snapshot, snapshot_value, RevertSqlResult, RoutedStatement, SqlBuilder,
    UpdateStatement,
};
use crate::connection::SqlConnection;
use crate::core::{Result, SagaError, Value};

/// UPDATE is undone by writing the assigned columns back to their snapshot
/// values, matching rows by primary key.
///
/// The snapshot only reads the assigned columns plus whichever key columns
/// are not already among them.
pub(super) async fn revert_update(
    statement: &RoutedStatement,
    update: &UpdateStatement,
    conn: &mut dyn SqlConnection,
) -> Result<Option<RevertSqlResult>> {
    if statement.primary_keys.is_empty() {
        return Err(SagaError::SnapshotCapture(format!(
            "table '{}' has no primary key, UPDATE cannot be compensated",
            statement.actual_table
        )));
    }
    if update.assignments.is_empty() {
        return Err(SagaError::SnapshotCapture(
            "UPDATE without assignments".to_string(),
        ));
    }

    let assigned: Vec<&str> = update
        .assignments
        .iter()
        .map(|assignment| assignment.column.as_str())
        .collect();
    let mut selected = assigned.clone();
    for pk in &statement.primary_keys {
        if update.assignment_for(pk).is_none() {
            selected.push(pk);
        }
    }

    let snapshot_sql = from_clause(
        SqlBuilder::new().keyword("SELECT").identifiers(&selected),
        statement,
        update.alias.as_deref(),
        update.where_clause,
    )?
    .build();

    let set_params = update.set_placeholder_count();
    let mut result = RevertSqlResult::new(
        SqlBuilder::new()
            .keyword("UPDATE")
            .identifier(&statement.actual_table)
            .keyword("SET")
            .assignments(&assigned)
            .keyword("WHERE")
            .equality_conditions(&statement.primary_keys)
            .build(),
    );

    for params in statement.parameter_sets() {
        if params.len() < set_params {
            return Err(SagaError::SnapshotCapture(format!(
                "UPDATE binds {} SET placeholder(s) but only {} parameter(s) were supplied",
                set_params,
                params.len()
            )));
        }

        let where_params = params[set_params..].to_vec();
        let rows = query_snapshot(conn, &snapshot_sql, vec![where_params]).await?;

        for row in &rows {
            let mut revert_params = Vec::with_capacity(assigned.len() + statement.primary_keys.len());

            for assignment in &update.assignments {
                let old = match row.get(&assignment.column) {
                    Some(value) => value.clone(),
                    None => match &assignment.value {
                        super::SqlExpr::Literal(value) => value.clone(),
                        super::SqlExpr::Placeholder(_) => snapshot_value(row, &assignment.column)?,
                    },
                };
                revert_params.push(old);
            }

            // A key column rewritten by the forward statement is matched by
            // its new value.
            for pk in &statement.primary_keys {
                let key: Value = match update.assignment_for(pk) {
                    Some(assignment) => assignment.value.resolve(params)?,
                    None => snapshot_value(row, pk)?,
                };
                revert_params.push(key);
            }

            result.params.push(revert_params);
        }
    }

    if result.is_empty() {
        return Ok(None);
    }
    Ok(Some(result))
}
