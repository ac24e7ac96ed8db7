use super::{InsertStatement, RevertSqlResult, RoutedStatement, SqlBuilder};
use crate::core::{Result, SagaError};

/// INSERT is undone by deleting the inserted keys; the keys come straight
/// from the statement, so no snapshot query is needed.
pub(super) fn revert_insert(
    statement: &RoutedStatement,
    insert: &InsertStatement,
) -> Result<Option<RevertSqlResult>> {
    if statement.primary_keys.is_empty() {
        return Err(SagaError::SnapshotCapture(format!(
            "table '{}' has no primary key, INSERT cannot be compensated",
            statement.actual_table
        )));
    }

    let key_positions = statement
        .primary_keys
        .iter()
        .map(|pk| {
            insert
                .columns
                .iter()
                .position(|column| column.eq_ignore_ascii_case(pk))
                .ok_or_else(|| {
                    SagaError::SnapshotCapture(format!(
                        "primary key column '{}' is not in the INSERT column list of '{}'",
                        pk, statement.actual_table
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut result = RevertSqlResult::new(
        SqlBuilder::new()
            .keyword("DELETE")
            .keyword("FROM")
            .identifier(&statement.actual_table)
            .keyword("WHERE")
            .equality_conditions(&statement.primary_keys)
            .build(),
    );

    for params in statement.parameter_sets() {
        for row in &insert.rows {
            let key = key_positions
                .iter()
                .map(|&position| {
                    row.get(position)
                        .ok_or_else(|| {
                            SagaError::SnapshotCapture(format!(
                                "VALUES tuple has {} entries but column list has {}",
                                row.len(),
                                insert.columns.len()
                            ))
                        })?
                        .resolve(params)
                })
                .collect::<Result<Vec<_>>>()?;
            result.params.push(key);
        }
    }

    if result.is_empty() {
        return Ok(None);
    }
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::revert::{SqlExpr, StatementKind};

    fn insert_order(columns: &[&str], rows: Vec<Vec<SqlExpr>>) -> RoutedStatement {
        RoutedStatement::new(
            "ds_0",
            "t_order_0",
            "INSERT INTO t_order_0 (...) VALUES (...)",
            StatementKind::Insert(InsertStatement {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            }),
        )
    }

    #[test]
    fn test_insert_revert_uses_placeholder_keys() {
        let stmt = insert_order(
            &["order_id", "user_id", "status"],
            vec![vec![
                SqlExpr::Placeholder(0),
                SqlExpr::Placeholder(1),
                SqlExpr::Placeholder(2),
            ]],
        )
        .batch(vec![
            vec![Value::Integer(1), Value::Integer(10), "INIT".into()],
            vec![Value::Integer(2), Value::Integer(10), "INIT".into()],
        ])
        .primary_keys(&["order_id"]);

        let StatementKind::Insert(insert) = &stmt.kind else { unreachable!() };
        let result = revert_insert(&stmt, insert).unwrap().unwrap();
        assert_eq!(result.sql, "DELETE FROM t_order_0 WHERE order_id = ?");
        assert_eq!(
            result.params,
            vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]
        );
    }

    #[test]
    fn test_insert_revert_composite_key_with_literals() {
        let stmt = insert_order(
            &["user_id", "status", "order_id"],
            vec![
                vec![
                    SqlExpr::Literal(Value::Integer(7)),
                    SqlExpr::Literal("NEW".into()),
                    SqlExpr::Literal(Value::Integer(100)),
                ],
                vec![
                    SqlExpr::Literal(Value::Integer(7)),
                    SqlExpr::Literal("NEW".into()),
                    SqlExpr::Literal(Value::Integer(101)),
                ],
            ],
        )
        .primary_keys(&["ORDER_ID", "user_id"]);

        let StatementKind::Insert(insert) = &stmt.kind else { unreachable!() };
        let result = revert_insert(&stmt, insert).unwrap().unwrap();
        assert_eq!(
            result.sql,
            "DELETE FROM t_order_0 WHERE ORDER_ID = ? AND user_id = ?"
        );
        assert_eq!(
            result.params,
            vec![
                vec![Value::Integer(100), Value::Integer(7)],
                vec![Value::Integer(101), Value::Integer(7)],
            ]
        );
    }

    #[test]
    fn test_insert_without_primary_key_fails() {
        let stmt = insert_order(&["status"], vec![vec![SqlExpr::Placeholder(0)]])
            .params(vec!["NEW".into()]);
        let StatementKind::Insert(insert) = &stmt.kind else { unreachable!() };
        let err = revert_insert(&stmt, insert).unwrap_err();
        assert!(matches!(err, SagaError::SnapshotCapture(_)));
    }

    #[test]
    fn test_insert_missing_key_column_fails() {
        let stmt = insert_order(&["status"], vec![vec![SqlExpr::Placeholder(0)]])
            .params(vec!["NEW".into()])
            .primary_keys(&["order_id"]);
        let StatementKind::Insert(insert) = &stmt.kind else { unreachable!() };
        assert!(revert_insert(&stmt, insert).is_err());
    }
}
