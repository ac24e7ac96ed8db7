//! Routed physical statement descriptor handed over by the routing layer.

use crate::core::{Params, Result, SagaError, Value};
use serde::{Deserialize, Serialize};

/// Byte range of a fragment inside the statement's SQL text, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Range covering the first occurrence of `fragment` in `sql`.
    pub fn of(sql: &str, fragment: &str) -> Option<Self> {
        sql.find(fragment)
            .map(|start| Self::new(start, start + fragment.len()))
    }

    /// Range from the first `WHERE` keyword to the end of `sql`.
    pub fn where_clause_of(sql: &str) -> Option<Self> {
        let upper = sql.to_ascii_uppercase();
        upper
            .find(" WHERE ")
            .map(|pos| Self::new(pos + 1, sql.trim_end().len()))
    }

    pub fn extract<'a>(&self, sql: &'a str) -> Result<&'a str> {
        if self.start > self.end {
            return Err(SagaError::SnapshotCapture(format!(
                "invalid WHERE clause range {}..{}",
                self.start, self.end
            )));
        }

        sql.get(self.start..self.end).ok_or_else(|| {
            SagaError::SnapshotCapture(format!(
                "WHERE clause range {}..{} does not fit statement of {} bytes",
                self.start,
                self.end,
                sql.len()
            ))
        })
    }
}

/// A value position in the statement: either a `?` placeholder (index into
/// one parameter set) or a literal written into the SQL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlExpr {
    Placeholder(usize),
    Literal(Value),
}

impl SqlExpr {
    pub fn resolve(&self, params: &[Value]) -> Result<Value> {
        match self {
            SqlExpr::Literal(value) => Ok(value.clone()),
            SqlExpr::Placeholder(index) => params.get(*index).cloned().ok_or_else(|| {
                SagaError::SnapshotCapture(format!(
                    "placeholder #{} has no bound parameter ({} supplied)",
                    index,
                    params.len()
                ))
            }),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, SqlExpr::Placeholder(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub columns: Vec<String>,
    /// One entry per `VALUES (...)` tuple.
    pub rows: Vec<Vec<SqlExpr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub value: SqlExpr,
}

impl Assignment {
    pub fn new(column: impl Into<String>, value: SqlExpr) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub alias: Option<String>,
    pub assignments: Vec<Assignment>,
    pub where_clause: Option<TextRange>,
}

impl UpdateStatement {
    /// Parameters bound to SET placeholders precede the WHERE parameters.
    pub fn set_placeholder_count(&self) -> usize {
        self.assignments
            .iter()
            .filter(|assignment| assignment.value.is_placeholder())
            .count()
    }

    pub fn assignment_for(&self, column: &str) -> Option<&Assignment> {
        self.assignments
            .iter()
            .find(|assignment| assignment.column.eq_ignore_ascii_case(column))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub alias: Option<String>,
    pub where_clause: Option<TextRange>,
}

/// Statement kind plus the metadata each kind needs for compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatementKind {
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Select,
    Other(String),
}

impl StatementKind {
    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert(_) | StatementKind::Update(_) | StatementKind::Delete(_)
        )
    }

    pub fn name(&self) -> &str {
        match self {
            StatementKind::Insert(_) => "INSERT",
            StatementKind::Update(_) => "UPDATE",
            StatementKind::Delete(_) => "DELETE",
            StatementKind::Select => "SELECT",
            StatementKind::Other(name) => name,
        }
    }
}

/// One physical statement routed to one physical data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedStatement {
    pub data_source: String,
    pub actual_table: String,
    pub sql: String,
    /// Parameter sets; more than one for batched execution.
    pub parameters: Vec<Params>,
    pub kind: StatementKind,
    pub primary_keys: Vec<String>,
}

impl RoutedStatement {
    pub fn new(
        data_source: impl Into<String>,
        actual_table: impl Into<String>,
        sql: impl Into<String>,
        kind: StatementKind,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            actual_table: actual_table.into(),
            sql: sql.into(),
            parameters: Vec::new(),
            kind,
            primary_keys: Vec::new(),
        }
    }

    /// Bind a single parameter set.
    pub fn params(mut self, params: Params) -> Self {
        self.parameters = vec![params];
        self
    }

    pub fn batch(mut self, parameters: Vec<Params>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn primary_keys<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        self.primary_keys = columns.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    pub fn is_dml(&self) -> bool {
        self.kind.is_dml()
    }

    /// Parameter sets to iterate; an unparameterized statement still counts
    /// as one execution.
    pub fn parameter_sets(&self) -> Vec<&[Value]> {
        if self.parameters.is_empty() {
            let unbound: &[Value] = &[];
            vec![unbound]
        } else {
            self.parameters.iter().map(Vec::as_slice).collect()
        }
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_keys
            .iter()
            .any(|pk| pk.eq_ignore_ascii_case(column))
    }
}
