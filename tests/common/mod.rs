//! In-memory shard used by the integration tests.
//!
//! Understands the statement shapes the revert engine emits and the ones the
//! tests route: single-table INSERT / UPDATE / DELETE / SELECT with `?` or
//! literal values and `col = value [AND ...]` WHERE clauses, optionally
//! qualified by a table alias.

#![allow(dead_code)]

use async_trait::async_trait;
use shardsaga::{
    DataSource, DataSourceRegistry, ResultRow, Result, SagaConfiguration, SagaError, SqlConnection,
    Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<String>,
    primary_key: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    fn column_index(&self, name: &str) -> std::result::Result<usize, String> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| format!("unknown column '{}'", name))
    }

    fn key_of(&self, row: &[Value]) -> std::result::Result<Vec<Value>, String> {
        self.primary_key
            .iter()
            .map(|pk| self.column_index(pk).map(|idx| row[idx].clone()))
            .collect()
    }
}

#[derive(Debug)]
struct FailRule {
    fragment: String,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Shard {
    tables: Mutex<HashMap<String, Table>>,
    statements: Mutex<Vec<String>>,
    failures: Mutex<Vec<FailRule>>,
    executions: AtomicUsize,
    queries: AtomicUsize,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// One physical data source with its own tables.
#[derive(Debug)]
pub struct MemoryDataSource {
    name: String,
    shard: Arc<Shard>,
}

impl MemoryDataSource {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            shard: Arc::new(Shard::default()),
        })
    }

    pub fn create_table(&self, table: &str, columns: &[&str], primary_key: &[&str]) {
        self.shard.tables.lock().unwrap().insert(
            table.to_string(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn insert_row(&self, table: &str, row: Vec<Value>) {
        let mut tables = self.shard.tables.lock().unwrap();
        tables.get_mut(table).unwrap().rows.push(row);
    }

    /// Rows of `table` sorted by their first column.
    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        let tables = self.shard.tables.lock().unwrap();
        let mut rows = tables.get(table).unwrap().rows.clone();
        rows.sort_by_key(|row| row[0].to_string());
        rows
    }

    /// Fail the next `times` statements whose SQL contains `fragment`.
    pub fn fail_on(&self, fragment: &str, times: usize) {
        self.shard.failures.lock().unwrap().push(FailRule {
            fragment: fragment.to_string(),
            remaining: times,
        });
    }

    /// Mutating statements attempted, failed ones included.
    pub fn executions(&self) -> usize {
        self.shard.executions.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.shard.queries.load(Ordering::SeqCst)
    }

    /// Hold every mutating statement this long before applying it.
    pub fn set_latency(&self, latency: Duration) {
        *self.shard.latency.lock().unwrap() = latency;
    }

    /// Most mutating statements ever running at the same time.
    pub fn max_concurrent_statements(&self) -> usize {
        self.shard.max_in_flight.load(Ordering::SeqCst)
    }

    /// SQL of every mutating statement attempted, in order.
    pub fn statements(&self) -> Vec<String> {
        self.shard.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        Ok(Box::new(MemoryConnection {
            name: self.name.clone(),
            shard: self.shard.clone(),
            auto_commit: false,
        }))
    }
}

pub struct MemoryConnection {
    name: String,
    shard: Arc<Shard>,
    auto_commit: bool,
}

impl MemoryConnection {
    fn injected_failure(&self, sql: &str) -> Result<()> {
        let mut failures = self.shard.failures.lock().unwrap();
        for rule in failures.iter_mut() {
            if rule.remaining > 0 && sql.contains(&rule.fragment) {
                rule.remaining -= 1;
                return Err(SagaError::transport(&self.name, "injected failure"));
            }
        }
        Ok(())
    }

    fn error(&self, message: String) -> SagaError {
        SagaError::transport(&self.name, message)
    }
}

#[async_trait]
impl SqlConnection for MemoryConnection {
    async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.auto_commit = auto_commit;
        Ok(())
    }

    async fn execute_update(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.shard.executions.fetch_add(1, Ordering::SeqCst);
        self.shard.statements.lock().unwrap().push(sql.to_string());
        let now = self.shard.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shard.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *self.shard.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.shard.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.injected_failure(sql)?;

        let statement = parse(sql).map_err(|msg| self.error(msg))?;
        let mut tables = self.shard.tables.lock().unwrap();
        apply(&mut tables, statement, params).map_err(|msg| self.error(msg))
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<ResultRow>> {
        self.shard.queries.fetch_add(1, Ordering::SeqCst);
        self.injected_failure(sql)?;

        let statement = parse(sql).map_err(|msg| self.error(msg))?;
        let tables = self.shard.tables.lock().unwrap();
        select(&tables, statement, params).map_err(|msg| self.error(msg))
    }
}

pub fn registry(sources: &[Arc<MemoryDataSource>]) -> DataSourceRegistry {
    let mut registry = DataSourceRegistry::new();
    for source in sources {
        registry.register(source.clone());
    }
    registry
}

/// Defaults with retry delays short enough for tests.
pub fn fast_config() -> SagaConfiguration {
    SagaConfiguration::new()
        .transaction_retry_delay(Duration::from_millis(1))
        .compensation_retry_delay(Duration::from_millis(1))
}

pub fn int(value: i64) -> Value {
    Value::Integer(value)
}

pub fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

// ----------------------------------------------------------------------------
// Statement interpretation
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Text(String),
    Number(String),
    Comma,
    Open,
    Close,
    Eq,
    Param,
    Star,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Param);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '\'' => {
                let mut text = String::new();
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\'' {
                        if chars.get(i + 1) == Some(&'\'') {
                            text.push('\'');
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    text.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                if start == i {
                    i += 1;
                    continue;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
        }
    }
    tokens
}

#[derive(Debug, Clone)]
enum Expr {
    Param(usize),
    Literal(Value),
}

impl Expr {
    fn eval(&self, params: &[Value]) -> std::result::Result<Value, String> {
        match self {
            Expr::Param(idx) => params
                .get(*idx)
                .cloned()
                .ok_or_else(|| format!("missing parameter #{}", idx + 1)),
            Expr::Literal(value) => Ok(value.clone()),
        }
    }
}

#[derive(Debug)]
enum Statement {
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Expr>>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        conditions: Vec<(String, Expr)>,
    },
    Delete {
        table: String,
        conditions: Vec<(String, Expr)>,
    },
    Select {
        table: String,
        columns: Option<Vec<String>>,
        conditions: Vec<(String, Expr)>,
    },
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
    next_param: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> std::result::Result<(), String> {
        if self.at_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected {} at {:?}", keyword, self.peek()))
        }
    }

    fn expect(&mut self, token: Token) -> std::result::Result<(), String> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            other => Err(format!("expected {:?}, found {:?}", token, other)),
        }
    }

    fn identifier(&mut self) -> std::result::Result<String, String> {
        match self.next() {
            Some(Token::Word(word)) => Ok(word),
            other => Err(format!("expected identifier, found {:?}", other)),
        }
    }

    /// Column name with any `alias.` qualifier dropped.
    fn column(&mut self) -> std::result::Result<String, String> {
        let name = self.identifier()?;
        Ok(name.rsplit('.').next().unwrap_or(&name).to_string())
    }

    /// Optional table alias, stopping at the next keyword.
    fn alias(&mut self, stop: &[&str]) -> std::result::Result<(), String> {
        let word = match self.peek() {
            Some(Token::Word(word)) => word.clone(),
            _ => return Ok(()),
        };
        if stop.iter().any(|kw| word.eq_ignore_ascii_case(kw)) {
            return Ok(());
        }
        if word.eq_ignore_ascii_case("AS") {
            self.pos += 1;
        }
        self.identifier()?;
        Ok(())
    }

    fn expr(&mut self) -> std::result::Result<Expr, String> {
        match self.next() {
            Some(Token::Param) => {
                let idx = self.next_param;
                self.next_param += 1;
                Ok(Expr::Param(idx))
            }
            Some(Token::Text(text)) => Ok(Expr::Literal(Value::Text(text))),
            Some(Token::Number(number)) => {
                let value = if number.contains('.') {
                    Value::Float(number.parse().map_err(|_| format!("bad number {}", number))?)
                } else {
                    Value::Integer(number.parse().map_err(|_| format!("bad number {}", number))?)
                };
                Ok(Expr::Literal(value))
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("NULL") => {
                Ok(Expr::Literal(Value::Null))
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("TRUE") => {
                Ok(Expr::Literal(Value::Boolean(true)))
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("FALSE") => {
                Ok(Expr::Literal(Value::Boolean(false)))
            }
            other => Err(format!("expected value, found {:?}", other)),
        }
    }

    fn pairs(&mut self, separator: &str) -> std::result::Result<Vec<(String, Expr)>, String> {
        let mut pairs = Vec::new();
        loop {
            let column = self.column()?;
            self.expect(Token::Eq)?;
            pairs.push((column, self.expr()?));
            let more = match self.peek() {
                Some(Token::Comma) => separator == ",",
                Some(Token::Word(word)) => word.eq_ignore_ascii_case(separator),
                _ => false,
            };
            if !more {
                return Ok(pairs);
            }
            self.pos += 1;
        }
    }

    fn where_clause(&mut self) -> std::result::Result<Vec<(String, Expr)>, String> {
        if !self.at_keyword("WHERE") {
            return Ok(Vec::new());
        }
        self.pos += 1;
        self.pairs("AND")
    }
}

fn parse(sql: &str) -> std::result::Result<Statement, String> {
    let mut cursor = Cursor {
        tokens: tokenize(sql),
        pos: 0,
        next_param: 0,
    };
    let verb = cursor.identifier()?.to_ascii_uppercase();
    let statement = match verb.as_str() {
        "INSERT" => {
            cursor.keyword("INTO")?;
            let table = cursor.identifier()?;
            cursor.expect(Token::Open)?;
            let mut columns = vec![cursor.column()?];
            while cursor.peek() == Some(&Token::Comma) {
                cursor.pos += 1;
                columns.push(cursor.column()?);
            }
            cursor.expect(Token::Close)?;
            cursor.keyword("VALUES")?;
            let mut rows = Vec::new();
            loop {
                cursor.expect(Token::Open)?;
                let mut row = vec![cursor.expr()?];
                while cursor.peek() == Some(&Token::Comma) {
                    cursor.pos += 1;
                    row.push(cursor.expr()?);
                }
                cursor.expect(Token::Close)?;
                rows.push(row);
                if cursor.peek() != Some(&Token::Comma) {
                    break;
                }
                cursor.pos += 1;
            }
            Statement::Insert {
                table,
                columns,
                rows,
            }
        }
        "UPDATE" => {
            let table = cursor.identifier()?;
            cursor.alias(&["SET"])?;
            cursor.keyword("SET")?;
            let assignments = cursor.pairs(",")?;
            let conditions = cursor.where_clause()?;
            Statement::Update {
                table,
                assignments,
                conditions,
            }
        }
        "DELETE" => {
            cursor.keyword("FROM")?;
            let table = cursor.identifier()?;
            cursor.alias(&["WHERE"])?;
            let conditions = cursor.where_clause()?;
            Statement::Delete { table, conditions }
        }
        "SELECT" => {
            let columns = if cursor.peek() == Some(&Token::Star) {
                cursor.pos += 1;
                None
            } else {
                let mut columns = vec![cursor.column()?];
                while cursor.peek() == Some(&Token::Comma) {
                    cursor.pos += 1;
                    columns.push(cursor.column()?);
                }
                Some(columns)
            };
            cursor.keyword("FROM")?;
            let table = cursor.identifier()?;
            cursor.alias(&["WHERE"])?;
            let conditions = cursor.where_clause()?;
            Statement::Select {
                table,
                columns,
                conditions,
            }
        }
        other => return Err(format!("unsupported statement {}", other)),
    };

    if cursor.pos < cursor.tokens.len() {
        return Err(format!("trailing tokens in '{}'", sql));
    }
    Ok(statement)
}

fn matches(
    table: &Table,
    row: &[Value],
    conditions: &[(String, Expr)],
    params: &[Value],
) -> std::result::Result<bool, String> {
    for (column, expr) in conditions {
        if row[table.column_index(column)?] != expr.eval(params)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn apply(
    tables: &mut HashMap<String, Table>,
    statement: Statement,
    params: &[Value],
) -> std::result::Result<u64, String> {
    match statement {
        Statement::Insert {
            table,
            columns,
            rows,
        } => {
            let target = tables
                .get_mut(&table)
                .ok_or_else(|| format!("unknown table '{}'", table))?;
            let mut inserted = 0;
            for exprs in rows {
                if exprs.len() != columns.len() {
                    return Err("column count does not match values".to_string());
                }
                let mut row = vec![Value::Null; target.columns.len()];
                for (column, expr) in columns.iter().zip(&exprs) {
                    row[target.column_index(column)?] = expr.eval(params)?;
                }
                if !target.primary_key.is_empty() {
                    let key = target.key_of(&row)?;
                    for existing in &target.rows {
                        if target.key_of(existing)? == key {
                            return Err(format!("duplicate key {:?} in '{}'", key, table));
                        }
                    }
                }
                target.rows.push(row);
                inserted += 1;
            }
            Ok(inserted)
        }
        Statement::Update {
            table,
            assignments,
            conditions,
        } => {
            let target = tables
                .get_mut(&table)
                .ok_or_else(|| format!("unknown table '{}'", table))?;
            let mut resolved = Vec::with_capacity(assignments.len());
            for (column, expr) in &assignments {
                resolved.push((target.column_index(column)?, expr.eval(params)?));
            }
            let snapshot = target.clone();
            let mut updated = 0;
            for row in target.rows.iter_mut() {
                if matches(&snapshot, row, &conditions, params)? {
                    for (idx, value) in &resolved {
                        row[*idx] = value.clone();
                    }
                    updated += 1;
                }
            }
            Ok(updated)
        }
        Statement::Delete { table, conditions } => {
            let target = tables
                .get_mut(&table)
                .ok_or_else(|| format!("unknown table '{}'", table))?;
            let snapshot = target.clone();
            let before = target.rows.len();
            let mut kept = Vec::with_capacity(before);
            for row in target.rows.drain(..) {
                if !matches(&snapshot, &row, &conditions, params)? {
                    kept.push(row);
                }
            }
            target.rows = kept;
            Ok((before - target.rows.len()) as u64)
        }
        Statement::Select { .. } => Err("SELECT is not an update".to_string()),
    }
}

fn select(
    tables: &HashMap<String, Table>,
    statement: Statement,
    params: &[Value],
) -> std::result::Result<Vec<ResultRow>, String> {
    let Statement::Select {
        table,
        columns,
        conditions,
    } = statement
    else {
        return Err("only SELECT can be queried".to_string());
    };

    let source = tables
        .get(&table)
        .ok_or_else(|| format!("unknown table '{}'", table))?;
    let columns = columns.unwrap_or_else(|| source.columns.clone());
    let mut indexes = Vec::with_capacity(columns.len());
    for column in &columns {
        indexes.push(source.column_index(column)?);
    }

    let mut out = Vec::new();
    for row in &source.rows {
        if matches(source, row, &conditions, params)? {
            out.push(ResultRow::new(
                indexes
                    .iter()
                    .map(|&idx| (source.columns[idx].clone(), row[idx].clone()))
                    .collect(),
            ));
        }
    }
    Ok(out)
}
