use super::BranchTransaction;

/// All physical branches produced by one logical (pre-sharding) statement.
#[derive(Debug, Clone)]
pub struct LogicSqlGroup {
    logic_sql: String,
    branches: Vec<BranchTransaction>,
}

impl LogicSqlGroup {
    pub fn new(logic_sql: impl Into<String>) -> Self {
        Self {
            logic_sql: logic_sql.into(),
            branches: Vec::new(),
        }
    }

    pub fn logic_sql(&self) -> &str {
        &self.logic_sql
    }

    pub fn branches(&self) -> &[BranchTransaction] {
        &self.branches
    }

    pub(crate) fn push(&mut self, branch: BranchTransaction) {
        self.branches.push(branch);
    }
}
