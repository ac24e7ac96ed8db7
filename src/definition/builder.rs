use super::{
    RecoveryPolicy, SagaDefinition, SagaRequest, SqlOperation, ROLLBACK_TAG, SQL_REQUEST_TYPE,
};
use crate::core::Params;
use std::time::Duration;

/// Accumulates requests stage by stage.
///
/// Requests added between two `switch_parents` calls form one stage and all
/// depend on every request of the stage before.
#[derive(Debug, Clone)]
pub struct SagaDefinitionBuilder {
    policy: RecoveryPolicy,
    transaction_max_retries: u32,
    compensation_max_retries: u32,
    transaction_retry_delay: Duration,
    compensation_retry_delay: Duration,
    parents: Vec<String>,
    new_request_ids: Vec<String>,
    requests: Vec<SagaRequest>,
}

impl SagaDefinitionBuilder {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            transaction_max_retries: 5,
            compensation_max_retries: 5,
            transaction_retry_delay: Duration::from_millis(5000),
            compensation_retry_delay: Duration::from_millis(3000),
            parents: Vec::new(),
            new_request_ids: Vec::new(),
            requests: Vec::new(),
        }
    }

    pub fn transaction_max_retries(mut self, retries: u32) -> Self {
        self.transaction_max_retries = retries;
        self
    }

    pub fn compensation_max_retries(mut self, retries: u32) -> Self {
        self.compensation_max_retries = retries;
        self
    }

    pub fn transaction_retry_delay(mut self, delay: Duration) -> Self {
        self.transaction_retry_delay = delay;
        self
    }

    pub fn compensation_retry_delay(mut self, delay: Duration) -> Self {
        self.compensation_retry_delay = delay;
        self
    }

    pub fn add_child_request(
        &mut self,
        id: impl Into<String>,
        datasource: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<Params>,
        compensation_sql: impl Into<String>,
        compensation_params: Vec<Params>,
    ) {
        let id = id.into();
        self.requests.push(SagaRequest {
            id: id.clone(),
            datasource: datasource.into(),
            request_type: SQL_REQUEST_TYPE.to_string(),
            transaction: SqlOperation::new(sql, params, self.transaction_max_retries),
            compensation: SqlOperation::new(
                compensation_sql,
                compensation_params,
                self.compensation_max_retries,
            ),
            parents: self.parents.clone(),
            fail_retry_delay_milliseconds: self.transaction_retry_delay.as_millis() as u64,
        });
        self.new_request_ids.push(id);
    }

    /// Close the current stage: its requests become the parents of the next.
    pub fn switch_parents(&mut self) {
        if self.new_request_ids.is_empty() {
            return;
        }
        self.parents = std::mem::take(&mut self.new_request_ids);
    }

    /// Append the forced-rollback sink after the last stage.
    pub fn add_rollback_request(&mut self) {
        self.switch_parents();
        self.requests.push(SagaRequest {
            id: ROLLBACK_TAG.to_string(),
            datasource: ROLLBACK_TAG.to_string(),
            request_type: SQL_REQUEST_TYPE.to_string(),
            transaction: SqlOperation::new(ROLLBACK_TAG, Vec::new(), 0),
            compensation: SqlOperation::new(ROLLBACK_TAG, Vec::new(), 0),
            parents: self.parents.clone(),
            fail_retry_delay_milliseconds: self.compensation_retry_delay.as_millis() as u64,
        });
    }

    pub fn build(&self) -> SagaDefinition {
        SagaDefinition {
            policy: self.policy,
            requests: self.requests.clone(),
        }
    }

    pub fn build_json(&self) -> crate::core::Result<String> {
        self.build().to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    #[test]
    fn test_first_stage_has_no_parents() {
        let mut builder = SagaDefinitionBuilder::new(RecoveryPolicy::Forward);
        builder.add_child_request("1", "ds_0", "DELETE FROM t", vec![], "", vec![]);
        builder.add_child_request("2", "ds_1", "DELETE FROM t", vec![], "", vec![]);
        let definition = builder.build();
        assert!(definition.requests.iter().all(|r| r.parents.is_empty()));
    }

    #[test]
    fn test_switch_parents_without_new_requests_keeps_chain() {
        let mut builder = SagaDefinitionBuilder::new(RecoveryPolicy::Forward);
        builder.add_child_request("1", "ds_0", "a", vec![], "", vec![]);
        builder.switch_parents();
        builder.switch_parents();
        builder.add_child_request("2", "ds_0", "b", vec![], "", vec![]);
        assert_eq!(builder.build().requests[1].parents, vec!["1".to_string()]);
    }

    #[test]
    fn test_rollback_request_depends_on_last_stage() {
        let mut builder = SagaDefinitionBuilder::new(RecoveryPolicy::Backward);
        builder.add_child_request("1", "ds_0", "a", vec![vec![Value::Integer(1)]], "x", vec![]);
        builder.switch_parents();
        builder.add_child_request("2", "ds_0", "b", vec![], "y", vec![]);
        builder.add_child_request("3", "ds_1", "b", vec![], "y", vec![]);
        builder.add_rollback_request();

        let definition = builder.build();
        let tag = definition.requests.last().unwrap();
        assert!(tag.is_rollback_tag());
        assert_eq!(tag.id, ROLLBACK_TAG);
        assert_eq!(tag.parents, vec!["2".to_string(), "3".to_string()]);
        assert_eq!(tag.transaction.retries, 0);
        assert_eq!(tag.fail_retry_delay_milliseconds, 3000);
    }
}
