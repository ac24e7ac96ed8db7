use super::graph::SagaGraph;
use crate::core::{Result, SagaError};
use crate::definition::{RecoveryPolicy, SagaDefinition, SagaRequest};
use crate::persistence::{SagaEvent, SagaEventType, SagaPersistence};
use crate::transport::{SagaTransport, TransportOutcome, TransportRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaOutcome {
    /// Every forward request reported success.
    Completed,
    /// Backward recovery ran to the end.
    Compensated,
}

/// Result of a [`SagaExecutor::recover`] sweep, by saga id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub completed: Vec<String>,
    pub compensated: Vec<String>,
    pub failed: Vec<String>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.completed.len() + self.compensated.len() + self.failed.len()
    }
}

/// Requests of one saga that already have an outcome.
#[derive(Debug, Clone, Default)]
struct Progress {
    ended: HashSet<usize>,
    /// Ended requests whose effect is in the database; only these are
    /// compensated.
    applied: HashSet<usize>,
    compensated: HashSet<usize>,
}

impl Progress {
    fn record_ended(&mut self, idx: usize, outcome: TransportOutcome) {
        self.ended.insert(idx);
        if outcome.is_applied() {
            self.applied.insert(idx);
        }
    }
}

/// Drives saga graphs stage by stage on a shared worker pool.
///
/// `executor_size` caps how many requests run at once across every saga this
/// executor drives; zero leaves the pool unbounded.
pub struct SagaExecutor {
    executor_size: usize,
    limiter: Option<Arc<Semaphore>>,
    persistence: Arc<dyn SagaPersistence>,
}

impl SagaExecutor {
    pub fn new(executor_size: usize, persistence: Arc<dyn SagaPersistence>) -> Self {
        let limiter = (executor_size > 0).then(|| Arc::new(Semaphore::new(executor_size)));
        Self {
            executor_size,
            limiter,
            persistence,
        }
    }

    pub fn executor_size(&self) -> usize {
        self.executor_size
    }

    pub fn persistence(&self) -> &Arc<dyn SagaPersistence> {
        &self.persistence
    }

    /// Execute `definition` through `transport`.
    ///
    /// A failed forward request under backward recovery, or the rollback tag
    /// under any policy, compensates every request whose effect is in the
    /// database, latest stage first. Retry exhaustion anywhere else surfaces
    /// as `UnrecoverableSaga` and leaves the saga pending in the event log.
    pub async fn run(
        &self,
        definition: &SagaDefinition,
        transport: Arc<dyn SagaTransport>,
    ) -> Result<SagaOutcome> {
        self.run_after_routing(definition, &HashSet::new(), transport)
            .await
    }

    /// Like [`run`](Self::run) for a saga whose `applied` requests already
    /// succeeded while the transaction was routed. They are logged as ended
    /// right after the start event, so a later recovery neither replays nor
    /// skips their compensation.
    pub async fn run_after_routing(
        &self,
        definition: &SagaDefinition,
        applied: &HashSet<String>,
        transport: Arc<dyn SagaTransport>,
    ) -> Result<SagaOutcome> {
        let graph = Arc::new(SagaGraph::build(definition)?);
        let saga_id = Uuid::new_v4().to_string();
        self.persistence
            .offer(SagaEvent::new(
                &saga_id,
                SagaEventType::SagaStartedEvent,
                definition.to_json()?,
            ))
            .await?;

        let mut routed = applied
            .iter()
            .map(|request_id| {
                graph.index_of(request_id).ok_or_else(|| {
                    SagaError::InvalidDefinition(format!("unknown routed request {}", request_id))
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        routed.sort_unstable();

        let mut progress = Progress::default();
        for idx in routed {
            self.persistence
                .offer(SagaEvent::ended(&saga_id, &graph.node(idx).request.id, true))
                .await?;
            progress.record_ended(idx, TransportOutcome::Applied);
        }

        let span = info_span!(
            "saga.run",
            saga_id = %saga_id,
            policy = %definition.policy,
            requests = graph.len()
        );
        self.drive(&saga_id, graph, transport, progress)
            .instrument(span)
            .await
    }

    /// Finish every saga the event log still has open.
    pub async fn recover(&self, transport: Arc<dyn SagaTransport>) -> Result<RecoveryReport> {
        let pending = self.persistence.find_pending_saga_events().await?;
        if !pending.is_empty() {
            log::info!("Recovering {} pending sagas", pending.len());
        }

        let mut report = RecoveryReport::default();
        for (saga_id, events) in pending {
            match self.resume(&saga_id, &events, transport.clone()).await {
                Ok(SagaOutcome::Completed) => report.completed.push(saga_id),
                Ok(SagaOutcome::Compensated) => report.compensated.push(saga_id),
                Err(err) => {
                    log::error!("Saga {} could not be recovered: {}", saga_id, err);
                    report.failed.push(saga_id);
                }
            }
        }
        Ok(report)
    }

    async fn resume(
        &self,
        saga_id: &str,
        events: &[SagaEvent],
        transport: Arc<dyn SagaTransport>,
    ) -> Result<SagaOutcome> {
        let started = events
            .iter()
            .find(|event| event.event_type == SagaEventType::SagaStartedEvent)
            .ok_or_else(|| {
                SagaError::InvalidDefinition(format!("saga {} has no start event", saga_id))
            })?;
        let definition = SagaDefinition::from_json(&started.content_json)?;
        let graph = Arc::new(SagaGraph::build(&definition)?);

        let mut progress = Progress::default();
        for event in events {
            let Some(idx) = event.request_id().and_then(|id| graph.index_of(&id)) else {
                continue;
            };
            match event.event_type {
                SagaEventType::TransactionEndedEvent => {
                    let outcome = if event.applied() {
                        TransportOutcome::Applied
                    } else {
                        TransportOutcome::Skipped
                    };
                    progress.record_ended(idx, outcome);
                }
                SagaEventType::TransactionCompensatedEvent => {
                    progress.compensated.insert(idx);
                }
                _ => {}
            }
        }

        let span = info_span!("saga.recover", saga_id = %saga_id, policy = %definition.policy);
        async move {
            match graph.policy() {
                RecoveryPolicy::Forward => self.drive(saga_id, graph, transport, progress).await,
                RecoveryPolicy::Backward => {
                    self.backward_pass(saga_id, &graph, &transport, &mut progress)
                        .await?;
                    self.end(saga_id).await?;
                    Ok(SagaOutcome::Compensated)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        saga_id: &str,
        graph: Arc<SagaGraph>,
        transport: Arc<dyn SagaTransport>,
        mut progress: Progress,
    ) -> Result<SagaOutcome> {
        let err = match self
            .forward_pass(saga_id, &graph, &transport, &mut progress)
            .await
        {
            Ok(()) => {
                self.end(saga_id).await?;
                log::info!("Saga {} completed", saga_id);
                return Ok(SagaOutcome::Completed);
            }
            Err(err) => err,
        };

        let forced = matches!(err, SagaError::ForcedRollback(_));
        if !forced && graph.policy() == RecoveryPolicy::Forward {
            return Err(SagaError::UnrecoverableSaga(format!(
                "saga {} could not finish forward: {}",
                saga_id, err
            )));
        }

        if forced {
            log::info!("Saga {}: rollback requested, compensating", saga_id);
        } else {
            log::warn!("Saga {}: {}; compensating", saga_id, err);
        }
        self.backward_pass(saga_id, &graph, &transport, &mut progress)
            .await?;
        self.end(saga_id).await?;
        log::info!("Saga {} compensated", saga_id);
        Ok(SagaOutcome::Compensated)
    }

    /// Run stages in order. A stage always finishes every request it started
    /// before the first failure is returned.
    async fn forward_pass(
        &self,
        saga_id: &str,
        graph: &SagaGraph,
        transport: &Arc<dyn SagaTransport>,
        progress: &mut Progress,
    ) -> Result<()> {
        for stage in graph.stages() {
            let pending: Vec<usize> = stage
                .iter()
                .copied()
                .filter(|idx| !progress.ended.contains(idx))
                .collect();
            if pending.is_empty() {
                continue;
            }

            let mut tasks = JoinSet::new();
            for idx in pending {
                let permit = self.acquire().await?;
                let request = graph.node(idx).request.clone();
                let transport = transport.clone();
                let persistence = self.persistence.clone();
                let saga_id = saga_id.to_string();
                tasks.spawn(
                    async move {
                        let _permit = permit;
                        let result =
                            run_forward(&saga_id, &request, transport.as_ref(), persistence.as_ref())
                                .await;
                        (idx, result)
                    }
                    .in_current_span(),
                );
            }

            let mut failure: Option<SagaError> = None;
            while let Some(joined) = tasks.join_next().await {
                let (idx, result) = joined.map_err(|err| {
                    SagaError::UnrecoverableSaga(format!("saga {} worker failed: {}", saga_id, err))
                })?;
                match result {
                    Ok(outcome) => progress.record_ended(idx, outcome),
                    Err(err) => {
                        // A forced rollback wins over ordinary failures in the same stage.
                        if failure.is_none() || matches!(err, SagaError::ForcedRollback(_)) {
                            failure = Some(err);
                        }
                    }
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Compensate every applied request in reverse stage order.
    async fn backward_pass(
        &self,
        saga_id: &str,
        graph: &SagaGraph,
        transport: &Arc<dyn SagaTransport>,
        progress: &mut Progress,
    ) -> Result<()> {
        for stage in graph.stages().iter().rev() {
            let targets: Vec<usize> = stage
                .iter()
                .copied()
                .filter(|idx| {
                    progress.applied.contains(idx)
                        && !progress.compensated.contains(idx)
                        && !graph.node(*idx).request.is_rollback_tag()
                })
                .collect();
            if targets.is_empty() {
                continue;
            }

            let mut tasks = JoinSet::new();
            for idx in targets {
                let permit = self.acquire().await?;
                let request = graph.node(idx).request.clone();
                let transport = transport.clone();
                let persistence = self.persistence.clone();
                let saga_id = saga_id.to_string();
                tasks.spawn(
                    async move {
                        let _permit = permit;
                        let result = run_compensation(
                            &saga_id,
                            &request,
                            transport.as_ref(),
                            persistence.as_ref(),
                        )
                        .await;
                        (idx, result)
                    }
                    .in_current_span(),
                );
            }

            let mut failure: Option<(usize, SagaError)> = None;
            while let Some(joined) = tasks.join_next().await {
                let (idx, result) = joined.map_err(|err| {
                    SagaError::UnrecoverableSaga(format!("saga {} worker failed: {}", saga_id, err))
                })?;
                match result {
                    Ok(_) => {
                        progress.compensated.insert(idx);
                    }
                    Err(err) if failure.is_none() => failure = Some((idx, err)),
                    Err(_) => {}
                }
            }
            if let Some((idx, err)) = failure {
                return Err(SagaError::UnrecoverableSaga(format!(
                    "saga {}: compensation of request {} failed: {}",
                    saga_id,
                    graph.node(idx).request.id,
                    err
                )));
            }
        }
        Ok(())
    }

    async fn end(&self, saga_id: &str) -> Result<()> {
        self.persistence
            .offer(SagaEvent::new(saga_id, SagaEventType::SagaEndedEvent, "{}"))
            .await
    }

    async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.limiter {
            Some(limiter) => limiter
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| SagaError::InvalidState("saga executor pool closed".to_string())),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for SagaExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaExecutor")
            .field("executor_size", &self.executor_size)
            .finish()
    }
}

async fn run_forward(
    saga_id: &str,
    request: &SagaRequest,
    transport: &dyn SagaTransport,
    persistence: &dyn SagaPersistence,
) -> Result<TransportOutcome> {
    persistence
        .offer(SagaEvent::for_request(
            saga_id,
            SagaEventType::TransactionStartedEvent,
            &request.id,
            None,
        ))
        .await?;

    let outcome = execute_with_retry(
        transport,
        &TransportRequest::forward(request),
        request.transaction.retries,
        request.retry_delay(),
    )
    .await;

    let event = match &outcome {
        Ok(outcome) => SagaEvent::ended(saga_id, &request.id, outcome.is_applied()),
        Err(err) => SagaEvent::for_request(
            saga_id,
            SagaEventType::TransactionAbortedEvent,
            &request.id,
            Some(&err.to_string()),
        ),
    };
    persistence.offer(event).await?;
    outcome
}

async fn run_compensation(
    saga_id: &str,
    request: &SagaRequest,
    transport: &dyn SagaTransport,
    persistence: &dyn SagaPersistence,
) -> Result<TransportOutcome> {
    persistence
        .offer(SagaEvent::for_request(
            saga_id,
            SagaEventType::CompensationStartedEvent,
            &request.id,
            None,
        ))
        .await?;

    let outcome = execute_with_retry(
        transport,
        &TransportRequest::compensation(request),
        request.compensation.retries,
        request.retry_delay(),
    )
    .await?;

    persistence
        .offer(SagaEvent::for_request(
            saga_id,
            SagaEventType::TransactionCompensatedEvent,
            &request.id,
            None,
        ))
        .await?;
    Ok(outcome)
}

/// One initial attempt plus `retries` more, `delay` apart. Only transport
/// failures are retried.
async fn execute_with_retry(
    transport: &dyn SagaTransport,
    request: &TransportRequest,
    retries: u32,
    delay: Duration,
) -> Result<TransportOutcome> {
    let attempts = retries.saturating_add(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match transport.execute(request).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_retryable() && attempt < attempts => {
                log::warn!(
                    "Request {} ({}) attempt {}/{} failed: {}",
                    request.request_id,
                    request.phase,
                    attempt,
                    attempts,
                    err
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::definition::SagaDefinitionBuilder;
    use crate::persistence::MemorySagaPersistence;
    use crate::transport::Phase;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call, fails forward requests listed in `failing` and
    /// reports the ones in `skipped` as untouched.
    #[derive(Default)]
    struct ScriptedTransport {
        calls: Mutex<Vec<(String, Phase)>>,
        failing: Vec<String>,
        skipped: Vec<String>,
    }

    #[async_trait]
    impl SagaTransport for ScriptedTransport {
        async fn execute(&self, request: &TransportRequest) -> Result<TransportOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push((request.request_id.clone(), request.phase));
            if request.phase == Phase::Forward && self.failing.contains(&request.request_id) {
                return Err(SagaError::transport(&request.data_source, "refused"));
            }
            if self.skipped.contains(&request.request_id) {
                return Ok(TransportOutcome::Skipped);
            }
            Ok(TransportOutcome::Applied)
        }
    }

    fn two_stage(policy: RecoveryPolicy, retries: u32) -> SagaDefinition {
        let mut builder = SagaDefinitionBuilder::new(policy)
            .transaction_max_retries(retries)
            .compensation_max_retries(retries)
            .transaction_retry_delay(Duration::from_millis(1));
        builder.add_child_request("1", "ds_0", "UPDATE t SET a = ?", vec![vec![Value::Integer(1)]], "UPDATE t SET a = 0", vec![]);
        builder.switch_parents();
        builder.add_child_request("2", "ds_1", "UPDATE t SET a = ?", vec![vec![Value::Integer(2)]], "UPDATE t SET a = 0", vec![]);
        builder.build()
    }

    #[tokio::test]
    async fn test_retries_are_one_plus_configured() {
        let persistence = Arc::new(MemorySagaPersistence::new());
        let executor = SagaExecutor::new(0, persistence.clone());
        let transport = Arc::new(ScriptedTransport {
            failing: vec!["2".to_string()],
            ..Default::default()
        });

        let err = executor
            .run(&two_stage(RecoveryPolicy::Forward, 2), transport.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::UnrecoverableSaga(_)));

        let calls = transport.calls.lock().unwrap().clone();
        let second = calls.iter().filter(|(id, _)| id == "2").count();
        assert_eq!(second, 3);
        assert!(calls.iter().all(|(_, phase)| *phase == Phase::Forward));

        // Forward failure leaves the saga pending.
        let pending = persistence.find_pending_saga_events().await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_backward_failure_compensates_ended_requests() {
        let persistence = Arc::new(MemorySagaPersistence::new());
        let executor = SagaExecutor::new(2, persistence.clone());
        let transport = Arc::new(ScriptedTransport {
            failing: vec!["2".to_string()],
            ..Default::default()
        });

        let outcome = executor
            .run(&two_stage(RecoveryPolicy::Backward, 0), transport.clone())
            .await
            .unwrap();
        assert_eq!(outcome, SagaOutcome::Compensated);

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("1".to_string(), Phase::Forward),
                ("2".to_string(), Phase::Forward),
                ("1".to_string(), Phase::Compensation),
            ]
        );
        assert!(persistence.find_pending_saga_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_successful_saga_emits_ordered_events() {
        let persistence = Arc::new(MemorySagaPersistence::new());
        let executor = SagaExecutor::new(1, persistence.clone());
        let outcome = executor
            .run(
                &two_stage(RecoveryPolicy::Forward, 0),
                Arc::new(ScriptedTransport::default()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, SagaOutcome::Completed);

        let types: Vec<SagaEventType> = persistence
            .events()
            .unwrap()
            .iter()
            .map(|event| event.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                SagaEventType::SagaStartedEvent,
                SagaEventType::TransactionStartedEvent,
                SagaEventType::TransactionEndedEvent,
                SagaEventType::TransactionStartedEvent,
                SagaEventType::TransactionEndedEvent,
                SagaEventType::SagaEndedEvent,
            ]
        );
    }

    fn three_stage(policy: RecoveryPolicy) -> SagaDefinition {
        let mut builder = SagaDefinitionBuilder::new(policy)
            .transaction_retry_delay(Duration::from_millis(1));
        for id in 1..=3 {
            builder.add_child_request(
                id.to_string(),
                "ds_0",
                "UPDATE t SET a = ?",
                vec![vec![Value::Integer(id)]],
                "UPDATE t SET a = 0",
                vec![],
            );
            builder.switch_parents();
        }
        builder.build()
    }

    #[tokio::test]
    async fn test_skipped_requests_are_not_compensated() {
        let persistence = Arc::new(MemorySagaPersistence::new());
        let executor = SagaExecutor::new(0, persistence.clone());
        let transport = Arc::new(ScriptedTransport {
            failing: vec!["3".to_string()],
            skipped: vec!["2".to_string()],
            ..Default::default()
        });

        executor
            .run(&three_stage(RecoveryPolicy::Backward), transport.clone())
            .await
            .unwrap();

        let compensated: Vec<String> = transport
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, phase)| *phase == Phase::Compensation)
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(compensated, vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_routed_requests_are_logged_and_not_resent() {
        let persistence = Arc::new(MemorySagaPersistence::new());
        let executor = SagaExecutor::new(0, persistence.clone());
        let transport = Arc::new(ScriptedTransport::default());
        let routed: HashSet<String> = ["1".to_string()].into_iter().collect();

        let outcome = executor
            .run_after_routing(&three_stage(RecoveryPolicy::Forward), &routed, transport.clone())
            .await
            .unwrap();
        assert_eq!(outcome, SagaOutcome::Completed);

        let sent: Vec<String> = transport
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(sent, vec!["2".to_string(), "3".to_string()]);

        let events = persistence.events().unwrap();
        assert_eq!(events[1].event_type, SagaEventType::TransactionEndedEvent);
        assert_eq!(events[1].request_id().as_deref(), Some("1"));
        assert!(events[1].applied());
    }

    #[tokio::test]
    async fn test_unknown_routed_request_is_rejected() {
        let executor = SagaExecutor::new(0, Arc::new(MemorySagaPersistence::new()));
        let routed: HashSet<String> = ["9".to_string()].into_iter().collect();
        let err = executor
            .run_after_routing(
                &three_stage(RecoveryPolicy::Forward),
                &routed,
                Arc::new(ScriptedTransport::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidDefinition(_)));
    }
}
