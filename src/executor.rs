//! Executes a plan: bounded concurrency, per-step retry/backoff, partial
//! failure aggregation, exactly-once create semantics, undo-on-failure for
//! the create-attach composition, and verified delete. See spec.md §4.4.

use crate::cloud_gateway::CloudGateway;
use crate::config::{CreateServerConfig, WorkerConfig};
use crate::error::{classify_step_outcome, CloudApiError, ExecutorError, StepOutcomeClass};
use crate::events::{EventEmitter, StepEvent, StepEventKind};
use crate::model::{GroupId, LaunchTemplate, LbBindingKind, LbId, LbNodeCondition, NodeId, ServerId, Step, StepKind};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, warn};
use uuid::Uuid;

/// Caps the rate (not the concurrency) of CreateServer calls against the
/// compute API, independent of `create_semaphore`'s concurrency cap —
/// spec.md §5 draws these out as two distinct controls: a limiter bounds
/// how *often* the gateway is called, a semaphore bounds how *many* calls
/// are in flight at once.
type CreateRateLimiter = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

fn default_create_rate_limiter() -> CreateRateLimiter {
    RateLimiter::direct(Quota::per_second(nonzero!(5u32)))
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// All steps succeeded and the plan that was executed was empty.
    Stable,
    /// Some steps succeeded; more work is required on the next cycle.
    Continue,
    /// No forward progress was made this cycle.
    Failed(Vec<ExecutorError>),
}

/// An inverse step recorded while composing a create-then-attach sequence,
/// drained best-effort if a later step in the same composition fails. See
/// spec.md §9 ("Undo stack during launch composition").
enum UndoStep {
    RemoveNodesFromLb(LbId, Vec<NodeId>),
}

pub struct StepExecutor<G: CloudGateway, E: EventEmitter> {
    gateway: Arc<G>,
    events: Arc<E>,
    worker: WorkerConfig,
    create: CreateServerConfig,
    /// Process-wide cap on concurrent CreateServer calls (spec.md §5,
    /// "Rate-limiting"). Shared across every group's executor instance.
    create_semaphore: Arc<Semaphore>,
    /// Process-wide cap on the *rate* of CreateServer calls, distinct from
    /// `create_semaphore`'s concurrency cap.
    create_rate_limiter: Arc<CreateRateLimiter>,
    step_parallelism: usize,
    delete_timeout: Duration,
}

impl<G: CloudGateway, E: EventEmitter> StepExecutor<G, E> {
    /// `create_semaphore` is sized from `create.global_concurrency` so that
    /// knob is the one thing a caller needs to set to change how many
    /// CreateServer calls this executor runs at once.
    pub fn new(gateway: Arc<G>, events: Arc<E>, worker: WorkerConfig, create: CreateServerConfig, step_parallelism: usize, delete_timeout: Duration) -> Self {
        let create_semaphore = Arc::new(Semaphore::new(create.global_concurrency));
        StepExecutor {
            gateway,
            events,
            worker,
            create,
            create_semaphore,
            create_rate_limiter: Arc::new(default_create_rate_limiter()),
            step_parallelism,
            delete_timeout,
        }
    }

    pub fn with_create_rate_limiter(mut self, limiter: CreateRateLimiter) -> Self {
        self.create_rate_limiter = Arc::new(limiter);
        self
    }

    /// Executes `steps` in class-ordered sequential phases (removals,
    /// metadata updates, creates, LB adds), with steps inside a phase run
    /// concurrently up to `step_parallelism`.
    #[tracing::instrument(skip(self, steps), fields(group_id = %group_id))]
    pub async fn execute(&self, group_id: &GroupId, steps: Vec<Step>) -> CycleOutcome {
        let was_empty = steps.is_empty();
        let mut phases: Vec<Vec<Step>> = vec![Vec::new(); 4];
        for step in steps {
            phases[phase_of(&step)].push(step);
        }

        let mut errors = Vec::new();
        let mut any_success = false;

        for phase in phases {
            if phase.is_empty() {
                continue;
            }
            let permits = Arc::new(Semaphore::new(self.step_parallelism));
            let results = futures::future::join_all(phase.into_iter().map(|step| {
                let permits = permits.clone();
                async move {
                    let _permit = permits.acquire().await.expect("semaphore not closed");
                    self.execute_one(group_id, step).await
                }
            }))
            .await;

            for result in results {
                match result {
                    Ok(()) => any_success = true,
                    Err(e) => errors.push(e),
                }
            }
        }

        if !errors.is_empty() && !any_success {
            return CycleOutcome::Failed(errors);
        }
        if !errors.is_empty() {
            return CycleOutcome::Continue;
        }
        if was_empty {
            CycleOutcome::Stable
        } else {
            CycleOutcome::Continue
        }
    }

    async fn execute_one(&self, group_id: &GroupId, step: Step) -> Result<(), ExecutorError> {
        let correlation_id = Uuid::new_v4();
        let result = match &step.kind {
            StepKind::CreateServer(launch) => self.create_server(group_id, launch, correlation_id).await.map(|_| ()),
            StepKind::DeleteServer(id) => self.delete_server_verified(id, correlation_id).await,
            StepKind::SetMetadata(id, k, v) => self.with_retry(&step, correlation_id, || self.gateway.set_metadata(id, k, v)).await,
            StepKind::RemoveMetadata(id, k) => self.with_retry(&step, correlation_id, || self.gateway.remove_metadata(id, k)).await,
            StepKind::AddNodesToLb { lb_id, nodes } | StepKind::BulkAddToLb { lb_id, nodes } => {
                self.with_retry(&step, correlation_id, || self.gateway.add_nodes(lb_id, nodes)).await.map(|_| ())
            }
            StepKind::RemoveNodesFromLb { lb_id, node_ids } => {
                self.with_retry(&step, correlation_id, || self.gateway.remove_nodes(lb_id, node_ids)).await
            }
            StepKind::ChangeNodeCondition { lb_id, node_id, condition } => {
                self.with_retry(&step, correlation_id, || self.gateway.set_node_condition(lb_id, node_id, *condition)).await
            }
            StepKind::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
        };

        match &result {
            Ok(()) => self.events.step_event(StepEvent { group_id: group_id.clone(), step: step.kind.clone(), kind: StepEventKind::Success, attempt: 1, correlation_id }),
            Err(_) => self.events.step_event(StepEvent { group_id: group_id.clone(), step: step.kind.clone(), kind: StepEventKind::Fail, attempt: 1, correlation_id }),
        }
        result
    }

    /// Generic bounded-retry wrapper implementing the LB-operation retry
    /// discipline from spec.md §4.4: `worker.lb_max_retries` attempts,
    /// uniform jitter in `lb_retry_interval_range` between attempts.
    /// Unexpected status codes are logged but still count against budget.
    async fn with_retry<F, Fut, T>(&self, step: &Step, correlation_id: Uuid, call: F) -> Result<T, ExecutorError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, CloudApiError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let class = classify_step_outcome(&step.kind, e.status, &e.body);
                    match class {
                        // `call()` already returned Err; a "Success"
                        // classification here just means the status code
                        // itself looked like success (e.g. a gateway bug
                        // surfacing 2xx as an Err) — treat it as terminal
                        // rather than loop forever.
                        StepOutcomeClass::Success | StepOutcomeClass::Terminal => return Err(ExecutorError::CloudApi(e)),
                        StepOutcomeClass::Retryable | StepOutcomeClass::UnexpectedButRetryable => {
                            if class == StepOutcomeClass::UnexpectedButRetryable {
                                warn!(status = e.status, body = %e.body, "unexpected LB status");
                            }
                            if attempt >= self.worker.lb_max_retries {
                                return Err(ExecutorError::CloudApi(e));
                            }
                            self.events.step_event(StepEvent {
                                group_id: GroupId(String::new()),
                                step: step.kind.clone(),
                                kind: StepEventKind::Retry,
                                attempt,
                                correlation_id,
                            });
                            tokio::time::sleep(jittered(self.worker.lb_retry_interval_range)).await;
                        }
                    }
                }
            }
        }
    }

    /// CreateServer exactly-once discipline (spec.md §4.4). On failure,
    /// attempts adoption via `find_servers` before retrying: if exactly
    /// one candidate carries this group's metadata, adopt it as the
    /// create's result instead of risking a duplicate. Once a server id is
    /// in hand (freshly created or adopted), composes the attach phase
    /// (spec.md §9, "create-attach composition") and undoes any node adds
    /// from that same composition if attaching fails partway through —
    /// the create itself is never undone, since the server is left for the
    /// next cycle's planner to reconcile either way.
    async fn create_server(&self, group_id: &GroupId, launch: &LaunchTemplate, correlation_id: Uuid) -> Result<ServerId, ExecutorError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.create_rate_limiter.until_ready().await;
            let _permit = self.create_semaphore.acquire().await.expect("semaphore not closed");
            let outcome = self.gateway.create_server(launch, group_id).await;
            drop(_permit);

            match outcome {
                Ok(id) => {
                    self.attach_lb_bindings(&id, launch).await?;
                    return Ok(id);
                }
                Err(e) => {
                    if classify_step_outcome(&StepKind::CreateServer(launch.clone()), e.status, &e.body) == StepOutcomeClass::Terminal {
                        return Err(ExecutorError::CloudApi(e));
                    }
                    match self.gateway.find_servers(launch, group_id).await {
                        Ok(mut matches) if matches.len() == 1 => {
                            let id = matches.remove(0).id;
                            self.attach_lb_bindings(&id, launch).await?;
                            return Ok(id);
                        }
                        Ok(matches) if matches.len() > 1 => {
                            return Err(ExecutorError::ServerCreationRetry { group_id: group_id.clone(), count: matches.len() });
                        }
                        _ => {
                            if attempt >= self.create.max_retries {
                                return Err(ExecutorError::CloudApi(e));
                            }
                            self.events.step_event(StepEvent {
                                group_id: group_id.clone(),
                                step: StepKind::CreateServer(launch.clone()),
                                kind: StepEventKind::Retry,
                                attempt,
                                correlation_id,
                            });
                            let backoff = self.create.backoff_base * 2u32.pow(attempt.saturating_sub(1));
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }
    }

    /// Attaches a freshly created (or adopted) server to the LB bindings
    /// named in its own launch template, one node-add at a time so each
    /// success has a matching undo entry. If fetching the server's address
    /// fails, attaching is skipped entirely and left for the next cycle's
    /// LB reconciliation pass — this is best-effort, not a hard failure of
    /// the create. If an add itself fails partway through, everything
    /// already attached in this composition is undone and the error is
    /// surfaced so the step is recorded as failed for this cycle.
    async fn attach_lb_bindings(&self, server_id: &ServerId, launch: &LaunchTemplate) -> Result<(), ExecutorError> {
        let bindings: Vec<_> = launch.lb_bindings.iter().filter(|b| b.kind == LbBindingKind::CloudLoadBalancer).collect();
        if bindings.is_empty() {
            return Ok(());
        }

        let server = match self.gateway.get_server(server_id).await {
            Ok(server) => server,
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "could not fetch newly created server to attach it to its LBs, leaving for next cycle's reconciliation");
                return Ok(());
            }
        };
        let Some(address) = server.service_net_address() else {
            warn!(server_id = %server_id, "newly created server has no service-net address yet, leaving LB attach for next cycle");
            return Ok(());
        };

        let mut undo_stack: Vec<UndoStep> = Vec::new();
        for binding in bindings {
            match self.gateway.add_nodes(&binding.lb_id, &[(address.to_string(), binding.port, LbNodeCondition::Enabled)]).await {
                Ok(node_ids) => undo_stack.push(UndoStep::RemoveNodesFromLb(binding.lb_id.clone(), node_ids)),
                Err(e) => {
                    self.undo(&mut undo_stack).await;
                    return Err(ExecutorError::CloudApi(e));
                }
            }
        }
        Ok(())
    }

    /// Drains the undo stack best-effort: failures during undo are logged,
    /// never propagated, per spec.md §4.4/§9.
    async fn undo(&self, stack: &mut Vec<UndoStep>) {
        while let Some(step) = stack.pop() {
            let result = match &step {
                UndoStep::RemoveNodesFromLb(lb_id, node_ids) => self.gateway.remove_nodes(lb_id, node_ids).await,
            };
            if let Err(e) = result {
                warn!(error = %e, "undo step failed during create-attach rollback, leaving for next cycle to reconcile");
            }
        }
    }

    /// DeleteServer is not complete on a 2xx response; polls server
    /// details until a 404, with exponential backoff, giving up after
    /// `delete_timeout` and logging the leak.
    async fn delete_server_verified(&self, server_id: &ServerId, correlation_id: Uuid) -> Result<(), ExecutorError> {
        let step = Step::new(StepKind::DeleteServer(server_id.clone()));
        match self.with_retry(&step, correlation_id, || self.gateway.delete_server(server_id)).await {
            Ok(()) => {}
            Err(ExecutorError::CloudApi(e)) if e.status == 404 => return Ok(()),
            Err(e) => return Err(e),
        }

        let start = tokio::time::Instant::now();
        let mut backoff = Duration::from_secs(1);
        loop {
            if start.elapsed() >= self.delete_timeout {
                error!(server_id = %server_id, "delete not confirmed within delete_timeout, possible leaked server");
                return Err(ExecutorError::TimedOut { operation: format!("verified delete of {server_id}"), duration: self.delete_timeout });
            }
            match self.gateway.get_server(server_id).await {
                Err(e) if e.status == 404 => {
                    self.events.step_event(StepEvent {
                        group_id: GroupId(String::new()),
                        step: StepKind::DeleteServer(server_id.clone()),
                        kind: StepEventKind::Success,
                        attempt: 1,
                        correlation_id,
                    });
                    return Ok(());
                }
                _ => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }
}

fn jittered(range: (Duration, Duration)) -> Duration {
    let (min, max) = range;
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    let offset = rand::rng().random_range(0..=span);
    min + Duration::from_millis(offset)
}

fn phase_of(step: &Step) -> usize {
    match &step.kind {
        StepKind::DeleteServer(_) | StepKind::RemoveNodesFromLb { .. } => 0,
        StepKind::SetMetadata(..) | StepKind::RemoveMetadata(..) | StepKind::ChangeNodeCondition { .. } => 1,
        StepKind::CreateServer(_) => 2,
        StepKind::AddNodesToLb { .. } | StepKind::BulkAddToLb { .. } => 3,
        StepKind::Sleep(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloudApiError;
    use crate::events::fake::FakeEventEmitter;
    use crate::model::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Gateway whose responses are scripted per-field, for exercising the
    /// executor's retry/adoption/undo paths deterministically without a
    /// real transport.
    #[derive(Default)]
    struct ScriptedGateway {
        create_results: Mutex<VecDeque<Result<ServerId, CloudApiError>>>,
        find_results: Mutex<VecDeque<Result<Vec<Server>, CloudApiError>>>,
        get_server_results: Mutex<VecDeque<Result<Server, CloudApiError>>>,
        delete_result: Mutex<Option<Result<(), CloudApiError>>>,
        add_nodes_results: Mutex<VecDeque<Result<Vec<NodeId>, CloudApiError>>>,
        remove_nodes_calls: Mutex<Vec<(LbId, Vec<NodeId>)>>,
        set_metadata_fail_for: Mutex<HashSet<String>>,
        create_calls: AtomicUsize,
    }

    fn still_there(id: &str) -> Server {
        Server { id: ServerId(id.into()), state: ServerLifecycleState::Active, created_at: Utc::now(), addresses: vec!["10.0.0.9".into()], metadata: HashMap::new() }
    }

    #[async_trait]
    impl CloudGateway for ScriptedGateway {
        async fn list_servers(&self, _: &GroupId) -> Result<Vec<Server>, CloudApiError> {
            Ok(Vec::new())
        }
        async fn get_server(&self, _: &ServerId) -> Result<Server, CloudApiError> {
            self.get_server_results.lock().unwrap().pop_front().unwrap_or_else(|| Ok(still_there("fallback")))
        }
        async fn create_server(&self, _: &LaunchTemplate, _: &GroupId) -> Result<ServerId, CloudApiError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.create_results.lock().unwrap().pop_front().unwrap_or_else(|| Err(CloudApiError::new(500, "no script".into(), true)))
        }
        async fn delete_server(&self, _: &ServerId) -> Result<(), CloudApiError> {
            self.delete_result.lock().unwrap().take().unwrap_or(Ok(()))
        }
        async fn set_metadata(&self, server_id: &ServerId, _: &str, _: &str) -> Result<(), CloudApiError> {
            if self.set_metadata_fail_for.lock().unwrap().contains(&server_id.0) {
                Err(CloudApiError::new(500, "boom".into(), true))
            } else {
                Ok(())
            }
        }
        async fn remove_metadata(&self, _: &ServerId, _: &str) -> Result<(), CloudApiError> {
            Ok(())
        }
        async fn find_servers(&self, _: &LaunchTemplate, _: &GroupId) -> Result<Vec<Server>, CloudApiError> {
            self.find_results.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }
        async fn list_lb_nodes(&self, _: &LbId) -> Result<Vec<LbNode>, CloudApiError> {
            Ok(Vec::new())
        }
        async fn add_nodes(&self, lb_id: &LbId, _: &[(String, u16, LbNodeCondition)]) -> Result<Vec<NodeId>, CloudApiError> {
            self.add_nodes_results.lock().unwrap().pop_front().unwrap_or_else(|| Ok(vec![NodeId(format!("node-{lb_id}"))]))
        }
        async fn remove_nodes(&self, lb_id: &LbId, node_ids: &[NodeId]) -> Result<(), CloudApiError> {
            self.remove_nodes_calls.lock().unwrap().push((lb_id.clone(), node_ids.to_vec()));
            Ok(())
        }
        async fn set_node_condition(&self, _: &LbId, _: &NodeId, _: LbNodeCondition) -> Result<(), CloudApiError> {
            Ok(())
        }
    }

    fn executor(gateway: Arc<ScriptedGateway>) -> StepExecutor<ScriptedGateway, FakeEventEmitter> {
        executor_with_delete_timeout(gateway, Duration::from_millis(200))
    }

    fn executor_with_delete_timeout(gateway: Arc<ScriptedGateway>, delete_timeout: Duration) -> StepExecutor<ScriptedGateway, FakeEventEmitter> {
        StepExecutor::new(
            gateway,
            Arc::new(FakeEventEmitter::default()),
            WorkerConfig { lb_max_retries: 3, lb_retry_interval_range: (Duration::from_millis(1), Duration::from_millis(2)) },
            CreateServerConfig { max_retries: 3, backoff_base: Duration::from_millis(1), global_concurrency: 4 },
            4,
            delete_timeout,
        )
    }

    fn launch_no_lb() -> LaunchTemplate {
        LaunchTemplate { image: "img".into(), flavor: "512MB".into(), name_prefix: "g1".into(), payload: serde_json::json!({}), lb_bindings: vec![] }
    }

    fn launch_with_lb() -> LaunchTemplate {
        LaunchTemplate {
            image: "img".into(),
            flavor: "512MB".into(),
            name_prefix: "g1".into(),
            payload: serde_json::json!({}),
            lb_bindings: vec![
                LbBinding { lb_id: LbId("lb1".into()), port: 80, kind: LbBindingKind::CloudLoadBalancer, connection_draining: false, drain_timeout: chrono::Duration::seconds(0) },
                LbBinding { lb_id: LbId("lb2".into()), port: 80, kind: LbBindingKind::CloudLoadBalancer, connection_draining: false, drain_timeout: chrono::Duration::seconds(0) },
            ],
        }
    }

    #[tokio::test]
    async fn create_server_succeeds_first_try() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.create_results.lock().unwrap().push_back(Ok(ServerId("s1".into())));
        let exec = executor(gateway);
        let id = exec.create_server(&GroupId("g1".into()), &launch_no_lb(), Uuid::new_v4()).await.unwrap();
        assert_eq!(id.0, "s1");
    }

    #[tokio::test]
    async fn create_server_adopts_single_match_after_failure() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.create_results.lock().unwrap().push_back(Err(CloudApiError::new(500, "boom".into(), true)));
        gateway.find_results.lock().unwrap().push_back(Ok(vec![still_there("adopted")]));
        let exec = executor(gateway);
        let id = exec.create_server(&GroupId("g1".into()), &launch_no_lb(), Uuid::new_v4()).await.unwrap();
        assert_eq!(id.0, "adopted");
    }

    #[tokio::test]
    async fn create_server_ambiguous_match_is_terminal_without_retry() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.create_results.lock().unwrap().push_back(Err(CloudApiError::new(500, "boom".into(), true)));
        gateway.find_results.lock().unwrap().push_back(Ok(vec![still_there("a"), still_there("b")]));
        let exec = executor(gateway.clone());
        let result = exec.create_server(&GroupId("g1".into()), &launch_no_lb(), Uuid::new_v4()).await;
        assert!(matches!(result, Err(ExecutorError::ServerCreationRetry { count: 2, .. })));
        assert_eq!(gateway.create_calls.load(Ordering::SeqCst), 1, "an ambiguous match must not retry the create");
    }

    #[tokio::test]
    async fn create_server_retries_up_to_budget_then_fails() {
        let gateway = Arc::new(ScriptedGateway::default());
        for _ in 0..5 {
            gateway.create_results.lock().unwrap().push_back(Err(CloudApiError::new(500, "boom".into(), true)));
        }
        let exec = executor(gateway.clone());
        let result = exec.create_server(&GroupId("g1".into()), &launch_no_lb(), Uuid::new_v4()).await;
        assert!(matches!(result, Err(ExecutorError::CloudApi(_))));
        assert_eq!(gateway.create_calls.load(Ordering::SeqCst), 3, "create.max_retries=3 bounds the attempt count");
    }

    #[tokio::test]
    async fn create_then_attach_succeeds_for_every_binding() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.create_results.lock().unwrap().push_back(Ok(ServerId("s1".into())));
        gateway.get_server_results.lock().unwrap().push_back(Ok(still_there("s1")));
        let exec = executor(gateway.clone());
        let id = exec.create_server(&GroupId("g1".into()), &launch_with_lb(), Uuid::new_v4()).await.unwrap();
        assert_eq!(id.0, "s1");
        assert!(gateway.remove_nodes_calls.lock().unwrap().is_empty(), "no undo expected when every attach succeeds");
    }

    #[tokio::test]
    async fn create_then_attach_undoes_prior_adds_when_one_binding_fails() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.create_results.lock().unwrap().push_back(Ok(ServerId("s1".into())));
        gateway.get_server_results.lock().unwrap().push_back(Ok(still_there("s1")));
        gateway.add_nodes_results.lock().unwrap().push_back(Ok(vec![NodeId("n-lb1".into())]));
        gateway.add_nodes_results.lock().unwrap().push_back(Err(CloudApiError::new(422, "LB is deleted".into(), false)));
        let exec = executor(gateway.clone());
        let result = exec.create_server(&GroupId("g1".into()), &launch_with_lb(), Uuid::new_v4()).await;
        assert!(matches!(result, Err(ExecutorError::CloudApi(_))), "the server is created, but the step itself reports failure so this cycle doesn't mark it stable");
        let undone = gateway.remove_nodes_calls.lock().unwrap().clone();
        assert_eq!(undone.len(), 1, "only the successful lb1 add should be undone");
        assert_eq!(undone[0].0 .0, "lb1");
        assert_eq!(undone[0].1, vec![NodeId("n-lb1".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn verified_delete_succeeds_after_flaky_polling() {
        let gateway = Arc::new(ScriptedGateway::default());
        *gateway.delete_result.lock().unwrap() = Some(Ok(()));
        gateway.get_server_results.lock().unwrap().push_back(Ok(still_there("s1")));
        gateway.get_server_results.lock().unwrap().push_back(Ok(still_there("s1")));
        gateway.get_server_results.lock().unwrap().push_back(Err(CloudApiError::new(404, "gone".into(), false)));
        let exec = executor_with_delete_timeout(gateway, Duration::from_secs(60));
        let result = exec.delete_server_verified(&ServerId("s1".into()), Uuid::new_v4()).await;
        assert!(result.is_ok(), "delete should be confirmed once the poll observes 404");
    }

    #[tokio::test]
    async fn delete_404_on_delete_call_is_immediate_success_without_polling() {
        let gateway = Arc::new(ScriptedGateway::default());
        *gateway.delete_result.lock().unwrap() = Some(Err(CloudApiError::new(404, "already gone".into(), false)));
        let exec = executor(gateway.clone());
        let result = exec.delete_server_verified(&ServerId("s1".into()), Uuid::new_v4()).await;
        assert!(result.is_ok());
        assert!(gateway.get_server_results.lock().unwrap().is_empty(), "a 404 on the delete call itself must not poll get_server at all");
    }

    #[tokio::test(start_paused = true)]
    async fn verified_delete_gives_up_after_delete_timeout() {
        let gateway = Arc::new(ScriptedGateway::default());
        *gateway.delete_result.lock().unwrap() = Some(Ok(()));
        // get_server_results is left empty, so every poll reports the server
        // is still there (the fallback response), forcing a timeout.
        let exec = executor(gateway);
        let result = exec.delete_server_verified(&ServerId("s1".into()), Uuid::new_v4()).await;
        assert!(matches!(result, Err(ExecutorError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn partial_failure_yields_continue_outcome() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_metadata_fail_for.lock().unwrap().insert("bad".to_string());
        let exec = executor(gateway);
        let steps = vec![
            Step::new(StepKind::SetMetadata(ServerId("good".into()), "k".into(), "v".into())),
            Step::new(StepKind::SetMetadata(ServerId("bad".into()), "k".into(), "v".into())),
        ];
        let outcome = exec.execute(&GroupId("g1".into()), steps).await;
        assert!(matches!(outcome, CycleOutcome::Continue));
    }

    #[tokio::test]
    async fn all_steps_failing_yields_failed_outcome() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_metadata_fail_for.lock().unwrap().insert("bad1".to_string());
        gateway.set_metadata_fail_for.lock().unwrap().insert("bad2".to_string());
        let exec = executor(gateway);
        let steps = vec![
            Step::new(StepKind::SetMetadata(ServerId("bad1".into()), "k".into(), "v".into())),
            Step::new(StepKind::SetMetadata(ServerId("bad2".into()), "k".into(), "v".into())),
        ];
        let outcome = exec.execute(&GroupId("g1".into()), steps).await;
        assert!(matches!(outcome, CycleOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn empty_plan_is_stable() {
        let gateway = Arc::new(ScriptedGateway::default());
        let exec = executor(gateway);
        let outcome = exec.execute(&GroupId("g1".into()), Vec::new()).await;
        assert!(matches!(outcome, CycleOutcome::Stable));
    }
}

