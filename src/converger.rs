//! The converger service: the process-wide coordinator that owns the
//! gather-plan-execute loop for every group, serialized per group via a
//! distributed lock and coalesced so that concurrent triggers for the same
//! group share one in-flight cycle rather than piling up. Grounded on the
//! original's `Converger(Service)` class (spec.md §4.5, §9 "Global mutable
//! singleton → inject the converger as a dependency").

use crate::cloud_gateway::CloudGateway;
use crate::controller::ConvergenceTrigger;
use crate::convergence::execute_convergence;
use crate::error::ConvergenceError;
use crate::events::EventEmitter;
use crate::executor::StepExecutor;
use crate::gatherer::Gatherer;
use crate::lock::LockProvider;
use crate::model::{DesiredGroupState, GroupId, GroupState, ObservedFleet, PendingJob, ServerLifecycleState, TenantId};
use crate::store::GroupStore;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct ConvergerConfig {
    pub lock_acquire_timeout: Duration,
    pub cycle_timeout: Duration,
    pub poll_interval_range: (Duration, Duration),
}

pub struct ConvergerService<G, E, L, S>
where
    G: CloudGateway + 'static,
    E: EventEmitter + 'static,
    L: LockProvider + 'static,
    S: GroupStore + 'static,
{
    gatherer: Arc<Gatherer<G>>,
    executor: Arc<StepExecutor<G, E>>,
    events: Arc<E>,
    lock: Arc<L>,
    store: Arc<S>,
    config: ConvergerConfig,
    /// Groups with an in-flight run, used to coalesce concurrent triggers
    /// into the one already in progress. Cleared when a run finishes.
    in_flight: Arc<Mutex<HashSet<GroupId>>>,
}

impl<G, E, L, S> ConvergerService<G, E, L, S>
where
    G: CloudGateway + 'static,
    E: EventEmitter + 'static,
    L: LockProvider + 'static,
    S: GroupStore + 'static,
{
    pub fn new(
        gatherer: Arc<Gatherer<G>>,
        executor: Arc<StepExecutor<G, E>>,
        events: Arc<E>,
        lock: Arc<L>,
        store: Arc<S>,
        config: ConvergerConfig,
    ) -> Self {
        ConvergerService { gatherer, executor, events, lock, store, config, in_flight: Arc::new(Mutex::new(HashSet::new())) }
    }

    /// True while a run for `group_id` is in flight. Exposed mainly for
    /// tests that need to observe coalescing.
    pub fn is_running(&self, group_id: &GroupId) -> bool {
        self.in_flight.lock().unwrap().contains(group_id)
    }
}

/// Runs cycles for `group_id` until stable or `cycle_timeout` elapses,
/// holding the group's lock for the whole run. Takes its collaborators by
/// owned `Arc` so it can run inside a spawned task without borrowing the
/// `ConvergerService` that launched it.
async fn converge_until_stable<G, E, L, S>(
    tenant_id: TenantId,
    group_id: GroupId,
    gatherer: Arc<Gatherer<G>>,
    executor: Arc<StepExecutor<G, E>>,
    events: Arc<E>,
    lock: Arc<L>,
    store: Arc<S>,
    config: ConvergerConfig,
    in_flight: Arc<Mutex<HashSet<GroupId>>>,
) where
    G: CloudGateway + 'static,
    E: EventEmitter + 'static,
    L: LockProvider + 'static,
    S: GroupStore + 'static,
{
    let path = format!("/convergence/{group_id}");
    let guard = lock.acquire(&path, config.lock_acquire_timeout).await;
    let _guard = match guard {
        Ok(guard) => guard,
        Err(e) => {
            warn!(group_id = %group_id, error = %e, "could not acquire convergence lock, skipping this trigger");
            in_flight.lock().unwrap().remove(&group_id);
            return;
        }
    };

    let deadline = Instant::now() + config.cycle_timeout;
    loop {
        if Instant::now() >= deadline {
            error!(group_id = %group_id, "convergence cycle exceeded its deadline, giving up for this trigger");
            break;
        }

        let cycle_result = run_one_cycle(&tenant_id, &group_id, &gatherer, &executor, &events, &store).await;
        match cycle_result {
            Ok(false) => break,
            Ok(true) => {
                tokio::time::sleep(jittered(config.poll_interval_range)).await;
            }
            Err(e) => {
                error!(group_id = %group_id, error = %e, "convergence cycle failed");
                break;
            }
        }
    }

    in_flight.lock().unwrap().remove(&group_id);
}

async fn run_one_cycle<G, E, S>(
    tenant_id: &TenantId,
    group_id: &GroupId,
    gatherer: &Gatherer<G>,
    executor: &StepExecutor<G, E>,
    events: &E,
    store: &S,
) -> Result<bool, ConvergenceError>
where
    G: CloudGateway,
    E: EventEmitter,
    S: GroupStore,
{
    let group = store
        .load_group(tenant_id, group_id)
        .await
        .map_err(|_| ConvergenceError::CycleTimedOut { group_id: group_id.clone() })?;
    let mut state = store
        .load_state(tenant_id, group_id)
        .await
        .map_err(|_| ConvergenceError::CycleTimedOut { group_id: group_id.clone() })?;

    if state.paused {
        return Ok(false);
    }

    let desired = DesiredGroupState::from_group(&group, state.desired);
    let result = execute_convergence(gatherer, executor, events, group_id, &desired).await;

    // Re-sync the persisted active/pending bookkeeping against the fleet as
    // it stands after this cycle's steps ran, so the next policy evaluation
    // (and the next cycle's cooldown/delta math) sees an up-to-date count
    // rather than whatever the store held before this cycle started. Spec.md
    // §5 places this mutation squarely on "the converger task (during
    // cycle)". Best-effort: a failed re-gather here doesn't fail the cycle
    // itself, since the cycle's own outcome already reflects what happened.
    let lb_ids: Vec<_> = desired.lb_bindings.keys().cloned().collect();
    let still_erroring = if let Ok(fleet) = gatherer.gather(group_id, &lb_ids).await {
        let erroring = fleet.servers.iter().any(|s| matches!(s.state, ServerLifecycleState::Error));
        sync_state_from_fleet(&mut state, &fleet);
        erroring
    } else {
        false
    };

    state.consecutive_error_cycles = if still_erroring { state.consecutive_error_cycles + 1 } else { 0 };
    let persistent_errors = state.consecutive_error_cycles > MAX_CONSECUTIVE_ERROR_CYCLES;
    let _ = store.save_state(tenant_id, group_id, &state).await;

    if persistent_errors {
        error!(
            group_id = %group_id,
            attempts = state.consecutive_error_cycles,
            "servers stuck in ERROR across repeated recreation attempts, giving up for this trigger"
        );
        return Err(ConvergenceError::PersistentServerError { group_id: group_id.clone(), attempts: state.consecutive_error_cycles });
    }

    result
}

/// The planner recreates any server it observes in `ERROR` every cycle
/// (spec.md §4.3 step 1); this bounds how many consecutive cycles that is
/// allowed to happen before the group is treated as stuck rather than kept
/// recreating indefinitely (spec.md §3, §8 scenario E4).
const MAX_CONSECUTIVE_ERROR_CYCLES: u32 = 3;

/// Projects an `ObservedFleet` onto `GroupState`'s `active`/`pending` maps.
/// Errored/deleting/draining servers are deliberately left out of both: the
/// planner already schedules their recreation or removal, and counting them
/// here would double-count against `desired` until the next cycle catches up.
fn sync_state_from_fleet(state: &mut GroupState, fleet: &ObservedFleet) {
    state.active = fleet
        .servers
        .iter()
        .filter(|s| matches!(s.state, ServerLifecycleState::Active) && !s.is_draining())
        .map(|s| (s.id.clone(), s.clone()))
        .collect();
    state.pending = fleet
        .servers
        .iter()
        .filter(|s| matches!(s.state, ServerLifecycleState::Build))
        .map(|s| (s.id.clone(), PendingJob { requested_at: s.created_at }))
        .collect();
}

#[async_trait]
impl<G, E, L, S> ConvergenceTrigger for ConvergerService<G, E, L, S>
where
    G: CloudGateway + 'static,
    E: EventEmitter + 'static,
    L: LockProvider + 'static,
    S: GroupStore + 'static,
{
    /// Spawns a convergence run for `group_id` unless one is already
    /// in-flight, in which case this call is a no-op: the in-flight run
    /// will observe the latest stored desired state on its next cycle,
    /// which is exactly what a second trigger would have asked for anyway.
    async fn start_convergence(&self, tenant_id: &TenantId, group_id: &GroupId) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(group_id.clone()) {
                info!(group_id = %group_id, "convergence already in flight, coalescing trigger");
                return;
            }
        }

        tokio::spawn(converge_until_stable(
            tenant_id.clone(),
            group_id.clone(),
            self.gatherer.clone(),
            self.executor.clone(),
            self.events.clone(),
            self.lock.clone(),
            self.store.clone(),
            self.config.clone(),
            self.in_flight.clone(),
        ));
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
