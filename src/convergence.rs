//! One-shot convergence cycle: gather observed state, plan the delta,
//! execute it, and report whether the group is now stable. This is the
//! function the original's `execute_convergence` composed from a gatherer,
//! a planner and an effecting step; here it is a free function over trait
//! objects rather than a service method, so it stays unit-testable without
//! a lock or a store. See spec.md §4.5.

use crate::cloud_gateway::CloudGateway;
use crate::error::ConvergenceError;
use crate::events::{CycleEvent, CycleEventKind, EventEmitter};
use crate::executor::{CycleOutcome, StepExecutor};
use crate::gatherer::Gatherer;
use crate::model::{DesiredGroupState, GroupId};
use crate::planner;
use chrono::Utc;
use std::time::Instant;
use uuid::Uuid;

/// Runs exactly one gather-plan-execute cycle for `group_id` against
/// `desired`. Returns `Ok(true)` iff the caller should invoke another cycle
/// (the group is not yet stable), `Ok(false)` if the group was already
/// stable, and `Err` if the cycle failed outright (a hard gather failure,
/// or every step in the plan failing). See spec.md §4.5.
pub async fn execute_convergence<G: CloudGateway, E: EventEmitter>(
    gatherer: &Gatherer<G>,
    executor: &StepExecutor<G, E>,
    events: &E,
    group_id: &GroupId,
    desired: &DesiredGroupState,
) -> Result<bool, ConvergenceError> {
    let correlation_id = Uuid::new_v4();
    let start = Instant::now();
    events.cycle_event(CycleEvent { group_id: group_id.clone(), kind: CycleEventKind::Start, duration: None, correlation_id });

    let lb_ids: Vec<_> = desired.lb_bindings.keys().cloned().collect();
    let fleet = gatherer.gather(group_id, &lb_ids).await?;

    let now = Utc::now();
    let plan = planner::plan(desired, &fleet.servers, &fleet.lb_nodes, now);
    planner::assert_no_foreign_deletes(&plan, &fleet.servers, group_id);
    let stable_before_execution = planner::is_stable(&plan, &fleet.servers, &fleet.lb_nodes, now);

    let outcome = executor.execute(group_id, plan).await;

    events.cycle_event(CycleEvent {
        group_id: group_id.clone(),
        kind: CycleEventKind::End,
        duration: Some(start.elapsed()),
        correlation_id,
    });

    match outcome {
        CycleOutcome::Stable => Ok(!stable_before_execution),
        CycleOutcome::Continue => Ok(true),
        CycleOutcome::Failed(errors) => Err(errors.into_iter().next().map(ConvergenceError::from).unwrap_or(ConvergenceError::CycleTimedOut { group_id: group_id.clone() })),
    }
}
