//! The convergence planner: a pure function from (desired, observed) to an
//! ordered list of steps. See spec.md §4.3. Total, deterministic, and
//! idempotent in effect — this module performs no I/O and holds no state
//! across calls, per the "Effect/intent separation" design note.

use crate::model::{
    DesiredGroupState, LbNode, LbNodeCondition, NodeId, Server, ServerId, ServerLifecycleState, Step, StepKind,
    GROUP_ID_METADATA_KEY,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::HashSet;

struct Classification<'a> {
    active: Vec<&'a Server>,
    pending: Vec<&'a Server>,
    errored: Vec<&'a Server>,
    draining: Vec<&'a Server>,
    // DELETING or UNKNOWN — no action, but excluded from capacity counts.
    deleting: Vec<&'a Server>,
}

fn classify(servers: &[Server]) -> Classification<'_> {
    let mut c = Classification { active: Vec::new(), pending: Vec::new(), errored: Vec::new(), draining: Vec::new(), deleting: Vec::new() };
    for server in servers {
        match server.state {
            ServerLifecycleState::Active if server.is_draining() => c.draining.push(server),
            ServerLifecycleState::Active => c.active.push(server),
            ServerLifecycleState::Build => c.pending.push(server),
            ServerLifecycleState::Error => c.errored.push(server),
            ServerLifecycleState::Deleting | ServerLifecycleState::Unknown => c.deleting.push(server),
        }
    }
    c
}

/// Pure planning function. `servers` and `lb_nodes` must already be
/// filtered to the group's ownership (the Gatherer does this); the planner
/// does not re-check `GROUP_ID_METADATA_KEY` except defensively for the
/// delete-victim invariant (spec.md §8, property 5).
pub fn plan(desired: &DesiredGroupState, servers: &[Server], lb_nodes: &[LbNode], now: DateTime<Utc>) -> Vec<Step> {
    let classification = classify(servers);

    let mut removals = Vec::new();
    let mut metadata_updates = Vec::new();
    let mut creates = Vec::new();
    let mut lb_adds = Vec::new();

    // Errored servers are always recreated.
    let mut errored_sorted: Vec<&Server> = classification.errored.clone();
    errored_sorted.sort_by(|a, b| a.id.cmp(&b.id));
    for server in &errored_sorted {
        removals.push(Step::new(StepKind::DeleteServer(server.id.clone())));
    }

    let active_count = classification.active.len() as i64;
    let pending_count = classification.pending.len() as i64;
    // Errored servers are excluded from this count by `classify` already
    // (they live in `classification.errored`, not `active`/`pending`), so
    // the replacement they need falls out of the plain gap to desired —
    // see DESIGN.md for why this crate does not also add `errored_count`
    // on top, which would double-count the replacement across two cycles
    // and break the idempotence property in spec.md §8.
    let delta = desired.desired as i64 - (active_count + pending_count);

    if delta > 0 {
        for _ in 0..delta {
            creates.push(Step::new(StepKind::CreateServer(desired.launch_template.clone())));
        }
    } else if delta < 0 {
        let victims = choose_victims(&classification, (-delta) as usize);
        let wants_draining = desired.lb_bindings.values().flatten().any(|b| b.connection_draining);
        for victim in victims {
            match victim.state {
                ServerLifecycleState::Build => removals.push(Step::new(StepKind::DeleteServer(victim.id.clone()))),
                _ if wants_draining => metadata_updates.push(Step::new(StepKind::SetMetadata(
                    victim.id.clone(),
                    crate::model::SERVER_STATE_METADATA_KEY.to_string(),
                    crate::model::DRAINING_METADATA_VALUE.to_string(),
                ))),
                _ => removals.push(Step::new(StepKind::DeleteServer(victim.id.clone()))),
            }
        }
    }

    // LB reconciliation, per lb_id in the desired binding set.
    let active_by_addr: std::collections::HashMap<&str, &Server> =
        classification.active.iter().filter_map(|s| s.service_net_address().map(|a| (a, *s))).collect();
    let draining_by_addr: std::collections::HashMap<&str, &Server> =
        classification.draining.iter().filter_map(|s| s.service_net_address().map(|a| (a, *s))).collect();

    let mut lb_ids: Vec<_> = desired.lb_bindings.keys().cloned().collect();
    lb_ids.sort();

    for lb_id in &lb_ids {
        let bindings = &desired.lb_bindings[lb_id];
        let observed: Vec<&LbNode> = lb_nodes.iter().filter(|n| &n.lb_id == lb_id).collect();

        let mut desired_pairs: HashSet<(String, u16)> = HashSet::new();
        for (addr, _) in &active_by_addr {
            for binding in bindings {
                desired_pairs.insert((addr.to_string(), binding.port));
            }
        }

        let mut missing: Vec<(String, u16)> = desired_pairs
            .iter()
            .filter(|pair| !observed.iter().any(|n| n.address == pair.0 && n.port == pair.1))
            .cloned()
            .collect();
        missing.sort();
        if !missing.is_empty() {
            lb_adds.push(Step::new(StepKind::BulkAddToLb {
                lb_id: lb_id.clone(),
                nodes: missing.into_iter().map(|(addr, port)| (addr, port, LbNodeCondition::Enabled)).collect(),
            }));
        }

        let mut extra_remove: Vec<NodeId> = Vec::new();
        let mut expired_remove: Vec<NodeId> = Vec::new();
        let mut condition_changes: Vec<(NodeId, LbNodeCondition)> = Vec::new();

        for node in &observed {
            let key = (node.address.clone(), node.port);
            if let Some(deadline) = node.drain_deadline {
                if now >= deadline {
                    expired_remove.push(node.node_id.clone());
                    continue;
                }
            }
            if draining_by_addr.contains_key(node.address.as_str()) {
                if node.condition != LbNodeCondition::Draining {
                    condition_changes.push((node.node_id.clone(), LbNodeCondition::Draining));
                }
                continue;
            }
            if !desired_pairs.contains(&key) {
                extra_remove.push(node.node_id.clone());
            }
        }

        let mut all_remove = extra_remove;
        all_remove.extend(expired_remove);
        all_remove.sort();
        if !all_remove.is_empty() {
            removals.push(Step::new(StepKind::RemoveNodesFromLb { lb_id: lb_id.clone(), node_ids: all_remove }));
        }

        condition_changes.sort();
        for (node_id, condition) in condition_changes {
            metadata_updates.push(Step::new(StepKind::ChangeNodeCondition { lb_id: lb_id.clone(), node_id, condition }));
        }
    }

    // A draining server with no remaining LB attachment anywhere has
    // finished its drain; it is safe to delete. This isn't spelled out as
    // its own bullet in spec.md §4.3 but follows directly from the
    // lifecycle note in spec.md §3 (DRAINING -> DELETING -> gone) — see
    // DESIGN.md for the decision record.
    for server in &classification.draining {
        let addr = server.service_net_address();
        let still_attached = addr.map(|a| lb_nodes.iter().any(|n| n.address == a)).unwrap_or(false);
        if !still_attached {
            removals.push(Step::new(StepKind::DeleteServer(server.id.clone())));
        }
    }

    let removals: Vec<Step> = removals.into_iter().sorted_by_key(step_sort_key).collect();
    let metadata_updates: Vec<Step> = metadata_updates.into_iter().sorted_by_key(step_sort_key).collect();
    let lb_adds: Vec<Step> = lb_adds.into_iter().sorted_by_key(step_sort_key).collect();

    removals.into_iter().chain(metadata_updates).chain(creates).chain(lb_adds).collect()
}

/// Stable sort key: `(lb_id, server_id)` per spec.md §4.3 step 6, with an
/// empty lb_id for steps that aren't LB-scoped so they still sort
/// deterministically among themselves.
fn step_sort_key(step: &Step) -> (String, String) {
    match &step.kind {
        StepKind::DeleteServer(id) => (String::new(), id.0.clone()),
        StepKind::SetMetadata(id, k, _) => (String::new(), format!("{}{k}", id.0)),
        StepKind::RemoveMetadata(id, k) => (String::new(), format!("{}{k}", id.0)),
        StepKind::AddNodesToLb { lb_id, .. } => (lb_id.0.clone(), String::new()),
        StepKind::RemoveNodesFromLb { lb_id, .. } => (lb_id.0.clone(), String::new()),
        StepKind::ChangeNodeCondition { lb_id, node_id, .. } => (lb_id.0.clone(), node_id.0.clone()),
        StepKind::BulkAddToLb { lb_id, .. } => (lb_id.0.clone(), String::new()),
        StepKind::CreateServer(_) | StepKind::Sleep(_) => (String::new(), String::new()),
    }
}

fn choose_victims<'a>(classification: &Classification<'a>, count: usize) -> Vec<&'a Server> {
    let mut pending_sorted = classification.pending.clone();
    pending_sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let mut active_sorted = classification.active.clone();
    active_sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    pending_sorted.into_iter().chain(active_sorted).take(count).collect()
}

/// A cycle is stable iff the plan is empty and no server is in a
/// transient state (BUILD, DELETING, or DRAINING-not-expired). Spec.md
/// §4.3 step 7.
pub fn is_stable(plan: &[Step], servers: &[Server], lb_nodes: &[LbNode], now: DateTime<Utc>) -> bool {
    if !plan.is_empty() {
        return false;
    }
    for server in servers {
        match server.state {
            ServerLifecycleState::Build | ServerLifecycleState::Deleting | ServerLifecycleState::Unknown => return false,
            ServerLifecycleState::Active if server.is_draining() => {
                let addr = server.service_net_address();
                let expired = addr
                    .map(|a| {
                        lb_nodes
                            .iter()
                            .filter(|n| n.address == a)
                            .all(|n| n.drain_deadline.map(|d| now >= d).unwrap_or(false))
                    })
                    .unwrap_or(true);
                if !expired {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Defensive check backing spec.md §8 property 5: no plan for group `G`
/// ever deletes a server lacking `G`'s ownership metadata.
pub fn assert_no_foreign_deletes(plan: &[Step], servers: &[Server], group_id: &crate::model::GroupId) {
    for step in plan {
        if let StepKind::DeleteServer(id) = &step.kind {
            if let Some(server) = servers.iter().find(|s| &s.id == id) {
                debug_assert_eq!(
                    server.metadata.get(GROUP_ID_METADATA_KEY).map(|v| v.as_str()),
                    Some(group_id.0.as_str()),
                    "planner attempted to delete a server not owned by this group"
                );
            }
        }
    }
}
