//! Per-policy controller: cooldown gating, delta calculation, and the
//! entry points that trigger convergence. See spec.md §4.1.

use crate::config::EngineConfig;
use crate::error::ControllerError;
use crate::events::{EventEmitter, ScaleDirection, ScaleEvent};
use crate::model::{ChangeSpec, GroupConfig, GroupState, PolicyId, ScalingGroup, ServerId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Injected dependency that starts (or coalesces into) a convergence cycle
/// for a group. The real implementation is `converger::ConvergerService`;
/// tests substitute a fake that just records calls — see spec.md §9
/// ("Global mutable singleton → inject the converger as a dependency").
#[async_trait::async_trait]
pub trait ConvergenceTrigger: Send + Sync {
    async fn start_convergence(&self, tenant_id: &crate::model::TenantId, group_id: &crate::model::GroupId);
}

pub struct Controller<E: EventEmitter, C: ConvergenceTrigger> {
    events: Arc<E>,
    converger: Arc<C>,
    config: Arc<EngineConfig>,
}

impl<E: EventEmitter, C: ConvergenceTrigger> Controller<E, C> {
    pub fn new(events: Arc<E>, converger: Arc<C>, config: Arc<EngineConfig>) -> Self {
        Controller { events, converger, config }
    }

    /// Gate for spec.md §4.1 step 4: a tenant not feature-flagged onto the
    /// convergence engine never reaches `Converger.start_convergence`. The
    /// legacy direct launch/scale-down path this otherwise falls back to is
    /// out of core scope, so this is the error a caller gets instead.
    fn require_convergence_enabled(&self, group: &ScalingGroup) -> Result<(), ControllerError> {
        if self.config.tenant_is_enabled(&group.tenant_id.0) {
            Ok(())
        } else {
            Err(ControllerError::ConvergenceUnavailable { tenant_id: group.tenant_id.clone() })
        }
    }

    /// Executes a named policy against a group: cooldown check, delta
    /// calculation, convergence trigger, audit event. Returns the delta
    /// that was applied.
    pub async fn maybe_execute_policy(
        &self,
        group: &ScalingGroup,
        state: &mut GroupState,
        policy_id: &PolicyId,
        now: DateTime<Utc>,
    ) -> Result<i64, ControllerError> {
        let policy = group
            .policies
            .get(policy_id)
            .ok_or_else(|| ControllerError::NoSuchPolicy { group_id: group.group_id.clone(), policy_id: policy_id.clone() })?;

        if !check_cooldowns(state, &group.config, policy, policy_id, now) {
            return Err(ControllerError::CannotExecutePolicy { reason: "cooldowns not met".to_string() });
        }

        let delta = calculate_delta(state, &group.config, policy);
        if delta == 0 {
            return Err(ControllerError::CannotExecutePolicy { reason: "no change in servers".to_string() });
        }

        self.require_convergence_enabled(group)?;

        self.converger.start_convergence(&group.tenant_id, &group.group_id).await;
        state.group_touched = Some(now);
        state.policy_touched.insert(policy_id.clone(), now);

        self.emit_scale_event(group, state, Some(policy_id.clone()), None, delta);
        Ok(delta)
    }

    /// Same as `maybe_execute_policy` but skips cooldowns, used when the
    /// group's own config (not a policy) is edited. `launch` is accepted
    /// so callers can pass an updated launch template, even though this
    /// controller does not persist it (persistence is the store's job).
    pub async fn obey_config_change(
        &self,
        group: &ScalingGroup,
        state: &mut GroupState,
        config: &GroupConfig,
        _launch: crate::model::LaunchTemplate,
        now: DateTime<Utc>,
    ) -> Result<i64, ControllerError> {
        let synthetic = crate::model::Policy {
            id: PolicyId("__config_change__".to_string()),
            cooldown: chrono::Duration::zero(),
            change: ChangeSpec::AbsoluteDelta(0),
        };
        let delta = calculate_delta(state, config, &synthetic);

        self.require_convergence_enabled(group)?;

        self.converger.start_convergence(&group.tenant_id, &group.group_id).await;
        state.group_touched = Some(now);

        self.emit_scale_event(group, state, None, None, delta);
        Ok(delta)
    }

    /// Removes a single server from the group outside of normal
    /// convergence (e.g. an operator-initiated delete). See spec.md §4.1.
    pub fn convergence_remove_server(
        &self,
        group: &ScalingGroup,
        state: &mut GroupState,
        server_id: &ServerId,
        replace: bool,
        purge: bool,
    ) -> Result<(), ControllerError> {
        let server = state
            .active
            .get(server_id)
            .ok_or_else(|| ControllerError::ServerNotFound { group_id: group.group_id.clone(), server_id: server_id.clone() })?;

        if !server.owned_by(&group.group_id) {
            return Err(ControllerError::ServerNotFound { group_id: group.group_id.clone(), server_id: server_id.clone() });
        }

        if !replace && state.active_plus_pending() <= group.config.min_entities {
            return Err(ControllerError::CannotDeleteBelowMin { group_id: group.group_id.clone() });
        }

        if let Some(server) = state.active.get_mut(server_id) {
            if purge {
                server
                    .metadata
                    .insert(crate::model::SERVER_STATE_METADATA_KEY.to_string(), crate::model::DRAINING_METADATA_VALUE.to_string());
            } else {
                server.metadata.remove(crate::model::GROUP_ID_METADATA_KEY);
                server.metadata.remove(crate::model::LB_IDS_METADATA_KEY);
            }
        }

        if !replace {
            state.desired = state.desired.saturating_sub(1);
        }

        Ok(())
    }

    fn emit_scale_event(&self, group: &ScalingGroup, state: &GroupState, policy_id: Option<PolicyId>, webhook_id: Option<String>, delta: i64) {
        let direction = if delta >= 0 { ScaleDirection::Up } else { ScaleDirection::Down };
        self.events.scale_event(ScaleEvent {
            group_id: group.group_id.clone(),
            policy_id,
            webhook_id,
            direction,
            convergence_delta: delta,
            desired_capacity: state.desired,
            pending_capacity: state.pending.len() as u32,
            active_capacity: state.active.len() as u32,
            correlation_id: Uuid::new_v4(),
        });
    }
}

/// Resolves the raw target from a change spec, clamps it into
/// `[min, max_or_default]`, stores it as the new desired capacity, and
/// returns the delta relative to the current active+pending count.
///
/// Pure aside from the `state.desired` side effect the spec mandates
/// (spec.md §4.1, step 3). Percent rounds away from zero.
pub fn calculate_delta(state: &mut GroupState, config: &GroupConfig, policy: &crate::model::Policy) -> i64 {
    let current = state.active_plus_pending() as i64;
    let raw = match policy.change {
        ChangeSpec::AbsoluteDelta(d) => current + d,
        ChangeSpec::Percent(p) => {
            let magnitude = (p.abs() / 100.0 * current as f64).ceil() as i64;
            current + (if p < 0.0 { -magnitude } else { magnitude })
        }
        ChangeSpec::AbsoluteTarget(t) => t as i64,
    };

    let min = config.min_entities as i64;
    let max = config.max_or_default() as i64;
    let target = raw.clamp(min, max);

    state.desired = target as u32;
    target - current
}

/// True iff both the group-level and policy-level cooldowns have elapsed.
/// A missing touch timestamp counts as "long ago" — infinitely in the
/// past — so a group or policy that has never fired is never blocked.
pub fn check_cooldowns(
    state: &GroupState,
    config: &GroupConfig,
    policy: &crate::model::Policy,
    policy_id: &PolicyId,
    now: DateTime<Utc>,
) -> bool {
    let group_ok = match state.group_touched {
        Some(touched) => now - touched >= config.cooldown,
        None => true,
    };
    let policy_ok = match state.policy_touched.get(policy_id) {
        Some(touched) => now - *touched >= policy.cooldown,
        None => true,
    };
    group_ok && policy_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::collections::HashMap;

    fn config(min: u32, max: u32) -> GroupConfig {
        GroupConfig { min_entities: min, max_entities: Some(max), default_max_entities: max, cooldown: chrono::Duration::zero() }
    }

    fn state_with(active: usize, pending: usize) -> GroupState {
        let mut s = GroupState::new(0);
        for i in 0..active {
            s.active.insert(
                ServerId(format!("a{i}")),
                Server { id: ServerId(format!("a{i}")), state: ServerLifecycleState::Active, created_at: Utc::now(), addresses: vec![], metadata: HashMap::new() },
            );
        }
        for i in 0..pending {
            s.pending.insert(ServerId(format!("p{i}")), PendingJob { requested_at: Utc::now() });
        }
        s
    }

    fn policy(change: ChangeSpec) -> Policy {
        Policy { id: PolicyId("p1".into()), cooldown: chrono::Duration::zero(), change }
    }

    #[test]
    fn positive_change_within_min_max() {
        let mut state = state_with(5, 0);
        let cfg = config(0, 300);
        let delta = calculate_delta(&mut state, &cfg, &policy(ChangeSpec::AbsoluteDelta(5)));
        assert_eq!(delta, 5);
        assert_eq!(state.desired, 10);
    }

    #[test]
    fn positive_change_clamped_at_max() {
        let mut state = state_with(4, 4);
        let cfg = config(0, 10);
        let delta = calculate_delta(&mut state, &cfg, &policy(ChangeSpec::AbsoluteDelta(5)));
        assert_eq!(delta, 2);
        assert_eq!(state.desired, 10);
    }

    #[test]
    fn positive_change_already_at_max_is_zero() {
        let mut state = state_with(5, 5);
        let cfg = config(0, 10);
        let delta = calculate_delta(&mut state, &cfg, &policy(ChangeSpec::AbsoluteDelta(5)));
        assert_eq!(delta, 0);
        assert_eq!(state.desired, 10);
    }

    #[test]
    fn percent_rounds_away_from_zero() {
        // (+5%, 5 servers) -> +1
        let mut state = state_with(5, 0);
        let cfg = config(0, 300);
        let delta = calculate_delta(&mut state, &cfg, &policy(ChangeSpec::Percent(5.0)));
        assert_eq!(delta, 1);

        // (-5%, 5 servers) -> -1
        let mut state = state_with(5, 0);
        let delta = calculate_delta(&mut state, &cfg, &policy(ChangeSpec::Percent(-5.0)));
        assert_eq!(delta, -1);
    }

    #[test]
    fn percent_positive_clamped() {
        // (+50%, 5, cap=8) -> +3
        let mut state = state_with(5, 0);
        let cfg = config(0, 8);
        let delta = calculate_delta(&mut state, &cfg, &policy(ChangeSpec::Percent(50.0)));
        assert_eq!(delta, 3);
        assert_eq!(state.desired, 8);
    }

    #[test]
    fn zero_change_below_min_pulls_up() {
        let mut state = state_with(0, 0);
        let cfg = config(5, 300);
        let delta = calculate_delta(&mut state, &cfg, &policy(ChangeSpec::AbsoluteDelta(0)));
        assert_eq!(delta, 5);
        assert_eq!(state.desired, 5);
    }

    #[test]
    fn zero_change_within_bounds_is_zero() {
        let mut state = state_with(5, 0);
        let cfg = config(0, 10);
        let delta = calculate_delta(&mut state, &cfg, &policy(ChangeSpec::AbsoluteDelta(0)));
        assert_eq!(delta, 0);
    }

    #[test]
    fn missing_touch_timestamps_count_as_long_ago() {
        let state = state_with(5, 0);
        let cfg = config(0, 10);
        let pol = Policy { id: PolicyId("p1".into()), cooldown: chrono::Duration::seconds(30), change: ChangeSpec::AbsoluteDelta(1) };
        assert!(check_cooldowns(&state, &cfg, &pol, &pol.id, Utc::now()));
    }

    #[test]
    fn cooldown_blocks_when_recently_touched() {
        let mut state = state_with(4, 0);
        let now = Utc::now();
        state.group_touched = Some(now - chrono::Duration::seconds(20));
        let cfg = GroupConfig { min_entities: 4, max_entities: Some(10), default_max_entities: 10, cooldown: chrono::Duration::seconds(30) };
        let pol = Policy { id: PolicyId("p1".into()), cooldown: chrono::Duration::zero(), change: ChangeSpec::AbsoluteDelta(1) };
        assert!(!check_cooldowns(&state, &cfg, &pol, &pol.id, now));
    }
}
