//! Durable group configuration and runtime state. The converger and
//! controller never hold a `ScalingGroup`/`GroupState` in memory between
//! requests; they load it from the store, mutate a local copy, and save it
//! back, the same load-mutate-save discipline the original's
//! `get_desired_group_state`/`execute_convergence` plumbing uses.

use crate::error::StoreError;
use crate::model::{GroupId, GroupState, ScalingGroup, TenantId};
use async_trait::async_trait;

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn load_group(&self, tenant_id: &TenantId, group_id: &GroupId) -> Result<ScalingGroup, StoreError>;
    async fn load_state(&self, tenant_id: &TenantId, group_id: &GroupId) -> Result<GroupState, StoreError>;
    async fn save_state(&self, tenant_id: &TenantId, group_id: &GroupId, state: &GroupState) -> Result<(), StoreError>;

    /// Stamps `group_touched` to `now` without otherwise altering state;
    /// used by the controller immediately after a policy execution to seed
    /// the group-wide cooldown window.
    async fn touch_group(&self, tenant_id: &TenantId, group_id: &GroupId, now: chrono::DateTime<chrono::Utc>) -> Result<(), StoreError>;

    /// Stamps the per-policy cooldown window.
    async fn touch_policy(
        &self,
        tenant_id: &TenantId,
        group_id: &GroupId,
        policy_id: &crate::model::PolicyId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError>;
}

/// In-memory `GroupStore` for tests. Not fit for production: no persistence
/// across restarts, no optimistic concurrency control on `save_state`.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeGroupStore {
        groups: Mutex<HashMap<(String, String), (ScalingGroup, GroupState)>>,
    }

    impl FakeGroupStore {
        pub fn new() -> Self {
            FakeGroupStore::default()
        }

        pub fn insert(&self, tenant_id: TenantId, group: ScalingGroup, state: GroupState) {
            self.groups.lock().unwrap().insert((tenant_id.0, group.group_id.0.clone()), (group, state));
        }

        fn key(tenant_id: &TenantId, group_id: &GroupId) -> (String, String) {
            (tenant_id.0.clone(), group_id.0.clone())
        }
    }

    #[async_trait]
    impl GroupStore for FakeGroupStore {
        async fn load_group(&self, tenant_id: &TenantId, group_id: &GroupId) -> Result<ScalingGroup, StoreError> {
            self.groups
                .lock()
                .unwrap()
                .get(&Self::key(tenant_id, group_id))
                .map(|(group, _)| group.clone())
                .ok_or_else(|| StoreError::NoSuchGroup { tenant_id: tenant_id.clone(), group_id: group_id.clone() })
        }

        async fn load_state(&self, tenant_id: &TenantId, group_id: &GroupId) -> Result<GroupState, StoreError> {
            self.groups
                .lock()
                .unwrap()
                .get(&Self::key(tenant_id, group_id))
                .map(|(_, state)| state.clone())
                .ok_or_else(|| StoreError::NoSuchGroup { tenant_id: tenant_id.clone(), group_id: group_id.clone() })
        }

        async fn save_state(&self, tenant_id: &TenantId, group_id: &GroupId, state: &GroupState) -> Result<(), StoreError> {
            let mut groups = self.groups.lock().unwrap();
            let entry = groups
                .get_mut(&Self::key(tenant_id, group_id))
                .ok_or_else(|| StoreError::NoSuchGroup { tenant_id: tenant_id.clone(), group_id: group_id.clone() })?;
            entry.1 = state.clone();
            Ok(())
        }

        async fn touch_group(&self, tenant_id: &TenantId, group_id: &GroupId, now: chrono::DateTime<chrono::Utc>) -> Result<(), StoreError> {
            let mut groups = self.groups.lock().unwrap();
            let entry = groups
                .get_mut(&Self::key(tenant_id, group_id))
                .ok_or_else(|| StoreError::NoSuchGroup { tenant_id: tenant_id.clone(), group_id: group_id.clone() })?;
            entry.1.group_touched = Some(now);
            Ok(())
        }

        async fn touch_policy(
            &self,
            tenant_id: &TenantId,
            group_id: &GroupId,
            policy_id: &crate::model::PolicyId,
            now: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), StoreError> {
            let mut groups = self.groups.lock().unwrap();
            let entry = groups
                .get_mut(&Self::key(tenant_id, group_id))
                .ok_or_else(|| StoreError::NoSuchGroup { tenant_id: tenant_id.clone(), group_id: group_id.clone() })?;
            entry.1.policy_touched.insert(policy_id.clone(), now);
            Ok(())
        }
    }
}
