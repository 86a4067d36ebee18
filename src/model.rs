//! Core data model: scaling groups, observed fleet state, and the Step
//! vocabulary the planner emits. Types here are plain data — no I/O, no
//! interior mutability beyond what ownership naturally requires.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, derive_more::Display)]
        pub struct $name(pub String);

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

newtype_id!(TenantId);
newtype_id!(GroupId);
newtype_id!(PolicyId);
newtype_id!(ServerId);
newtype_id!(LbId);
newtype_id!(NodeId);

pub const GROUP_ID_METADATA_KEY: &str = "rax:auto_scaling_group_id";
pub const LB_IDS_METADATA_KEY: &str = "rax:auto_scaling_lbids";
pub const SERVER_STATE_METADATA_KEY: &str = "rax:autoscale:server:state";
pub const DRAINING_METADATA_VALUE: &str = "DRAINING";

pub fn lb_port_metadata_key(lb_id: &LbId) -> String {
    format!("rax:auto_scaling:lb:{lb_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum ServerLifecycleState {
    #[strum(serialize = "BUILD")]
    Build,
    #[strum(serialize = "ACTIVE")]
    Active,
    #[strum(serialize = "ERROR")]
    Error,
    #[strum(serialize = "DELETING")]
    Deleting,
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum LbNodeCondition {
    #[strum(serialize = "ENABLED")]
    Enabled,
    #[strum(serialize = "DISABLED")]
    Disabled,
    #[strum(serialize = "DRAINING")]
    Draining,
}

/// A server as observed from the compute service. Identity is the id alone:
/// two `Server` values with the same id are the same server regardless of
/// what else changed, which is what the planner's classification pass and
/// de-dup logic rely on.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: ServerId,
    pub state: ServerLifecycleState,
    pub created_at: DateTime<Utc>,
    pub addresses: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Server {}
impl std::hash::Hash for Server {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl Server {
    pub fn owned_by(&self, group_id: &GroupId) -> bool {
        self.metadata.get(GROUP_ID_METADATA_KEY).map(|v| v.as_str()) == Some(group_id.0.as_str())
    }

    pub fn is_draining(&self) -> bool {
        self.metadata.get(SERVER_STATE_METADATA_KEY).map(|v| v.as_str()) == Some(DRAINING_METADATA_VALUE)
    }

    /// First service-net address, used to match the server against LB
    /// nodes. Real deployments filter by network label; this crate keeps
    /// the contract abstract since network topology is conventional.
    pub fn service_net_address(&self) -> Option<&str> {
        self.addresses.first().map(|s| s.as_str())
    }
}

/// A load balancer node as observed from the LB service. Identity is
/// `(lb_id, node_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbNode {
    pub lb_id: LbId,
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    pub condition: LbNodeCondition,
    pub drain_deadline: Option<DateTime<Utc>>,
}

impl std::hash::Hash for LbNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.lb_id.hash(state);
        self.node_id.hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct ObservedFleet {
    pub servers: Vec<Server>,
    pub lb_nodes: Vec<LbNode>,
}

/// The kind of load balancer a binding targets. Only `CloudLoadBalancer`
/// bindings are acted on by the planner; other kinds (e.g. a private
/// network attachment) are accepted in the launch template but ignored,
/// matching the original `json_to_LBConfigs` filter behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbBindingKind {
    CloudLoadBalancer,
    Other,
}

#[derive(Debug, Clone)]
pub struct LbBinding {
    pub lb_id: LbId,
    pub port: u16,
    pub kind: LbBindingKind,
    /// Whether scale-down should drain connections before removing the
    /// node (vs an immediate remove).
    pub connection_draining: bool,
    pub drain_timeout: chrono::Duration,
}

/// An opaque, immutable payload describing how to create a server. The
/// compute service's exact request shape is a transport concern; this
/// crate only needs enough of it to match servers back to the template
/// (image, flavor, name pattern) and to attach the group's ownership
/// metadata.
#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    pub image: String,
    pub flavor: String,
    pub name_prefix: String,
    pub payload: serde_json::Value,
    pub lb_bindings: Vec<LbBinding>,
}

impl LaunchTemplate {
    /// Regex matching the exact server name this template would produce,
    /// used by the create-adoption matcher (spec.md §4.4, `find_server`).
    pub fn name_regex(&self) -> String {
        format!("^{}-[0-9a-fA-F-]+$", regex::escape(&self.name_prefix))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ChangeSpec {
    AbsoluteDelta(i64),
    Percent(f64),
    AbsoluteTarget(u32),
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub id: PolicyId,
    pub cooldown: chrono::Duration,
    pub change: ChangeSpec,
}

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub min_entities: u32,
    pub max_entities: Option<u32>,
    pub default_max_entities: u32,
    pub cooldown: chrono::Duration,
}

impl GroupConfig {
    pub fn max_or_default(&self) -> u32 {
        self.max_entities.unwrap_or(self.default_max_entities)
    }
}

#[derive(Debug, Clone)]
pub struct ScalingGroup {
    pub tenant_id: TenantId,
    pub group_id: GroupId,
    pub launch: LaunchTemplate,
    pub config: GroupConfig,
    pub policies: HashMap<PolicyId, Policy>,
}

/// Per-server bookkeeping the controller keeps for servers it has asked
/// the compute service to build but that haven't shown up as ACTIVE or
/// ERROR yet.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub requested_at: DateTime<Utc>,
}

/// Runtime state for a scaling group. Mutated only by the controller
/// (before a convergence trigger) and by the converger task (during a
/// cycle); see spec.md §5 for the ownership discipline.
#[derive(Debug, Clone)]
pub struct GroupState {
    pub desired: u32,
    pub active: HashMap<ServerId, Server>,
    pub pending: HashMap<ServerId, PendingJob>,
    pub group_touched: Option<DateTime<Utc>>,
    pub policy_touched: HashMap<PolicyId, DateTime<Utc>>,
    pub paused: bool,
    /// Number of consecutive cycles that observed at least one server in
    /// `ERROR` state for this group. Reset to 0 the first cycle that
    /// observes none. Used to cap automatic delete-and-recreate churn —
    /// spec.md §3/§4.3/§8 (scenario E4) treats repeated `ERROR` as
    /// recoverable by recreation "up to 3 times", after which it becomes a
    /// terminal `UnexpectedServerStatus` rather than endless retrying.
    pub consecutive_error_cycles: u32,
}

impl GroupState {
    pub fn new(desired: u32) -> Self {
        GroupState {
            desired,
            active: HashMap::new(),
            pending: HashMap::new(),
            group_touched: None,
            policy_touched: HashMap::new(),
            paused: false,
            consecutive_error_cycles: 0,
        }
    }

    pub fn active_plus_pending(&self) -> u32 {
        (self.active.len() + self.pending.len()) as u32
    }
}

/// Per-cycle, ephemeral snapshot the planner consumes. Freshly constructed
/// from current group config at the start of each cycle; never persisted,
/// never mutated in place once built.
#[derive(Debug, Clone)]
pub struct DesiredGroupState {
    pub launch_template: LaunchTemplate,
    pub desired: u32,
    pub lb_bindings: HashMap<LbId, Vec<LbBinding>>,
}

impl DesiredGroupState {
    pub fn from_group(group: &ScalingGroup, desired: u32) -> Self {
        let mut lb_bindings: HashMap<LbId, Vec<LbBinding>> = HashMap::new();
        for binding in &group.launch.lb_bindings {
            if binding.kind != LbBindingKind::CloudLoadBalancer {
                continue;
            }
            lb_bindings.entry(binding.lb_id.clone()).or_default().push(binding.clone());
        }
        DesiredGroupState {
            launch_template: group.launch.clone(),
            desired,
            lb_bindings,
        }
    }
}

/// A primitive reconciling operation emitted by the planner. The planner
/// never executes a step; only the executor performs I/O (spec.md §9,
/// "Effect/intent separation").
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    CreateServer(LaunchTemplate),
    DeleteServer(ServerId),
    SetMetadata(ServerId, String, String),
    RemoveMetadata(ServerId, String),
    /// Single-node (or small-batch) LB attach, used by the create-attach
    /// composition as it builds up a server's LB membership one step at a
    /// time (so each add has a matching undo entry on the task-local undo
    /// stack, spec.md §4.4/§9).
    AddNodesToLb { lb_id: LbId, nodes: Vec<(String, u16, LbNodeCondition)> },
    RemoveNodesFromLb { lb_id: LbId, node_ids: Vec<NodeId> },
    ChangeNodeCondition { lb_id: LbId, node_id: NodeId, condition: LbNodeCondition },
    /// Batched attach for an entire lb's worth of missing nodes, emitted
    /// by the planner's LB reconciliation pass (spec.md §4.3 step 5).
    BulkAddToLb { lb_id: LbId, nodes: Vec<(String, u16, LbNodeCondition)> },
    Sleep(std::time::Duration),
}

impl PartialEq for LaunchTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image && self.flavor == other.flavor && self.name_prefix == other.name_prefix
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub kind: StepKind,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Step { kind }
    }
}
