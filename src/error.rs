use crate::model::{GroupId, PolicyId, ServerId, StepKind, TenantId};
use std::time::Duration;
use thiserror::Error;

/// Error surfaced by the Cloud Gateway (compute or load balancer transport).
///
/// Carries enough of the wire response to let callers classify retry vs
/// terminal without re-parsing a status code everywhere.
#[derive(Debug, Clone, Error)]
#[error("cloud api error: status={status} body={body}")]
pub struct CloudApiError {
    pub status: u16,
    pub body: String,
    pub retryable: bool,
}

impl CloudApiError {
    pub fn new(status: u16, body: impl Into<String>, retryable: bool) -> Self {
        CloudApiError {
            status,
            body: body.into(),
            retryable,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        CloudApiError {
            status: 0,
            body: message.into(),
            retryable: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatherError {
    #[error("hard failure listing servers for group {group_id}: {source}")]
    Servers { group_id: GroupId, source: CloudApiError },
    #[error("hard failure listing nodes for lb {lb_id}: {source}")]
    LbNodes { lb_id: crate::model::LbId, source: CloudApiError },
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("ambiguous server creation for group {group_id}: {count} candidates match launch template")]
    ServerCreationRetry { group_id: GroupId, count: usize },
    #[error("server {server_id} reported unexpected status {got}, expected {want}")]
    UnexpectedServerStatus { server_id: ServerId, got: String, want: String },
    #[error("timed out waiting on {operation} after {duration:?}")]
    TimedOut { operation: String, duration: Duration },
    #[error(transparent)]
    CloudApi(#[from] CloudApiError),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("no such policy {policy_id} for group {group_id}")]
    NoSuchPolicy { group_id: GroupId, policy_id: PolicyId },
    #[error("cannot execute policy: {reason}")]
    CannotExecutePolicy { reason: String },
    #[error("server {server_id} not found in group {group_id}")]
    ServerNotFound { group_id: GroupId, server_id: ServerId },
    #[error("cannot delete server below minimum capacity for group {group_id}")]
    CannotDeleteBelowMin { group_id: GroupId },
    /// Tenant is not feature-flagged onto the convergence engine (spec.md
    /// §4.1 step 4, §6). The legacy direct launch/scale-down path is out of
    /// core scope, so a non-flagged tenant gets this instead of silently
    /// falling back to it.
    #[error("tenant {tenant_id} is not enabled for convergence")]
    ConvergenceUnavailable { tenant_id: TenantId },
    #[error(transparent)]
    Convergence(#[from] ConvergenceError),
}

#[derive(Debug, Error)]
pub enum ConvergenceError {
    #[error(transparent)]
    Gather(#[from] GatherError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("cycle for group {group_id} exceeded its deadline")]
    CycleTimedOut { group_id: GroupId },
    /// A server (or servers) in this group stayed in `ERROR` across
    /// `attempts` consecutive cycles despite the planner recreating them
    /// each time; treated as terminal rather than retried forever. See
    /// spec.md §8 scenario E4.
    #[error("group {group_id} had servers stuck in ERROR for {attempts} consecutive cycles")]
    PersistentServerError { group_id: GroupId, attempts: u32 },
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Reserved for a `LockProvider` backend that can tell "held by another
    /// owner, don't bother queuing" apart from ordinary contention it should
    /// just wait out. The in-memory fake always queues, so it never
    /// constructs this; a real coordination-service backend (etcd, a
    /// database row with a fencing token) is the expected caller.
    #[error("lock /convergence/{group_id} is held by another owner")]
    Contended { group_id: GroupId },
    #[error("timed out acquiring lock /convergence/{group_id} after {duration:?}")]
    AcquireTimedOut { group_id: GroupId, duration: Duration },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such group {group_id} for tenant {tenant_id}")]
    NoSuchGroup { tenant_id: TenantId, group_id: GroupId },
    #[error("underlying store failure: {0}")]
    Backend(String),
}

/// Top-level error, used at crate boundaries that need to answer callers
/// (an HTTP layer, a CLI) with a single type. Internal components return
/// their own narrower error (`ControllerError`, `ConvergenceError`, ...);
/// this exists purely as the composition point, mirroring how the teacher
/// narrows many transport-specific errors into one `EngineError`.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Convergence(#[from] ConvergenceError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AutoscaleError {
    /// Maps the taxonomy in the spec's error handling design to an HTTP
    /// status code, for the conventional API boundary layer that would sit
    /// in front of this crate.
    pub fn http_status(&self) -> u16 {
        match self {
            AutoscaleError::Controller(ControllerError::NoSuchPolicy { .. }) => 404,
            AutoscaleError::Controller(ControllerError::ServerNotFound { .. }) => 404,
            AutoscaleError::Controller(ControllerError::CannotExecutePolicy { .. }) => 403,
            AutoscaleError::Controller(ControllerError::CannotDeleteBelowMin { .. }) => 403,
            AutoscaleError::Controller(ControllerError::ConvergenceUnavailable { .. }) => 503,
            AutoscaleError::Store(StoreError::NoSuchGroup { .. }) => 404,
            AutoscaleError::Lock(_) => 503,
            _ => 500,
        }
    }
}

/// Per-step retry classification table from the spec's Step Executor
/// design. Returns whether an outcome is retryable, terminal, or a success
/// that should still be logged as unexpected.
pub fn classify_step_outcome(step: &StepKind, status: u16, body: &str) -> StepOutcomeClass {
    use StepKind::*;
    match step {
        CreateServer(_) => match status {
            200..=299 => StepOutcomeClass::Success,
            429 | 500..=599 => StepOutcomeClass::Retryable,
            _ => StepOutcomeClass::Terminal,
        },
        DeleteServer(_) => match status {
            200..=299 | 404 => StepOutcomeClass::Success,
            500..=599 => StepOutcomeClass::Retryable,
            _ => StepOutcomeClass::Terminal,
        },
        AddNodesToLb { .. } | BulkAddToLb { .. } => {
            if (200..=299).contains(&status) {
                StepOutcomeClass::Success
            } else if status == 422 && body.contains("LB is deleted") {
                StepOutcomeClass::Terminal
            } else if status == 404 {
                StepOutcomeClass::Terminal
            } else if status == 422 && body.contains("PENDING_UPDATE") {
                StepOutcomeClass::Retryable
            } else if status == 429 || (500..=599).contains(&status) {
                StepOutcomeClass::Retryable
            } else {
                StepOutcomeClass::UnexpectedButRetryable
            }
        }
        RemoveNodesFromLb { .. } => {
            if (200..=299).contains(&status) || status == 404 {
                StepOutcomeClass::Success
            } else if status == 422 && (body.contains("LB deleted") || body.contains("PENDING_DELETE")) {
                StepOutcomeClass::Success
            } else if status == 422 && body.contains("PENDING_UPDATE") {
                StepOutcomeClass::Retryable
            } else if (500..=599).contains(&status) {
                StepOutcomeClass::Retryable
            } else {
                StepOutcomeClass::Terminal
            }
        }
        SetMetadata { .. } | RemoveMetadata { .. } | ChangeNodeCondition { .. } => match status {
            200..=299 => StepOutcomeClass::Success,
            500..=599 => StepOutcomeClass::Retryable,
            _ => StepOutcomeClass::Terminal,
        },
        Sleep(_) => StepOutcomeClass::Success,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcomeClass {
    Success,
    Retryable,
    Terminal,
    /// A status the table doesn't name; logged as "unexpected status" but
    /// still counted against the retry budget, per spec.md §4.4.
    UnexpectedButRetryable,
}
