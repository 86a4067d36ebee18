//! Structured audit events. Grounded on the teacher's `events`/`logger`
//! split: `tracing` carries free-form operational logs, while this trait
//! carries the handful of events that are contractually part of the audit
//! trail (spec.md §4.6) and that tests assert against directly rather than
//! by scraping log output.

use crate::model::{GroupId, PolicyId, StepKind};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct ScaleEvent {
    pub group_id: GroupId,
    pub policy_id: Option<PolicyId>,
    pub webhook_id: Option<String>,
    pub direction: ScaleDirection,
    pub convergence_delta: i64,
    pub desired_capacity: u32,
    pub pending_capacity: u32,
    pub active_capacity: u32,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEventKind {
    Success,
    Retry,
    Fail,
}

#[derive(Debug, Clone)]
pub struct StepEvent {
    pub group_id: GroupId,
    pub step: StepKind,
    pub kind: StepEventKind,
    pub attempt: u32,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEventKind {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub struct CycleEvent {
    pub group_id: GroupId,
    pub kind: CycleEventKind,
    pub duration: Option<std::time::Duration>,
    pub correlation_id: Uuid,
}

/// Audit log sink interface. A real sink (Kafka, a database-backed audit
/// table, ...) is an external collaborator per spec.md §1; this crate only
/// defines the contract plus a `tracing`-backed default and an in-memory
/// fake for tests.
pub trait EventEmitter: Send + Sync {
    fn scale_event(&self, event: ScaleEvent);
    fn step_event(&self, event: StepEvent);
    fn cycle_event(&self, event: CycleEvent);
}

/// Default emitter: renders every event as a structured `tracing` record
/// tagged `audit_log = true`, so a log-shipping pipeline can filter on that
/// field without this crate needing to know about the pipeline.
#[derive(Debug, Clone, Default)]
pub struct TracingEventEmitter;

impl EventEmitter for TracingEventEmitter {
    fn scale_event(&self, event: ScaleEvent) {
        let name = match event.direction {
            ScaleDirection::Up => "convergence.scale_up",
            ScaleDirection::Down => "convergence.scale_down",
        };
        info!(
            audit_log = true,
            event = name,
            scaling_group_id = %event.group_id,
            policy_id = event.policy_id.as_ref().map(|p| p.0.as_str()),
            webhook_id = event.webhook_id.as_deref(),
            convergence_delta = event.convergence_delta,
            desired_capacity = event.desired_capacity,
            pending_capacity = event.pending_capacity,
            active_capacity = event.active_capacity,
            correlation_id = %event.correlation_id,
            "scaling policy triggered convergence"
        );
    }

    fn step_event(&self, event: StepEvent) {
        let name = match event.kind {
            StepEventKind::Success => "convergence.step.success",
            StepEventKind::Retry => "convergence.step.retry",
            StepEventKind::Fail => "convergence.step.fail",
        };
        debug!(
            audit_log = true,
            event = name,
            scaling_group_id = %event.group_id,
            step = ?event.step,
            attempt = event.attempt,
            correlation_id = %event.correlation_id,
            "step outcome"
        );
    }

    fn cycle_event(&self, event: CycleEvent) {
        let name = match event.kind {
            CycleEventKind::Start => "convergence.cycle.start",
            CycleEventKind::End => "convergence.cycle.end",
        };
        info!(
            audit_log = true,
            event = name,
            scaling_group_id = %event.group_id,
            duration_ms = event.duration.map(|d| d.as_millis() as u64),
            correlation_id = %event.correlation_id,
            "convergence cycle boundary"
        );
    }
}

/// In-memory emitter for tests: records every event for later assertion
/// instead of rendering it.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum RecordedEvent {
        Scale(ScaleEvent),
        Step(StepEvent),
        Cycle(CycleEvent),
    }

    #[derive(Default)]
    pub struct FakeEventEmitter {
        pub events: Mutex<Vec<RecordedEvent>>,
    }

    impl EventEmitter for FakeEventEmitter {
        fn scale_event(&self, event: ScaleEvent) {
            self.events.lock().unwrap().push(RecordedEvent::Scale(event));
        }

        fn step_event(&self, event: StepEvent) {
            self.events.lock().unwrap().push(RecordedEvent::Step(event));
        }

        fn cycle_event(&self, event: CycleEvent) {
            self.events.lock().unwrap().push(RecordedEvent::Cycle(event));
        }
    }
}
