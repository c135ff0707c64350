use serde::{Deserialize, Serialize};

use crate::Event;

/// Provider-backed queues drained by the runtime dispatchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Completions, raised events and control messages bound for an instance.
    Orchestrator,
    /// Activity executions.
    Worker,
    /// Timer schedules and cancellations.
    Timer,
}

/// Durable unit of work exchanged between the runtime's dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    TimerCancel {
        instance: String,
        id: u64,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerCancel { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
        }
    }

    /// Identical copies of these items carry no extra meaning and collapse on enqueue.
    /// Raised events are distinct occurrences even when their payloads match.
    pub(crate) fn dedupes(&self) -> bool {
        !matches!(self, WorkItem::ExternalRaised { .. })
    }
}

/// A queued work item tagged with its arrival order. Abandoned items go back
/// to their arrival position, ahead of anything enqueued after them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct Queued {
    pub seq: u64,
    pub item: WorkItem,
}

/// Put `entry` back among `visible`, which is kept sorted by `seq`.
pub(crate) fn restore_in_order(visible: &mut Vec<Queued>, entry: Queued) {
    let at = visible.partition_point(|q| q.seq < entry.seq);
    visible.insert(at, entry);
}

const ALREADY_EXISTS: &str = "instance already exists";

pub(crate) fn already_exists(instance: &str) -> String {
    format!("{ALREADY_EXISTS}: {instance}")
}

/// Whether a `create_instance` error reports that the instance is already there.
pub fn is_already_exists(err: &str) -> bool {
    err.starts_with(ALREADY_EXISTS)
}

/// Idempotency key for events a provider must not record twice.
/// Raised external events have no key: every raise is recorded.
pub(crate) fn dedupe_key(ev: &Event) -> Option<(u64, &'static str)> {
    match ev {
        Event::ActivityScheduled { id, .. } | Event::TimerCreated { id, .. } | Event::CustomStatusSet { id, .. } => {
            Some((*id, "position"))
        }
        Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some((*id, "activity-result")),
        Event::TimerFired { id, .. } => Some((*id, "timer-fired")),
        Event::TimerCancelled { id } => Some((*id, "timer-cancelled")),
        Event::OrchestrationStarted { .. } => Some((0, "started")),
        Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. } | Event::OrchestrationTerminated { .. } => {
            Some((0, "terminal"))
        }
        Event::ExternalEvent { .. } => None,
    }
}

/// Storage abstraction for append-only orchestration history per instance,
/// plus the peek-lock work queues the runtime dispatches from.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read full history for an instance.
    async fn read(&self, instance: &str) -> Vec<Event>;
    /// Append events for an instance. Events whose idempotency key is already
    /// present are skipped. Fails if the instance is missing or limits would be exceeded.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;
    /// Whether the instance was created in this store.
    async fn exists(&self, instance: &str) -> bool {
        self.list_instances().await.iter().any(|i| i == instance)
    }
    /// Clear provider data (test utility).
    async fn reset(&self);
    /// Enumerate known instances.
    async fn list_instances(&self) -> Vec<String>;
    /// Return a pretty-printed dump of all instances (test utility).
    async fn dump_all_pretty(&self) -> String;
    /// Create a new, empty instance. Errors if the instance already exists;
    /// that error satisfies `is_already_exists`.
    async fn create_instance(&self, instance: &str) -> Result<(), String>;
    /// Remove an existing instance and its history.
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;

    /// Enqueue a work item. Duplicates of a still-queued item are dropped
    /// unless the item is a raised event.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;
    /// Take the next visible item and hide it behind a lock token until ack/abandon.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;
    /// Permanently remove a locked item.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;
    /// Return a locked item to its queue at its original arrival position.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;
}

/// In-memory provider for tests.
pub mod in_memory;
/// Filesystem-backed provider for local development.
pub mod fs;
