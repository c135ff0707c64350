use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::Action;

/// Work still owed to the provider queues for recorded history.
pub type PendingWork = VecDeque<(QueueKind, WorkItem)>;

/// Materialize the actions of one turn into provider work items. History
/// for the turn must already be persisted.
pub fn work_for_actions(instance: &str, actions: Vec<Action>) -> PendingWork {
    let mut work = PendingWork::new();
    for action in actions {
        let entry = match action {
            Action::CallActivity { id, name, input } => {
                debug!(instance, id, name=%name, "dispatching activity");
                (
                    QueueKind::Worker,
                    WorkItem::ActivityExecute {
                        instance: instance.to_string(),
                        id,
                        name,
                        input,
                    },
                )
            }
            Action::CreateTimer { id, fire_at_ms } => {
                debug!(instance, id, fire_at_ms, "arming timer");
                (
                    QueueKind::Timer,
                    WorkItem::TimerSchedule {
                        instance: instance.to_string(),
                        id,
                        fire_at_ms,
                    },
                )
            }
            Action::CancelTimer { id } => {
                debug!(instance, id, "cancelling timer");
                (
                    QueueKind::Timer,
                    WorkItem::TimerCancel {
                        instance: instance.to_string(),
                        id,
                    },
                )
            }
            Action::WaitExternal { id, name } => {
                // Nothing to dispatch; the raised event is routed by name
                debug!(instance, id, name=%name, "waiting for external event");
                continue;
            }
        };
        work.push_back(entry);
    }
    work
}

/// Enqueue pending work front to back. Items leave `pending` only once the
/// store accepted them, so a failed call can be retried with what is left.
pub async fn enqueue_pending(store: &Arc<dyn HistoryStore>, pending: &mut PendingWork) -> Result<(), String> {
    while let Some((kind, item)) = pending.front() {
        store.enqueue_work(*kind, item.clone()).await?;
        pending.pop_front();
    }
    Ok(())
}
