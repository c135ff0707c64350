use std::collections::HashSet;
use tracing::{debug, warn};

use super::dispatch::PendingWork;
use super::router::OrchestratorMsg;
use crate::providers::{QueueKind, WorkItem};
use crate::Event;

/// Fold one inbound message into the local history. Returns the message's
/// ack token and whether history changed.
pub fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg, now_ms: u64) -> (Option<String>, bool) {
    match msg {
        OrchestratorMsg::ActivityCompleted {
            instance,
            id,
            result,
            ack_token,
        } => {
            if !activity_pending(history, &instance, id) {
                return (ack_token, false);
            }
            history.push(Event::ActivityCompleted { id, result, at_ms: now_ms });
            (ack_token, true)
        }
        OrchestratorMsg::ActivityFailed {
            instance,
            id,
            error,
            ack_token,
        } => {
            if !activity_pending(history, &instance, id) {
                return (ack_token, false);
            }
            history.push(Event::ActivityFailed { id, error, at_ms: now_ms });
            (ack_token, true)
        }
        OrchestratorMsg::TimerFired {
            instance,
            id,
            fire_at_ms,
            ack_token,
        } => {
            let mut created = false;
            for e in history.iter() {
                match e {
                    Event::TimerCreated { id: cid, .. } if *cid == id => created = true,
                    Event::TimerFired { id: cid, .. } if *cid == id => return (ack_token, false),
                    Event::TimerCancelled { id: cid } if *cid == id => {
                        debug!(instance=%instance, id, "dropping fire of cancelled timer");
                        return (ack_token, false);
                    }
                    _ => {}
                }
            }
            if !created {
                warn!(instance=%instance, id, "dropping TimerFired for unknown timer");
                return (ack_token, false);
            }
            history.push(Event::TimerFired { id, fire_at_ms });
            (ack_token, true)
        }
        OrchestratorMsg::ExternalRaised {
            name, data, ack_token, ..
        } => {
            // Recorded whether or not a wait is currently pending
            history.push(Event::ExternalEvent { name, data, at_ms: now_ms });
            (ack_token, true)
        }
        OrchestratorMsg::Terminate { reason, ack_token, .. } => {
            if history.iter().any(Event::is_terminal) {
                return (ack_token, false);
            }
            history.push(Event::OrchestrationTerminated { reason });
            (ack_token, true)
        }
    }
}

fn activity_pending(history: &[Event], instance: &str, id: u64) -> bool {
    let mut scheduled = false;
    for e in history {
        match e {
            Event::ActivityScheduled { id: cid, .. } if *cid == id => scheduled = true,
            Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id => {
                return false;
            }
            _ => {}
        }
    }
    if !scheduled {
        warn!(instance=%instance, id, "dropping activity result for unknown id");
    }
    scheduled
}

/// Work for activities and timers that history shows as still outstanding.
/// Enqueued when an instance is first activated in this process.
pub fn pending_work(instance: &str, history: &[Event]) -> PendingWork {
    let mut work = PendingWork::new();
    let mut done_activities = HashSet::new();
    let mut done_timers = HashSet::new();
    for e in history {
        match e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => {
                done_activities.insert(*id);
            }
            Event::TimerFired { id, .. } | Event::TimerCancelled { id } => {
                done_timers.insert(*id);
            }
            _ => {}
        }
    }
    for e in history {
        let (kind, item) = match e {
            Event::ActivityScheduled { id, name, input } if !done_activities.contains(id) => (
                QueueKind::Worker,
                WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id: *id,
                    name: name.clone(),
                    input: input.clone(),
                },
            ),
            Event::TimerCreated { id, fire_at_ms } if !done_timers.contains(id) => (
                QueueKind::Timer,
                WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    id: *id,
                    fire_at_ms: *fire_at_ms,
                },
            ),
            _ => continue,
        };
        debug!(instance, ?item, "rehydrating pending work");
        work.push_back((kind, item));
    }
    work
}
