use serde::Serialize;

use crate::Event;

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "runtimeStatus")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Queryable view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationState {
    pub name: Option<String>,
    #[serde(flatten)]
    pub status: OrchestrationStatus,
    pub custom_status: Option<String>,
}

/// Project history into a status. Read-only; latest custom status wins.
pub fn project(history: &[Event]) -> OrchestrationState {
    let mut name = None;
    let mut custom_status = None;
    let mut terminal = None;
    for e in history {
        match e {
            Event::OrchestrationStarted { name: n, .. } => name = Some(n.clone()),
            Event::CustomStatusSet { status, .. } => custom_status = Some(status.clone()),
            Event::OrchestrationCompleted { output } => {
                terminal.get_or_insert_with(|| OrchestrationStatus::Completed { output: output.clone() });
            }
            Event::OrchestrationFailed { error } => {
                terminal.get_or_insert_with(|| OrchestrationStatus::Failed { error: error.clone() });
            }
            Event::OrchestrationTerminated { reason } => {
                terminal.get_or_insert_with(|| OrchestrationStatus::Terminated { reason: reason.clone() });
            }
            _ => {}
        }
    }
    let status = match terminal {
        Some(t) => t,
        None if history.is_empty() => OrchestrationStatus::Pending,
        None => OrchestrationStatus::Running,
    };
    OrchestrationState {
        name,
        status,
        custom_status,
    }
}
