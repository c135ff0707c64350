//! The hosted workflows: a staged greeting and a human approval loop.

pub mod approval;
pub mod greeting;
pub mod notify;
pub mod token;

use std::sync::Arc;

use crate::runtime::{ActivityRegistry, OrchestrationRegistry};
use notify::Notifier;

/// Every activity the workflows call, wired to `notifier`.
pub fn activities(notifier: Arc<dyn Notifier>, host: Option<String>) -> ActivityRegistry {
    let builder = greeting::register_activities(ActivityRegistry::builder());
    approval::register_activities(builder, notifier, host).build()
}

pub fn orchestrations() -> OrchestrationRegistry {
    let builder = greeting::register_orchestrations(OrchestrationRegistry::builder());
    approval::register_orchestrations(builder).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_workflows_registered() {
        assert_eq!(
            orchestrations().list_orchestration_names(),
            vec![
                approval::RUN_APPROVAL_ORCHESTRATOR,
                greeting::RUN_ORCHESTRATOR,
                greeting::RUN_TIMER_ORCHESTRATOR
            ]
        );
        let acts = activities(Arc::new(notify::RecordingNotifier::default()), None);
        for name in [
            greeting::SAY_HELLO,
            approval::REQUEST_APPROVAL,
            approval::PROCESS_APPROVAL,
            approval::ESCALATE,
        ] {
            assert!(acts.get(name).is_some(), "missing {name}");
        }
    }
}
