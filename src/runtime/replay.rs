use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::logging::LogLevel;
use crate::runtime::OrchestrationHandler;
use crate::{Action, Event, OrchestrationContext};

/// Replay diverged from recorded history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("{0}")]
    NonDeterminism(String),
}

/// Result of one replay pass over an instance's history.
#[derive(Debug)]
pub struct TurnOutcome {
    /// History including any schedule events this pass recorded.
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    pub logs: Vec<(LogLevel, String)>,
    /// `Some` once the orchestration function returned (or panicked).
    pub output: Option<Result<String, String>>,
    pub nondeterminism: Option<ReplayError>,
}

pub trait ReplayEngine: Send + Sync {
    /// Run the orchestration from the top against `history`. Events at or
    /// after `replay_frontier` arrived since the previous turn.
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        replay_frontier: usize,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome;
}

#[derive(Default)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        replay_frontier: usize,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome {
        let ctx = OrchestrationContext::for_instance(instance, history.clone(), replay_frontier);
        ctx.set_turn_index(turn_index);
        let run = std::panic::catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn_report(ctx, |ctx| async move { handler.invoke(ctx, input).await })
        }));
        match run {
            Ok(r) => TurnOutcome {
                history: r.history,
                actions: r.actions,
                logs: r.logs,
                output: r.output,
                nondeterminism: r.nondeterminism.map(ReplayError::NonDeterminism),
            },
            Err(payload) => TurnOutcome {
                history,
                actions: Vec::new(),
                logs: Vec::new(),
                output: Some(Err(format!("orchestration panicked: {}", panic_message(payload.as_ref())))),
                nondeterminism: None,
            },
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
