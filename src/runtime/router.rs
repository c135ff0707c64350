use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Messages delivered to a live instance task by the orchestrator dispatcher.
/// `ack_token` is the peek-lock token of the originating queue item.
#[derive(Debug)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
        ack_token: Option<String>,
    },
    Terminate {
        instance: String,
        reason: String,
        ack_token: Option<String>,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::ExternalRaised { instance, .. }
            | OrchestratorMsg::Terminate { instance, .. } => instance,
        }
    }

    pub fn ack_token(&self) -> Option<&str> {
        match self {
            OrchestratorMsg::ActivityCompleted { ack_token, .. }
            | OrchestratorMsg::ActivityFailed { ack_token, .. }
            | OrchestratorMsg::TimerFired { ack_token, .. }
            | OrchestratorMsg::ExternalRaised { ack_token, .. }
            | OrchestratorMsg::Terminate { ack_token, .. } => ack_token.as_deref(),
        }
    }
}

pub fn kind_of(msg: &OrchestratorMsg) -> &'static str {
    match msg {
        OrchestratorMsg::ActivityCompleted { .. } => "ActivityCompleted",
        OrchestratorMsg::ActivityFailed { .. } => "ActivityFailed",
        OrchestratorMsg::TimerFired { .. } => "TimerFired",
        OrchestratorMsg::ExternalRaised { .. } => "ExternalRaised",
        OrchestratorMsg::Terminate { .. } => "Terminate",
    }
}

/// Per-instance inboxes. An instance is live in this process exactly while
/// its inbox is registered.
#[derive(Default)]
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    /// Deliver to a live instance. The message comes back when no inbox is
    /// registered or the receiving task is gone.
    pub async fn try_send(&self, msg: OrchestratorMsg) -> Result<(), OrchestratorMsg> {
        let key = msg.instance().to_string();
        let mut map = self.inboxes.lock().await;
        let Some(tx) = map.get(&key) else {
            return Err(msg);
        };
        match tx.send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(msg)) => {
                // Receiver dropped; remove stale sender so the dispatcher reactivates on redelivery
                map.remove(&key);
                warn!(instance=%key, kind=%kind_of(&msg), "router: receiver dropped, removing inbox");
                Err(msg)
            }
        }
    }
}
