use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::notify::{colors, ApprovalPrompt, Notifier, PromptAction, SlackMessage};
use super::token::CallbackToken;
use crate::runtime::registry::ActivityRegistryBuilder;
use crate::runtime::{ActivityError, OrchestrationRegistryBuilder};
use crate::logging::LogLevel;
use crate::{durable_info, OrchestrationContext};

pub const RUN_APPROVAL_ORCHESTRATOR: &str = "RunApprovalOrchestrator";
pub const REQUEST_APPROVAL: &str = "RequestApproval";
pub const PROCESS_APPROVAL: &str = "ProcessApproval";
pub const ESCALATE: &str = "Escalate";

pub const APPROVAL_EVENT: &str = "ApprovalEvent";
pub const REJECTED_EVENT: &str = "RejectedEvent";

/// How long to wait for a human and how often to remind them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    pub timeout_secs: u64,
    /// Reminder rounds before giving up. Zero behaves as one.
    pub max_escalations: u32,
    pub prompt: String,
    pub image_url: Option<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_escalations: 1,
            prompt: "Is this picture fit to publish?".into(),
            image_url: None,
        }
    }
}

impl ApprovalPolicy {
    pub fn parse(input: &str) -> Result<Self, String> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::default());
        }
        serde_json::from_str(trimmed).map_err(|e| format!("invalid approval policy: {e}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    TimedOut,
}

/// Input of `RequestApproval`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub instance_id: String,
    pub text: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl ApprovalRequest {
    pub fn prompt(&self) -> ApprovalPrompt {
        ApprovalPrompt {
            text: self.text.clone(),
            image_url: self.image_url.clone(),
            actions: vec![
                PromptAction::danger("Reject", CallbackToken::new(&self.instance_id, REJECTED_EVENT)),
                PromptAction::primary("Approve", CallbackToken::new(&self.instance_id, APPROVAL_EVENT)),
            ],
        }
    }
}

/// Ask for approval, then race the answer against a reminder timer.
pub async fn run_approval(ctx: OrchestrationContext, policy: ApprovalPolicy) -> Result<ApprovalOutcome, String> {
    let request = ApprovalRequest {
        instance_id: ctx.instance_id(),
        text: policy.prompt.clone(),
        image_url: policy.image_url.clone(),
    };
    ctx.schedule_activity_typed(REQUEST_APPROVAL, &request)
        .into_activity()
        .await?;

    let rounds = policy.max_escalations.max(1);
    let mut escalations = 0;
    loop {
        let timer = ctx.schedule_timer(policy.timeout_secs.saturating_mul(1000));
        let timer_id = timer.correlation_id();
        let approved = ctx.schedule_wait(APPROVAL_EVENT);
        let rejected = ctx.schedule_wait(REJECTED_EVENT);
        let (winner, _) = ctx.select(vec![approved, rejected, timer]).await;
        let decision = match winner {
            0 => Some(true),
            1 => Some(false),
            _ => None,
        };
        if let Some(approved) = decision {
            ctx.cancel_timer(timer_id);
            durable_info!(ctx, approved, "approval decision received");
            ctx.schedule_activity_typed(PROCESS_APPROVAL, &approved)
                .into_activity()
                .await?;
            return Ok(if approved {
                ApprovalOutcome::Approved
            } else {
                ApprovalOutcome::Rejected
            });
        }

        escalations += 1;
        ctx.push_log(LogLevel::Warn, format!("approval timed out; escalation round {escalations}"));
        ctx.schedule_activity(ESCALATE, ctx.instance_id()).into_activity().await?;
        if escalations >= rounds {
            return Ok(ApprovalOutcome::TimedOut);
        }
    }
}

/// Activities that talk to the chat channel. `host` is the public host
/// name used for direct button links.
pub fn register_activities(
    builder: ActivityRegistryBuilder,
    notifier: Arc<dyn Notifier>,
    host: Option<String>,
) -> ActivityRegistryBuilder {
    let request_notifier = notifier.clone();
    let process_notifier = notifier.clone();
    builder
        .register_typed::<ApprovalRequest, (), _, _>(REQUEST_APPROVAL, move |request: ApprovalRequest| {
            let notifier = request_notifier.clone();
            let host = host.clone();
            async move {
                tracing::info!(instance = %request.instance_id, "requesting approval");
                let message = request.prompt().render(host.as_deref());
                notifier.send(&message).await.map_err(ActivityError::from)
            }
        })
        .register_typed::<bool, (), _, _>(PROCESS_APPROVAL, move |approved: bool| {
            let notifier = process_notifier.clone();
            async move {
                let (verdict, color) = if approved {
                    ("approved", colors::SUCCESS)
                } else {
                    ("rejected", colors::ERROR)
                };
                tracing::info!("process was {verdict}.");
                let message = SlackMessage::notification("Approval", format!("Picture was {verdict}"), color);
                notifier.send(&message).await.map_err(ActivityError::from)
            }
        })
        .register_typed::<String, (), _, _>(ESCALATE, move |instance: String| {
            let notifier = notifier.clone();
            async move {
                tracing::warn!(instance = %instance, "Escalate!!");
                let message = SlackMessage::notification(
                    "Reminder",
                    "Picture wasn't approved/rejected yet, this is a reminder..",
                    colors::WARNING,
                );
                notifier.send(&message).await.map_err(ActivityError::from)
            }
        })
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder.register(RUN_APPROVAL_ORCHESTRATOR, |ctx, input| async move {
        let policy = ApprovalPolicy::parse(&input)?;
        let outcome = run_approval(ctx, policy).await?;
        serde_json::to_string(&outcome).map_err(|e| e.to_string())
    })
}
