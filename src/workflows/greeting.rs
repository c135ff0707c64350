use serde::{Deserialize, Serialize};

use crate::runtime::registry::ActivityRegistryBuilder;
use crate::runtime::{ActivityError, OrchestrationRegistryBuilder};
use crate::{durable_info, durable_warn, OrchestrationContext};

pub const RUN_ORCHESTRATOR: &str = "RunOrchestrator";
pub const RUN_TIMER_ORCHESTRATOR: &str = "RunTimerOrchestrator";
pub const SAY_HELLO: &str = "FunctionSayHello";

/// Pauses between the greeting stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GreetingSchedule {
    pub first_pause_ms: u64,
    pub second_pause_ms: u64,
    pub final_pause_ms: u64,
}

impl Default for GreetingSchedule {
    fn default() -> Self {
        Self {
            first_pause_ms: 5_000,
            second_pause_ms: 5_000,
            final_pause_ms: 10_000,
        }
    }
}

impl GreetingSchedule {
    /// Empty or `null` input means the default schedule.
    pub fn parse(input: &str) -> Result<Self, String> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::default());
        }
        serde_json::from_str(trimmed).map_err(|e| format!("invalid greeting schedule: {e}"))
    }
}

pub fn say_hello(name: &str) -> String {
    format!("Hello {name}!")
}

/// Greet three cities with pauses in between, publishing progress as
/// custom status. With `chatty` set, stage transitions are logged through
/// the replay-safe macros.
pub async fn run_greeting(
    ctx: OrchestrationContext,
    schedule: GreetingSchedule,
    chatty: bool,
) -> Result<Vec<String>, String> {
    let mut outputs = Vec::with_capacity(3);
    if chatty {
        // not replay-gated: shows up once per pass, replays included
        tracing::warn!(instance = %ctx.instance_id(), turn_idx = ctx.turn_index(), "logging on every execution");
    }

    ctx.set_custom_status("first stage");
    outputs.push(ctx.schedule_activity(SAY_HELLO, "Tokyo").into_activity().await?);
    ctx.set_custom_status("first stage done");
    if chatty {
        durable_info!(ctx, "first stage done");
    }
    ctx.schedule_timer(schedule.first_pause_ms).into_timer().await;

    outputs.push(ctx.schedule_activity(SAY_HELLO, "Seattle").into_activity().await?);
    ctx.set_custom_status("second stage");
    ctx.schedule_timer(schedule.second_pause_ms).into_timer().await;
    ctx.set_custom_status("second stage trying");
    if chatty {
        durable_warn!(ctx, waited_ms = schedule.second_pause_ms, "second stage resumed after pause");
    }

    outputs.push(ctx.schedule_activity(SAY_HELLO, "London").into_activity().await?);
    ctx.set_custom_status("second stage done");
    ctx.schedule_timer(schedule.final_pause_ms).into_timer().await;
    ctx.set_custom_status("third stage");
    if chatty {
        durable_info!(ctx, greetings = outputs.len(), "third stage");
    }
    Ok(outputs)
}

pub fn register_activities(builder: ActivityRegistryBuilder) -> ActivityRegistryBuilder {
    builder.register_typed::<String, String, _, _>(SAY_HELLO, |name: String| async move {
        tracing::info!(name = %name, "Saying hello to {name}.");
        Ok::<_, ActivityError>(say_hello(&name))
    })
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder
        .register(RUN_ORCHESTRATOR, |ctx, input| async move {
            let schedule = GreetingSchedule::parse(&input)?;
            let outputs = run_greeting(ctx, schedule, false).await?;
            serde_json::to_string(&outputs).map_err(|e| e.to_string())
        })
        .register(RUN_TIMER_ORCHESTRATOR, |ctx, input| async move {
            let schedule = GreetingSchedule::parse(&input)?;
            let outputs = run_greeting(ctx, schedule, true).await?;
            serde_json::to_string(&outputs).map_err(|e| e.to_string())
        })
}
