use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::registry::{ActivityError, ActivityHandler, ActivityRegistry};
use super::replay::panic_message;
use super::Runtime;
use crate::providers::{QueueKind, WorkItem};

impl Runtime {
    /// Pull `ActivityExecute` items and run them concurrently, bounded by
    /// `max_concurrent_activities`. Each item is acked once its outcome is
    /// on the Orchestrator queue.
    pub(crate) fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let slots = Arc::new(Semaphore::new(self.options.max_concurrent_activities.max(1)));
            loop {
                let Ok(permit) = slots.clone().acquire_owned().await else {
                    return;
                };
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await else {
                    drop(permit);
                    tokio::time::sleep(self.options.poll_idle_sleep).await;
                    continue;
                };
                let (instance, id, name, input) = match item {
                    WorkItem::ActivityExecute { instance, id, name, input } => (instance, id, name, input),
                    other => {
                        error!(?other, "unexpected WorkItem in Worker dispatcher; discarding");
                        let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                        continue;
                    }
                };
                let rt = self.clone();
                let handler = activities.get(&name);
                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = match handler {
                        Some(h) => rt.execute_with_retry(&instance, id, &name, h, input).await,
                        None => Err(format!("unregistered:{name}")),
                    };
                    let completion = match outcome {
                        Ok(result) => WorkItem::ActivityCompleted {
                            instance: instance.clone(),
                            id,
                            result,
                        },
                        Err(error) => WorkItem::ActivityFailed {
                            instance: instance.clone(),
                            id,
                            error,
                        },
                    };
                    match rt.history_store.enqueue_work(QueueKind::Orchestrator, completion).await {
                        Ok(()) => {
                            let _ = rt.history_store.ack(QueueKind::Worker, &token).await;
                        }
                        Err(e) => {
                            error!(instance=%instance, id, error=%e, "failed to enqueue activity outcome");
                            let _ = rt.history_store.abandon(QueueKind::Worker, &token).await;
                        }
                    }
                });
            }
        })
    }

    /// Run one activity, retrying transient failures and timeouts per the
    /// configured policy. Application failures and panics return at once.
    async fn execute_with_retry(
        &self,
        instance: &str,
        id: u64,
        name: &str,
        handler: Arc<dyn ActivityHandler>,
        input: String,
    ) -> Result<String, String> {
        let policy = &self.options.activity_retry;
        let mut attempt: u32 = 1;
        loop {
            let h = handler.clone();
            let inp = input.clone();
            let mut task = tokio::spawn(async move { h.invoke(inp).await });
            let transient = match tokio::time::timeout(self.options.activity_timeout, &mut task).await {
                Ok(Ok(Ok(result))) => {
                    debug!(instance, id, name, attempt, "activity completed");
                    return Ok(result);
                }
                Ok(Ok(Err(ActivityError::Application(e)))) => return Err(e),
                Ok(Ok(Err(ActivityError::Transient(e)))) => e,
                Ok(Err(join_err)) if join_err.is_panic() => {
                    return Err(format!("activity panicked: {}", panic_message(join_err.into_panic().as_ref())));
                }
                Ok(Err(join_err)) => join_err.to_string(),
                Err(_elapsed) => {
                    task.abort();
                    format!("timed out after {}ms", self.options.activity_timeout.as_millis())
                }
            };
            if !policy.should_retry(attempt) {
                warn!(instance, id, name, attempt, error=%transient, "activity retries exhausted");
                return Err(format!("transient failure after {attempt} attempts: {transient}"));
            }
            let delay = policy.delay_for_attempt(attempt);
            warn!(instance, id, name, attempt, error=%transient, delay_ms = delay.as_millis() as u64, "transient activity failure; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
