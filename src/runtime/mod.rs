use crate::_typed_codec::{Codec, Json};
use crate::error::RuntimeError;
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{Event, OrchestrationContext};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod dispatch;
pub mod options;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod router;
pub mod status;
mod timers;
mod worker;

pub use options::RuntimeOptions;
pub use registry::{ActivityError, ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use retry::RetryPolicy;
pub use router::{InstanceRouter, OrchestratorMsg};
pub use status::{OrchestrationState, OrchestrationStatus};

use replay::{ReplayEngine as _, ReplayError};

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for orchestration")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

type ResultWaiter = oneshot::Sender<(Vec<Event>, Result<String, String>)>;

/// What to do with the peek-lock tokens still sitting in an inbox that is being closed.
#[derive(Clone, Copy)]
enum Leftovers {
    Ack,
    Abandon,
}

/// In-process runtime that executes activities and timers and persists
/// history via a `HistoryStore`.
pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) history_store: Arc<dyn HistoryStore>,
    // std mutexes: released from Drop without awaiting
    active_instances: std::sync::Mutex<HashSet<String>>,
    rehydrated: std::sync::Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<ResultWaiter>>>,
    orchestration_registry: OrchestrationRegistry,
    pub(crate) options: RuntimeOptions,
}

fn lock_set(m: &std::sync::Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Final result recorded in history, if any.
fn terminal_result(history: &[Event]) -> Option<Result<String, String>> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationCompleted { output } => Some(Ok(output.clone())),
        Event::OrchestrationFailed { error } => Some(Err(error.clone())),
        Event::OrchestrationTerminated { reason } => Some(Err(format!("terminated: {reason}"))),
        _ => None,
    })
}

impl Runtime {
    const POLLER_GATE_DELAY_MS: u64 = 5;

    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(history_store, activity_registry, orchestration_registry, RuntimeOptions::default()).await
    }

    /// Start a runtime with explicit tunables. Instances the store still
    /// holds unfinished are resumed in the background.
    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            router: Arc::new(InstanceRouter::default()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: std::sync::Mutex::new(HashSet::new()),
            rehydrated: std::sync::Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            orchestration_registry,
            options,
        });

        let mut joins = vec![
            runtime.clone().start_orchestration_dispatcher(),
            runtime.clone().start_work_dispatcher(activity_registry),
        ];
        joins.extend(runtime.clone().start_timer_dispatcher());

        let resume = runtime.clone();
        joins.push(tokio::spawn(async move {
            for instance in resume.history_store.list_instances().await {
                let history = resume.history_store.read(&instance).await;
                if !history.is_empty() && terminal_result(&history).is_none() {
                    debug!(instance=%instance, "resuming unfinished instance");
                    resume.ensure_instance_active(&instance).await;
                }
            }
        }));

        runtime.joins.lock().await.extend(joins);
        runtime
    }

    /// The store backing this runtime.
    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        self.history_store.clone()
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await else {
                    tokio::time::sleep(self.options.poll_idle_sleep).await;
                    continue;
                };
                let ack_token = Some(token.clone());
                let msg = match item {
                    WorkItem::ActivityCompleted { instance, id, result } => OrchestratorMsg::ActivityCompleted {
                        instance,
                        id,
                        result,
                        ack_token,
                    },
                    WorkItem::ActivityFailed { instance, id, error } => OrchestratorMsg::ActivityFailed {
                        instance,
                        id,
                        error,
                        ack_token,
                    },
                    WorkItem::TimerFired { instance, id, fire_at_ms } => OrchestratorMsg::TimerFired {
                        instance,
                        id,
                        fire_at_ms,
                        ack_token,
                    },
                    WorkItem::ExternalRaised { instance, name, data } => OrchestratorMsg::ExternalRaised {
                        instance,
                        name,
                        data,
                        ack_token,
                    },
                    WorkItem::TerminateInstance { instance, reason } => OrchestratorMsg::Terminate {
                        instance,
                        reason,
                        ack_token,
                    },
                    other => {
                        error!(?other, "unexpected WorkItem in Orchestrator dispatcher; discarding");
                        let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                        continue;
                    }
                };
                self.deliver_or_activate(msg, token).await;
            }
        })
    }

    /// Forward to the live instance, or activate it and put the item back
    /// for redelivery. Items for unknown or finished instances are dropped.
    async fn deliver_or_activate(self: &Arc<Self>, msg: OrchestratorMsg, token: String) {
        let Err(msg) = self.router.try_send(msg).await else {
            return;
        };
        let instance = msg.instance().to_string();
        let history = self.history_store.read(&instance).await;
        if history.is_empty() {
            warn!(instance=%instance, kind=%router::kind_of(&msg), "dropping message for unknown instance");
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }
        if terminal_result(&history).is_some() {
            debug!(instance=%instance, kind=%router::kind_of(&msg), "dropping message for finished instance");
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }
        self.ensure_instance_active(&instance).await;
        let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
        tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let (svc_jh, svc_tx) = timers::TimerService::start(self.history_store.clone(), self.options.poll_idle_sleep);
        // Intake: move schedules and cancellations from the durable queue into the service
        let intake = tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Timer).await else {
                    tokio::time::sleep(self.options.poll_idle_sleep).await;
                    continue;
                };
                match item {
                    WorkItem::TimerSchedule { .. } | WorkItem::TimerCancel { .. } => {
                        if svc_tx.send(item).is_err() {
                            let _ = self.history_store.abandon(QueueKind::Timer, &token).await;
                            return;
                        }
                    }
                    other => error!(?other, "unexpected WorkItem in Timer dispatcher; discarding"),
                }
                let _ = self.history_store.ack(QueueKind::Timer, &token).await;
            }
        });
        vec![svc_jh, intake]
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str) -> bool {
        if !lock_set(&self.active_instances).insert(instance.to_string()) {
            return false;
        }
        let inbox = self.router.register(instance).await;
        let rt = self.clone();
        let inst = instance.to_string();
        let handle = tokio::spawn(async move { rt.run_instance(inst, inbox).await });
        let mut joins = self.instance_joins.lock().await;
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
        true
    }

    async fn start_internal(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: String,
        waiter: Option<ResultWaiter>,
    ) -> Result<(), RuntimeError> {
        if !self.orchestration_registry.contains(orchestration_name) {
            return Err(RuntimeError::UnknownOrchestration(orchestration_name.to_string()));
        }
        if self.history_store.exists(instance).await {
            return Err(RuntimeError::InstanceAlreadyExists(instance.to_string()));
        }
        if let Err(e) = self.history_store.create_instance(instance).await {
            // a concurrent start of the same id won the race
            if crate::providers::is_already_exists(&e) {
                return Err(RuntimeError::InstanceAlreadyExists(instance.to_string()));
            }
            return Err(RuntimeError::Store(e));
        }
        let started = Event::OrchestrationStarted {
            name: orchestration_name.to_string(),
            input,
            started_at_ms: timers::now_ms(),
        };
        if let Err(e) = self.history_store.append(instance, vec![started]).await {
            let _ = self.history_store.remove_instance(instance).await;
            return Err(RuntimeError::Store(format!("failed to append OrchestrationStarted: {e}")));
        }
        if let Some(tx) = waiter {
            self.result_waiters
                .lock()
                .await
                .entry(instance.to_string())
                .or_default()
                .push(tx);
        }
        self.ensure_instance_active(instance).await;
        info!(instance, orchestration = orchestration_name, "started orchestration");
        Ok(())
    }

    /// Create an instance and start running it without holding on to its result.
    pub async fn start_instance(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        self.start_internal(instance, orchestration_name, input.into(), None).await
    }

    /// Start an orchestration using raw String input/output.
    pub async fn start_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<(Vec<Event>, Result<String, String>)>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.start_internal(instance, orchestration_name, input.into(), Some(tx))
            .await?;
        Ok(tokio::spawn(async move {
            rx.await
                .unwrap_or_else(|_| (Vec::new(), Err("runtime stopped before the instance finished".to_string())))
        }))
    }

    /// Start a typed orchestration; input/output are serialized internally.
    pub async fn start_orchestration_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, RuntimeError>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = Json::encode(&input).map_err(RuntimeError::Codec)?;
        let handle = self.start_orchestration(instance, orchestration_name, payload).await?;
        Ok(tokio::spawn(async move {
            let (hist, res_s) = match handle.await {
                Ok(done) => done,
                Err(e) => (Vec::new(), Err(e.to_string())),
            };
            let res_t = res_s.and_then(|s| Json::decode::<Out>(&s));
            (hist, res_t)
        }))
    }

    /// Abort background tasks and every live instance task.
    pub async fn shutdown(self: Arc<Self>) {
        for j in self.joins.lock().await.drain(..) {
            j.abort();
        }
        for j in self.instance_joins.lock().await.drain(..) {
            j.abort();
        }
        self.router.inboxes.lock().await.clear();
    }

    /// Await completion of all outstanding spawned orchestration instances.
    pub async fn drain_instances(self: Arc<Self>) {
        let joins: Vec<JoinHandle<()>> = self.instance_joins.lock().await.drain(..).collect();
        ::futures::future::join_all(joins).await;
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], result: &Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), result.clone()));
            }
        }
    }

    /// Whether someone still awaits this instance's result. Dropped receivers are pruned.
    async fn has_live_waiters(&self, instance: &str) -> bool {
        let mut waiters = self.result_waiters.lock().await;
        let live = waiters
            .get_mut(instance)
            .map(|v| {
                v.retain(|tx| !tx.is_closed());
                !v.is_empty()
            })
            .unwrap_or(false);
        if !live {
            waiters.remove(instance);
        }
        live
    }

    /// Detach the inbox from the router and settle the tokens of anything still queued in it.
    async fn release_inbox(&self, instance: &str, mut inbox: mpsc::UnboundedReceiver<OrchestratorMsg>, leftovers: Leftovers) {
        self.router.unregister(instance).await;
        inbox.close();
        let mut tokens = Vec::new();
        while let Ok(msg) = inbox.try_recv() {
            if let Some(t) = msg.ack_token() {
                tokens.push(t.to_string());
            }
        }
        match leftovers {
            Leftovers::Ack => {
                for t in tokens {
                    let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
                }
            }
            Leftovers::Abandon => {
                // the store restores each item at its arrival position
                for t in tokens {
                    let _ = self.history_store.abandon(QueueKind::Orchestrator, &t).await;
                }
            }
        }
    }

    /// Back off after the store rejected an append. The instance lets go of
    /// its inbox; redelivery of the abandoned messages reactivates it.
    async fn back_off_after_store_failure(
        &self,
        instance: &str,
        tokens: Vec<String>,
        inbox: mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) {
        for t in tokens {
            let _ = self.history_store.abandon(QueueKind::Orchestrator, &t).await;
        }
        self.release_inbox(instance, inbox, Leftovers::Abandon).await;
        tokio::time::sleep(self.options.store_retry_delay).await;
    }

    /// Settle a finished instance: wake waiters, ack whatever is still queued
    /// for it and forget its rehydration mark.
    async fn finish(
        &self,
        instance: &str,
        history: &[Event],
        result: &Result<String, String>,
        inbox: mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) {
        self.notify_waiters(instance, history, result).await;
        self.release_inbox(instance, inbox, Leftovers::Ack).await;
        lock_set(&self.rehydrated).remove(instance);
    }

    /// Hand work promised by recorded history to the provider queues. Replay
    /// will not ask for it again, so a rejected enqueue is retried with
    /// backoff until the store takes it.
    async fn enqueue_with_retry(&self, instance: &str, mut pending: dispatch::PendingWork) {
        let mut attempt: u32 = 0;
        while let Err(e) = dispatch::enqueue_pending(&self.history_store, &mut pending).await {
            attempt = attempt.saturating_add(1);
            let delay = self.options.store_retry_delay * 2u32.pow(attempt.min(6) - 1);
            warn!(instance, attempt, remaining = pending.len(), error=%e, "store rejected dispatched work; retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// Drive one activation of an instance: replay, persist, dispatch, and
    /// fold inbound completions until the instance finishes or goes idle.
    async fn run_instance(self: Arc<Self>, instance: String, inbox: mpsc::UnboundedReceiver<OrchestratorMsg>) {
        struct ActiveGuard {
            rt: Arc<Runtime>,
            inst: String,
        }
        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                lock_set(&self.rt.active_instances).remove(&self.inst);
            }
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.clone(),
        };
        let mut inbox = inbox;
        let mut history = self.history_store.read(&instance).await;

        if let Some(result) = terminal_result(&history) {
            self.finish(&instance, &history, &result, inbox).await;
            return;
        }
        let Some((orchestration_name, input)) = history.iter().find_map(|e| match e {
            Event::OrchestrationStarted { name, input, .. } => Some((name.clone(), input.clone())),
            _ => None,
        }) else {
            warn!(instance=%instance, "activation without OrchestrationStarted; releasing");
            self.release_inbox(&instance, inbox, Leftovers::Abandon).await;
            return;
        };

        if lock_set(&self.rehydrated).insert(instance.clone()) {
            self.enqueue_with_retry(&instance, completions::pending_work(&instance, &history))
                .await;
        }

        let Some(handler) = self.orchestration_registry.get(&orchestration_name) else {
            let err = format!("unregistered:{orchestration_name}");
            error!(instance=%instance, error=%err, "orchestration not registered");
            let failed = Event::OrchestrationFailed { error: err.clone() };
            if let Err(e) = self.history_store.append(&instance, vec![failed.clone()]).await {
                error!(instance=%instance, error=%e, "failed to append OrchestrationFailed");
                self.back_off_after_store_failure(&instance, Vec::new(), inbox).await;
                return;
            }
            history.push(failed);
            self.finish(&instance, &history, &Err(err), inbox).await;
            return;
        };

        let engine = replay::DefaultReplayEngine::new();
        let mut replay_frontier = history.len();
        let mut turn_index: u64 = 0;
        loop {
            let baseline_len = history.len();
            let outcome = engine.replay(
                &instance,
                history,
                replay_frontier,
                turn_index,
                handler.clone(),
                input.clone(),
            );
            crate::logging::flush(&instance, turn_index, outcome.logs);
            history = outcome.history;

            // A divergent pass records nothing but the failure
            let terminal = match (outcome.nondeterminism, outcome.output) {
                (Some(ReplayError::NonDeterminism(msg)), _) => {
                    error!(instance=%instance, turn_index, error=%msg, "nondeterministic orchestration; failing instance");
                    history.truncate(baseline_len);
                    Some(Err(msg))
                }
                (None, out) => out,
            };

            let mut deltas = history[baseline_len..].to_vec();
            if let Some(result) = terminal {
                let term = match &result {
                    Ok(output) => Event::OrchestrationCompleted { output: output.clone() },
                    Err(error) => Event::OrchestrationFailed { error: error.clone() },
                };
                deltas.push(term.clone());
                if let Err(e) = self.history_store.append(&instance, deltas).await {
                    error!(instance=%instance, turn_index, error=%e, "failed to append final turn events");
                    self.back_off_after_store_failure(&instance, Vec::new(), inbox).await;
                    return;
                }
                history.push(term);
                debug!(instance=%instance, turn_index, ok = result.is_ok(), "orchestration finished");
                self.finish(&instance, &history, &result, inbox).await;
                return;
            }

            if !deltas.is_empty() {
                if let Err(e) = self.history_store.append(&instance, deltas).await {
                    error!(instance=%instance, turn_index, error=%e, "failed to append scheduled events");
                    self.back_off_after_store_failure(&instance, Vec::new(), inbox).await;
                    return;
                }
            }
            self.enqueue_with_retry(&instance, dispatch::work_for_actions(&instance, outcome.actions))
                .await;

            // Receive at least one message, or dehydrate on idle timeout
            let first = loop {
                let next = tokio::time::timeout(self.options.idle_dehydrate, inbox.recv()).await;
                match next {
                    Ok(Some(msg)) => break msg,
                    Ok(None) => return,
                    Err(_idle) => {
                        if self.has_live_waiters(&instance).await {
                            continue;
                        }
                        debug!(instance=%instance, "dehydrating idle instance");
                        self.release_inbox(&instance, inbox, Leftovers::Abandon).await;
                        return;
                    }
                }
            };

            let len_before = history.len();
            let mut tokens: Vec<String> = Vec::new();
            let now = timers::now_ms();
            let (t, _) = completions::append_completion(&mut history, first, now);
            tokens.extend(t);
            for _ in 0..self.options.completion_batch_limit {
                if matches!(history.last(), Some(Event::OrchestrationTerminated { .. })) {
                    break;
                }
                match inbox.try_recv() {
                    Ok(msg) => {
                        let (t, _) = completions::append_completion(&mut history, msg, now);
                        tokens.extend(t);
                    }
                    Err(_) => break,
                }
            }

            if history.len() > len_before {
                if let Err(e) = self.history_store.append(&instance, history[len_before..].to_vec()).await {
                    error!(instance=%instance, turn_index, error=%e, "failed to append completions");
                    self.back_off_after_store_failure(&instance, tokens, inbox).await;
                    return;
                }
            }
            for t in tokens {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }

            if let Some(Event::OrchestrationTerminated { reason }) = history.last() {
                info!(instance=%instance, reason=%reason, "instance terminated");
                let result = Err(format!("terminated: {reason}"));
                self.finish(&instance, &history, &result, inbox).await;
                return;
            }

            replay_frontier = len_before;
            turn_index = turn_index.saturating_add(1);
        }
    }
}

impl Runtime {
    /// Raise an external event by name into a running instance. Unknown and
    /// finished instances are rejected without touching any history.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        let data = data.into();
        self.require_running(instance).await?;
        self.history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name.clone(),
                    data,
                },
            )
            .await
            .map_err(RuntimeError::Store)?;
        info!(instance, event_name=%name, "raise_event: enqueued external");
        Ok(())
    }

    /// Stop a running instance. It ends with `Terminated` status and its
    /// outstanding activities and timers are ignored.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), RuntimeError> {
        self.require_running(instance).await?;
        self.history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await
            .map_err(RuntimeError::Store)
    }

    async fn require_running(&self, instance: &str) -> Result<(), RuntimeError> {
        let history = self.history_store.read(instance).await;
        if history.is_empty() || terminal_result(&history).is_some() {
            return Err(RuntimeError::UnknownInstance(instance.to_string()));
        }
        Ok(())
    }

    /// Current projected state. Unknown instances are an error.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationState, RuntimeError> {
        if !self.history_store.exists(instance).await {
            return Err(RuntimeError::UnknownInstance(instance.to_string()));
        }
        Ok(status::project(&self.history_store.read(instance).await))
    }

    /// Wait until the orchestration reaches a terminal state or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            if let Ok(state) = self.get_orchestration_status(instance).await {
                if state.status.is_terminal() {
                    return Ok(state.status);
                }
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms.saturating_mul(2)).min(100);
        }
    }

    /// Typed variant: returns Ok(Ok<T>) on Completed with decoded output, Ok(Err(String)) otherwise.
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => match Json::decode::<Out>(&output) {
                Ok(v) => Ok(Ok(v)),
                Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
            },
            OrchestrationStatus::Failed { error } => Ok(Err(error)),
            OrchestrationStatus::Terminated { reason } => Ok(Err(format!("terminated: {reason}"))),
            other => Err(WaitError::Other(format!("unexpected non-terminal status {other:?}"))),
        }
    }
}
