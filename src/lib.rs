//! Deterministic, replay-driven orchestration core for the cloud scheduler.
//!
//! Workflow code is an ordinary `async fn` that receives an
//! [`OrchestrationContext`]. Every awaitable it creates takes the next
//! sequence position in call order, and history events carry the same
//! position. A replay pass walks the code from the top and fast-forwards
//! past every step whose completion is already recorded. It provides:
//!
//! - Public data model: [`Event`], [`Action`]
//! - Orchestration driver: [`run_turn`], [`run_turn_with`], [`run_turn_checked`] and [`Executor`]
//! - A unified [`DurableFuture`] that composes with `select`/`join`
//! - The in-process [`Runtime`], history providers, and the concrete workflows
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

pub mod config;
pub mod error;
pub mod futures;
pub mod http;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod workflows;

pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use error::RuntimeError;
pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus, Runtime};

use crate::_typed_codec::Codec;
use crate::futures::{Kind, KindTag};
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};

// Internal codec utilities for typed I/O
pub(crate) mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings travel unquoted so string and typed handlers interoperate
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(first) => serde_json::from_value(Value::String(s.to_string())).map_err(|_| first.to_string()),
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Scheduling variants and their completions share
/// the sequence position `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance was started by orchestration name with input. `started_at_ms`
    /// seeds the virtual clock.
    OrchestrationStarted {
        name: String,
        input: String,
        started_at_ms: u64,
    },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String },
    /// Orchestration failed with a final error.
    OrchestrationFailed { error: String },
    /// Instance was terminated from outside before it finished.
    OrchestrationTerminated { reason: String },

    /// Activity was scheduled at sequence position `id`.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String, at_ms: u64 },
    /// Activity failed permanently (application error or exhausted retries).
    ActivityFailed { id: u64, error: String, at_ms: u64 },

    /// Timer was created and will fire at `fire_at_ms`.
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// Timer fired.
    TimerFired { id: u64, fire_at_ms: u64 },
    /// Timer was abandoned by the orchestration; it never fires afterwards.
    TimerCancelled { id: u64 },

    /// An external event was raised for this instance.
    ExternalEvent { name: String, data: String, at_ms: u64 },

    /// Custom status recorded by the pass that first reached sequence position `id`.
    CustomStatusSet { id: u64, status: String },
}

impl Event {
    /// Sequence position of a scheduling-like event recorded by orchestration code.
    pub(crate) fn schedule_position(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. } | Event::TimerCreated { id, .. } | Event::CustomStatusSet { id, .. } => {
                Some(*id)
            }
            _ => None,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. } | Event::OrchestrationTerminated { .. }
        )
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Event::ActivityScheduled { name, input, .. } => format!("ActivityScheduled('{name}','{input}')"),
            Event::TimerCreated { fire_at_ms, .. } => format!("TimerCreated(fire_at_ms={fire_at_ms})"),
            Event::CustomStatusSet { status, .. } => format!("CustomStatusSet('{status}')"),
            other => format!("{other:?}"),
        }
    }
}

/// Declarative decisions produced by an orchestration turn. The runtime
/// materializes these into provider work items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Dispatch an activity invocation.
    CallActivity { id: u64, name: String, input: String },
    /// Arm a timer for an absolute fire time.
    CreateTimer { id: u64, fire_at_ms: u64 },
    /// The orchestration is waiting for an external event by name.
    WaitExternal { id: u64, name: String },
    /// Drop the wake-up of a timer that lost a race.
    CancelTimer { id: u64 },
}

/// Result of checking a sequence position against recorded history.
enum Slot {
    Free,
    Matches,
    Conflict(String),
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    history: Vec<Event>,
    actions: Vec<Action>,

    next_seq: u64,
    // position -> index into history for schedule events present when the pass began
    recorded: HashMap<u64, usize>,
    claimed_positions: HashSet<u64>,
    // history indexes of ExternalEvent entries already bound to a wait
    claimed_externals: HashSet<usize>,

    clock_ms: u64,
    replay_frontier: usize,
    replaying: bool,
    nondeterminism: Option<String>,

    turn_index: u64,
    log_buffer: Vec<(LogLevel, String)>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>, replay_frontier: usize) -> Self {
        let replay_frontier = replay_frontier.min(history.len());
        let recorded = history
            .iter()
            .enumerate()
            .filter_map(|(idx, e)| e.schedule_position().map(|id| (id, idx)))
            .collect();
        let clock_ms = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { started_at_ms, .. } => Some(*started_at_ms),
                _ => None,
            })
            .unwrap_or(0);
        let replaying = history[..replay_frontier]
            .iter()
            .any(|e| !matches!(e, Event::OrchestrationStarted { .. }));
        Self {
            instance,
            history,
            actions: Vec::new(),
            next_seq: 1,
            recorded,
            claimed_positions: HashSet::new(),
            claimed_externals: HashSet::new(),
            clock_ms,
            replay_frontier,
            replaying,
            nondeterminism: None,
            turn_index: 0,
            log_buffer: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_seq;
        self.next_seq += 1;
        id
    }

    fn record_action(&mut self, a: Action) {
        // A new decision means this pass is past the replayed prefix
        self.replaying = false;
        self.actions.push(a);
    }

    fn check_slot(&self, id: u64, expected: &str, matches: impl Fn(&Event) -> bool) -> Slot {
        match self.recorded.get(&id).map(|idx| &self.history[*idx]) {
            None => Slot::Free,
            Some(e) if matches(e) => Slot::Matches,
            Some(e) => Slot::Conflict(format!(
                "nondeterministic: sequence position {id} recorded {} but code issued {expected}",
                e.describe()
            )),
        }
    }

    fn flag_nondeterminism(&mut self, msg: String) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(msg);
        }
    }

    fn claim_position(&mut self, id: u64, slot: Slot) -> bool {
        self.claimed_positions.insert(id);
        match slot {
            Slot::Free => true,
            Slot::Matches => false,
            Slot::Conflict(msg) => {
                self.flag_nondeterminism(msg);
                false
            }
        }
    }

    /// Advance the virtual clock and replay flag after a completion is consumed.
    fn observe(&mut self, history_idx: usize, at_ms: u64) {
        self.clock_ms = self.clock_ms.max(at_ms);
        if history_idx >= self.replay_frontier {
            self.replaying = false;
        }
    }

    fn find_completion(&self, id: u64, tag: KindTag) -> Option<(usize, u64, DurableOutput)> {
        for (idx, e) in self.history.iter().enumerate() {
            match (tag, e) {
                (KindTag::Activity, Event::ActivityCompleted { id: cid, result, at_ms }) if *cid == id => {
                    return Some((idx, *at_ms, DurableOutput::Activity(Ok(result.clone()))));
                }
                (KindTag::Activity, Event::ActivityFailed { id: cid, error, at_ms }) if *cid == id => {
                    return Some((idx, *at_ms, DurableOutput::Activity(Err(error.clone()))));
                }
                (KindTag::Timer, Event::TimerFired { id: cid, fire_at_ms }) if *cid == id => {
                    return Some((idx, *fire_at_ms, DurableOutput::Timer));
                }
                _ => {}
            }
        }
        None
    }

    fn external_at(&self, idx: usize) -> Option<(u64, DurableOutput)> {
        match self.history.get(idx) {
            Some(Event::ExternalEvent { data, at_ms, .. }) => Some((*at_ms, DurableOutput::External(data.clone()))),
            _ => None,
        }
    }

    fn claim_external(&mut self, name: &str) -> Option<usize> {
        let idx = self.history.iter().enumerate().find_map(|(idx, e)| match e {
            Event::ExternalEvent { name: n, .. } if n == name && !self.claimed_externals.contains(&idx) => Some(idx),
            _ => None,
        })?;
        self.claimed_externals.insert(idx);
        Some(idx)
    }

    /// Recorded schedule events that the pass never reached again.
    fn unclaimed_positions(&self) -> Option<String> {
        let mut missing: Vec<(u64, usize)> = self
            .recorded
            .iter()
            .filter(|(id, _)| !self.claimed_positions.contains(id))
            .map(|(id, idx)| (*id, *idx))
            .collect();
        missing.sort_unstable();
        let (id, idx) = missing.first()?;
        Some(format!(
            "nondeterministic: history recorded {} at sequence position {id} but code did not issue it",
            self.history[*idx].describe()
        ))
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a context over an existing history. Everything already in
    /// `history` counts as replayed.
    pub fn new(history: Vec<Event>) -> Self {
        let frontier = history.len();
        Self::for_instance(String::new(), history, frontier)
    }

    /// Construct a context for `instance`; events at or after `replay_frontier`
    /// arrived since the previous turn.
    pub fn for_instance(instance: impl Into<String>, history: Vec<Event>, replay_frontier: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history, replay_frontier))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identifier of the instance this pass belongs to.
    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// Deterministic current time in milliseconds since the epoch: the start
    /// time, advanced by every completion this pass has consumed so far.
    pub fn utc_now_ms(&self) -> u64 {
        self.lock().clock_ms
    }

    /// True while the code is re-executing steps whose effects are already in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.lock().turn_index = idx;
    }

    /// Drain the buffered log messages accumulated during the last turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.lock().log_buffer)
    }
    /// Buffer a structured log message for the current turn; dropped while replaying.
    pub fn push_log(&self, level: LogLevel, msg: impl Into<String>) {
        let mut inner = self.lock();
        if !inner.replaying {
            inner.log_buffer.push((level, msg.into()));
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.lock();
        let id = inner.next_id();
        let slot = inner.check_slot(id, &format!("ActivityScheduled('{name}','{input}')"), |e| {
            matches!(e, Event::ActivityScheduled { name: n, input: i, .. } if n == &name && i == &input)
        });
        if inner.claim_position(id, slot) {
            inner.history.push(Event::ActivityScheduled {
                id,
                name: name.clone(),
                input: input.clone(),
            });
            inner.record_action(Action::CallActivity {
                id,
                name: name.clone(),
                input,
            });
        }
        drop(inner);
        DurableFuture(Kind::Activity {
            id,
            name,
            ctx: self.clone(),
        })
    }

    /// Typed helper that serializes input; pair with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        match _typed_codec::Json::encode(input) {
            Ok(payload) => self.schedule_activity(name, payload),
            Err(e) => {
                let name = name.into();
                panic!("failed to encode input for activity {name}: {e}")
            }
        }
    }

    /// Schedule a durable timer `delay_ms` after the virtual clock.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let mut inner = self.lock();
        let id = inner.next_id();
        let slot = inner.check_slot(id, "TimerCreated", |e| matches!(e, Event::TimerCreated { .. }));
        if inner.claim_position(id, slot) {
            let fire_at_ms = inner.clock_ms.saturating_add(delay_ms);
            inner.history.push(Event::TimerCreated { id, fire_at_ms });
            inner.record_action(Action::CreateTimer { id, fire_at_ms });
        }
        drop(inner);
        DurableFuture(Kind::Timer { id, ctx: self.clone() })
    }

    /// Wait for an external event by name. The first event of that name in
    /// history order that no other wait has bound resolves it.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let mut inner = self.lock();
        let id = inner.next_id();
        // Waits are never persisted, so any recorded schedule here is foreign
        let slot = inner.check_slot(id, &format!("WaitExternal('{name}')"), |_| false);
        inner.claim_position(id, slot);
        let claimed = inner.claim_external(&name);
        if claimed.is_none() {
            inner.actions.push(Action::WaitExternal { id, name: name.clone() });
        }
        drop(inner);
        DurableFuture(Kind::External {
            id,
            name,
            claimed,
            ctx: self.clone(),
        })
    }

    /// Record a custom status. Only the pass that first reaches this
    /// position appends it; replays skip it.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        let status: String = status.into();
        let mut inner = self.lock();
        let id = inner.next_id();
        let slot = inner.check_slot(id, &format!("CustomStatusSet('{status}')"), |e| {
            matches!(e, Event::CustomStatusSet { .. })
        });
        if inner.claim_position(id, slot) {
            inner.replaying = false;
            inner.history.push(Event::CustomStatusSet { id, status });
        }
    }

    /// Abandon a timer that lost a race. Its wake-up is dropped and no
    /// `TimerFired` is recorded afterwards. A timer that already fired is left alone.
    pub fn cancel_timer(&self, id: u64) {
        let mut inner = self.lock();
        let mut known = false;
        for e in &inner.history {
            match e {
                Event::TimerFired { id: tid, .. } | Event::TimerCancelled { id: tid } if *tid == id => return,
                Event::TimerCreated { id: tid, .. } if *tid == id => known = true,
                _ => {}
            }
        }
        if !known {
            return;
        }
        inner.history.push(Event::TimerCancelled { id });
        inner.record_action(Action::CancelTimer { id });
    }

    /// Deterministic select over two futures: returns (winner_index, DurableOutput)
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture(crate::futures::AggregateDurableFuture::new_select(self.clone(), vec![a, b]))
    }
    /// Deterministic select over N futures; the earliest completion in history wins.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(crate::futures::AggregateDurableFuture::new_select(self.clone(), futures))
    }
    /// Join over N futures; outputs are returned in argument order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture(crate::futures::AggregateDurableFuture::new_join(self.clone(), futures))
    }
}

fn poll_once<F: Future>(fut: std::pin::Pin<&mut F>) -> Poll<F::Output> {
    let w = ::futures::task::noop_waker();
    let mut cx = Context::from_waker(&w);
    fut.poll(&mut cx)
}

/// Everything a single replay pass produced.
pub(crate) struct TurnReport<O> {
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    pub logs: Vec<(LogLevel, String)>,
    pub output: Option<O>,
    pub nondeterminism: Option<String>,
}

pub(crate) fn run_turn_report<O, F>(
    ctx: OrchestrationContext,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnReport<O>
where
    F: Future<Output = O>,
{
    let fut = orchestrator(ctx.clone());
    let mut fut = std::pin::pin!(fut);
    let output = match poll_once(fut.as_mut()) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let mut inner = ctx.lock();
    if inner.nondeterminism.is_none() {
        if let Some(msg) = inner.unclaimed_positions() {
            inner.nondeterminism = Some(msg);
        }
    }
    let nondeterminism = inner.nondeterminism.clone();
    let history = inner.history.clone();
    drop(inner);
    let actions = ctx.take_actions();
    let logs = ctx.take_log_buffer();
    TurnReport {
        history,
        actions,
        logs,
        // A nondeterministic pass never reports an output
        output: if nondeterminism.is_some() { None } else { output },
        nondeterminism,
    }
}

/// Tuple returned by `run_turn` and `run_turn_with` containing the updated
/// history, actions to execute, per-turn logs, and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Poll the orchestrator once against `history`.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, orchestrator)
}

/// Same as `run_turn` but annotates the context with a caller-supplied
/// turn index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let r = run_turn_report(ctx, orchestrator);
    (r.history, r.actions, r.logs, r.output)
}

/// Like `run_turn`, but fails when the code diverges from recorded history.
pub fn run_turn_checked<O, F>(
    history: Vec<Event>,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> Result<TurnResult<O>, runtime::replay::ReplayError>
where
    F: Future<Output = O>,
{
    let r = run_turn_report(OrchestrationContext::new(history), orchestrator);
    match r.nondeterminism {
        Some(msg) => Err(runtime::replay::ReplayError::NonDeterminism(msg)),
        None => Ok((r.history, r.actions, r.logs, r.output)),
    }
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// the provided `execute_actions` to materialize requested actions into
    /// history, until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let (hist_after_replay, actions, _logs, output) = run_turn(history, &orchestrator);
            history = hist_after_replay;
            if let Some(out) = output {
                return (history, out);
            }
            execute_actions(actions, &mut history);
        }
    }
}
