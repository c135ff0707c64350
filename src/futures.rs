use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::_typed_codec::{Codec, Json};
use crate::{CtxInner, OrchestrationContext};

/// Output of a `DurableFuture` when awaited via unified composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
}

/// A unified future for activities, timers, and external events that carries
/// its sequence position. Compose with `ctx.select`/`ctx.join`.
pub struct DurableFuture(pub(crate) Kind);

pub(crate) enum Kind {
    Activity {
        id: u64,
        name: String,
        ctx: OrchestrationContext,
    },
    Timer {
        id: u64,
        ctx: OrchestrationContext,
    },
    External {
        id: u64,
        name: String,
        // index of the bound ExternalEvent in history
        claimed: Option<usize>,
        ctx: OrchestrationContext,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KindTag {
    Activity,
    Timer,
}

impl DurableFuture {
    /// Sequence position of the underlying operation. Timers pass this to
    /// `OrchestrationContext::cancel_timer` once they lose a race.
    pub fn correlation_id(&self) -> u64 {
        match &self.0 {
            Kind::Activity { id, .. } | Kind::Timer { id, .. } | Kind::External { id, .. } => *id,
        }
    }

    fn ctx(&self) -> &OrchestrationContext {
        match &self.0 {
            Kind::Activity { ctx, .. } | Kind::Timer { ctx, .. } | Kind::External { ctx, .. } => ctx,
        }
    }

    /// Look up the completion without consuming it: (history index, time, output).
    fn peek_completion(&self, inner: &CtxInner) -> Option<(usize, u64, DurableOutput)> {
        match &self.0 {
            Kind::Activity { id, .. } => inner.find_completion(*id, KindTag::Activity),
            Kind::Timer { id, .. } => inner.find_completion(*id, KindTag::Timer),
            Kind::External { claimed, .. } => {
                let idx = (*claimed)?;
                inner.external_at(idx).map(|(at, out)| (idx, at, out))
            }
        }
    }

    fn release(&mut self, inner: &mut CtxInner) {
        if let Kind::External { claimed, .. } = &mut self.0 {
            if let Some(idx) = claimed.take() {
                inner.claimed_externals.remove(&idx);
            }
        }
    }

    fn describe(&self) -> String {
        match &self.0 {
            Kind::Activity { id, name, .. } => format!("activity '{name}' (#{id})"),
            Kind::Timer { id, .. } => format!("timer #{id}"),
            Kind::External { id, name, .. } => format!("external '{name}' (#{id})"),
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx().lock();
        if inner.nondeterminism.is_some() {
            return Poll::Pending;
        }
        match this.peek_completion(&inner) {
            Some((idx, at_ms, out)) => {
                inner.observe(idx, at_ms);
                Poll::Ready(out)
            }
            None => Poll::Pending,
        }
    }
}

impl DurableFuture {
    /// Await an activity result as a raw String.
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> + Send {
        let what = self.describe();
        async move {
            match self.await {
                DurableOutput::Activity(v) => v,
                other => panic!("into_activity used on {what}: {other:?}"),
            }
        }
    }

    /// Await an activity result decoded to a typed value.
    pub fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> + Send {
        let fut = self.into_activity();
        async move {
            let s = fut.await?;
            Json::decode::<Out>(&s)
        }
    }

    /// Resolves when the corresponding timer fires.
    pub fn into_timer(self) -> impl Future<Output = ()> + Send {
        let what = self.describe();
        async move {
            match self.await {
                DurableOutput::Timer => (),
                other => panic!("into_timer used on {what}: {other:?}"),
            }
        }
    }

    /// Resolves with the payload of the bound external event.
    pub fn into_event(self) -> impl Future<Output = String> + Send {
        let what = self.describe();
        async move {
            match self.await {
                DurableOutput::External(v) => v,
                other => panic!("into_event used on {what}: {other:?}"),
            }
        }
    }

    /// Await an external event decoded to a typed value.
    pub async fn into_event_typed<T: serde::de::DeserializeOwned>(self) -> Result<T, String> {
        Json::decode::<T>(&self.into_event().await)
    }
}

enum AggregateMode {
    Select,
    Join,
}

pub struct AggregateDurableFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    mode: AggregateMode,
}

enum AggregateOutput {
    Select { winner_index: usize, output: DurableOutput },
    Join { outputs: Vec<DurableOutput> },
}

impl AggregateDurableFuture {
    pub(crate) fn new_select(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Select,
        }
    }

    pub(crate) fn new_join(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Join,
        }
    }

    fn poll_aggregate(&mut self) -> Poll<AggregateOutput> {
        let mut inner = self.ctx.lock();
        if inner.nondeterminism.is_some() {
            return Poll::Pending;
        }
        match self.mode {
            AggregateMode::Select => {
                // Winner is the ready child whose completion sits earliest in history
                let winner = self
                    .children
                    .iter()
                    .enumerate()
                    .filter_map(|(i, c)| c.peek_completion(&inner).map(|(idx, at, out)| (idx, i, at, out)))
                    .min_by_key(|(idx, ..)| *idx);
                let Some((idx, winner_index, at_ms, output)) = winner else {
                    return Poll::Pending;
                };
                inner.observe(idx, at_ms);
                // Losing waits give their event back so a later wait can bind it
                for (i, child) in self.children.iter_mut().enumerate() {
                    if i != winner_index {
                        child.release(&mut inner);
                    }
                }
                Poll::Ready(AggregateOutput::Select { winner_index, output })
            }
            AggregateMode::Join => {
                let mut ready = Vec::with_capacity(self.children.len());
                for c in &self.children {
                    match c.peek_completion(&inner) {
                        Some(p) => ready.push(p),
                        None => return Poll::Pending,
                    }
                }
                let mut outputs = Vec::with_capacity(ready.len());
                for (idx, at_ms, out) in ready {
                    inner.observe(idx, at_ms);
                    outputs.push(out);
                }
                Poll::Ready(AggregateOutput::Join { outputs })
            }
        }
    }
}

/// Resolves to `(winner_index, output)` of the first child to complete in history order.
pub struct SelectFuture(pub(crate) AggregateDurableFuture);
impl Future for SelectFuture {
    type Output = (usize, DurableOutput);
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().0.poll_aggregate() {
            Poll::Ready(AggregateOutput::Select { winner_index, output }) => Poll::Ready((winner_index, output)),
            Poll::Ready(AggregateOutput::Join { .. }) => unreachable!("select future built in join mode"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolves once every child has completed; outputs follow argument order.
pub struct JoinFuture(pub(crate) AggregateDurableFuture);
impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().0.poll_aggregate() {
            Poll::Ready(AggregateOutput::Join { outputs }) => Poll::Ready(outputs),
            Poll::Ready(AggregateOutput::Select { .. }) => unreachable!("join future built in select mode"),
            Poll::Pending => Poll::Pending,
        }
    }
}
