use std::sync::Arc;
use std::time::Duration;

use cloud_scheduler::providers::in_memory::InMemoryHistoryStore;
use cloud_scheduler::providers::HistoryStore;
use cloud_scheduler::runtime::registry::ActivityRegistry;
use cloud_scheduler::runtime::Runtime;
use cloud_scheduler::{DurableOutput, Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, RuntimeError};

mod common;
use common::count_of;

async fn runtime_with(
    store: Arc<dyn HistoryStore>,
    acts: ActivityRegistry,
    orchs: OrchestrationRegistry,
) -> Arc<Runtime> {
    Runtime::start_with_options(store, Arc::new(acts), orchs, common::fast_options()).await
}

#[tokio::test]
async fn select_two_externals_history_order_wins() {
    let (_td, store) = common::fs_store();
    let orchs = OrchestrationRegistry::builder()
        .register("ABSelect", |ctx: OrchestrationContext, _input: String| async move {
            ctx.set_custom_status("waiting");
            let a = ctx.schedule_wait("A");
            let b = ctx.schedule_wait("B");
            match ctx.select2(a, b).await {
                (0, DurableOutput::External(v)) => Ok(format!("A:{v}")),
                (1, DurableOutput::External(v)) => Ok(format!("B:{v}")),
                other => Err(format!("unexpected {other:?}")),
            }
        })
        .build();
    let rt = runtime_with(store.clone(), ActivityRegistry::builder().build(), orchs).await;
    rt.clone().start_instance("inst-ab", "ABSelect", "").await.unwrap();
    assert!(common::wait_for_custom_status(store.clone(), "inst-ab", "waiting", 2_000).await);

    rt.raise_event("inst-ab", "B", "vb").await.unwrap();
    // the instance may already have finished on B
    let _ = rt.raise_event("inst-ab", "A", "va").await;

    let status = rt.wait_for_orchestration("inst-ab", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "B:vb".into() });
    let hist = store.read("inst-ab").await;
    let idx_b = hist
        .iter()
        .position(|e| matches!(e, Event::ExternalEvent { name, .. } if name == "B"))
        .unwrap();
    if let Some(idx_a) = hist
        .iter()
        .position(|e| matches!(e, Event::ExternalEvent { name, .. } if name == "A"))
    {
        assert!(idx_b < idx_a, "expected B before A: {hist:#?}");
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn event_winning_a_race_cancels_the_timer() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let orchs = OrchestrationRegistry::builder()
        .register("Deadline", |ctx: OrchestrationContext, _input: String| async move {
            let timer = ctx.schedule_timer(60_000);
            let timer_id = timer.correlation_id();
            let evt = ctx.schedule_wait("Evt");
            let (idx, out) = ctx.select2(timer, evt).await;
            if idx == 0 {
                return Ok("timeout".to_string());
            }
            ctx.cancel_timer(timer_id);
            match out {
                DurableOutput::External(v) => Ok(v),
                other => Err(format!("unexpected {other:?}")),
            }
        })
        .build();
    let rt = runtime_with(store.clone(), ActivityRegistry::builder().build(), orchs).await;
    rt.clone().start_instance("race-1", "Deadline", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "race-1",
            |h| h.iter().any(|e| matches!(e, Event::TimerCreated { .. })),
            2_000
        )
        .await
    );
    rt.raise_event("race-1", "Evt", "payload").await.unwrap();

    let status = rt.wait_for_orchestration("race-1", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "payload".into() });
    let hist = store.read("race-1").await;
    assert_eq!(count_of(&hist, |e| matches!(e, Event::TimerCancelled { .. })), 1);
    assert_eq!(count_of(&hist, |e| matches!(e, Event::TimerFired { .. })), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn timer_winning_a_race_finishes_and_late_event_is_refused() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let orchs = OrchestrationRegistry::builder()
        .register("ShortDeadline", |ctx: OrchestrationContext, _input: String| async move {
            let timer = ctx.schedule_timer(30);
            let evt = ctx.schedule_wait("Never");
            let (idx, _) = ctx.select2(timer, evt).await;
            Ok(if idx == 0 { "timeout" } else { "event" }.to_string())
        })
        .build();
    let rt = runtime_with(store.clone(), ActivityRegistry::builder().build(), orchs).await;
    rt.clone().start_instance("race-2", "ShortDeadline", "").await.unwrap();

    let status = rt.wait_for_orchestration("race-2", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "timeout".into() });
    assert!(matches!(
        rt.raise_event("race-2", "Never", "").await,
        Err(RuntimeError::UnknownInstance(_))
    ));
    let hist = store.read("race-2").await;
    assert_eq!(count_of(&hist, |e| matches!(e, Event::ExternalEvent { .. })), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_event_is_recorded_but_not_consumed_twice() {
    let (_td, store) = common::fs_store();
    let orchs = OrchestrationRegistry::builder()
        .register("TwoSteps", |ctx: OrchestrationContext, _input: String| async move {
            let first = ctx.schedule_wait("Evt").into_event().await;
            ctx.set_custom_status("got first");
            let next = ctx.schedule_wait("Next").into_event().await;
            Ok(format!("{first}+{next}"))
        })
        .build();
    let rt = runtime_with(store.clone(), ActivityRegistry::builder().build(), orchs).await;
    rt.clone().start_instance("dup-1", "TwoSteps", "").await.unwrap();

    rt.raise_event("dup-1", "Evt", "one").await.unwrap();
    assert!(common::wait_for_custom_status(store.clone(), "dup-1", "got first", 3_000).await);
    rt.raise_event("dup-1", "Evt", "again").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "dup-1",
            |h| count_of(h, |e| matches!(e, Event::ExternalEvent { name, .. } if name == "Evt")) == 2,
            3_000
        )
        .await
    );
    rt.raise_event("dup-1", "Next", "two").await.unwrap();

    let status = rt.wait_for_orchestration("dup-1", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "one+two".into() });
    rt.shutdown().await;
}

#[tokio::test]
async fn join_returns_outputs_in_argument_order() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let acts = ActivityRegistry::builder()
        .register("Slow", |input: String| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(format!("slow:{input}"))
        })
        .register("Fast", |input: String| async move { Ok::<_, String>(format!("fast:{input}")) })
        .build();
    let orchs = OrchestrationRegistry::builder()
        .register("Fanout", |ctx: OrchestrationContext, _input: String| async move {
            let outs = ctx
                .join(vec![ctx.schedule_activity("Slow", "a"), ctx.schedule_activity("Fast", "b")])
                .await;
            let mut parts = Vec::new();
            for out in outs {
                match out {
                    DurableOutput::Activity(r) => parts.push(r?),
                    other => return Err(format!("unexpected {other:?}")),
                }
            }
            Ok(parts.join(","))
        })
        .build();
    let rt = runtime_with(store.clone(), acts, orchs).await;
    rt.clone().start_instance("join-1", "Fanout", "").await.unwrap();

    let status = rt.wait_for_orchestration("join-1", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "slow:a,fast:b".into() });
    let hist = store.read("join-1").await;
    let first_done = hist
        .iter()
        .find_map(|e| match e {
            Event::ActivityCompleted { result, .. } => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(first_done, "fast:b");
    rt.shutdown().await;
}
