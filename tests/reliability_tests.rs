use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cloud_scheduler::providers::fs::FsHistoryStore;
use cloud_scheduler::providers::in_memory::InMemoryHistoryStore;
use cloud_scheduler::providers::{HistoryStore, QueueKind, WorkItem};
use cloud_scheduler::runtime::registry::ActivityRegistry;
use cloud_scheduler::runtime::{ActivityError, RetryPolicy, Runtime, RuntimeOptions};
use cloud_scheduler::{Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, RuntimeError};

mod common;
use common::{count_of, fast_options, Counter};

fn call_once(name: &'static str) -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("CallOnce", move |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity(name, input).into_activity().await
        })
        .build()
}

async fn failed_with(rt: &Runtime, instance: &str) -> String {
    match rt.wait_for_orchestration(instance, Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Failed { error } => error,
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let calls = Counter::default();
    let c = calls.clone();
    let acts = ActivityRegistry::builder()
        .register_fallible("Flaky", move |input: String| {
            let c = c.clone();
            async move {
                if c.bump() < 3 {
                    Err(ActivityError::Transient("connection reset".into()))
                } else {
                    Ok(format!("ok:{input}"))
                }
            }
        })
        .build();
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(store.clone(), Arc::new(acts), call_once("Flaky"), fast_options()).await;
    rt.clone().start_instance("flaky-1", "CallOnce", "x").await.unwrap();

    let status = rt.wait_for_orchestration("flaky-1", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "ok:x".into() });
    assert_eq!(calls.get(), 3);
    // retries never show up as extra history
    let hist = store.read("flaky-1").await;
    assert_eq!(count_of(&hist, |e| matches!(e, Event::ActivityCompleted { .. })), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_activity() {
    let calls = Counter::default();
    let c = calls.clone();
    let acts = ActivityRegistry::builder()
        .register_fallible("Down", move |_input: String| {
            let c = c.clone();
            async move {
                c.bump();
                Err::<String, _>(ActivityError::Transient("503".into()))
            }
        })
        .build();
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(store, Arc::new(acts), call_once("Down"), fast_options()).await;
    rt.clone().start_instance("down-1", "CallOnce", "").await.unwrap();

    let error = failed_with(&rt, "down-1").await;
    assert!(error.starts_with("transient failure after 3 attempts"), "{error}");
    assert_eq!(calls.get(), 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn application_errors_are_not_retried() {
    let calls = Counter::default();
    let c = calls.clone();
    let acts = ActivityRegistry::builder()
        .register("Strict", move |_input: String| {
            let c = c.clone();
            async move {
                c.bump();
                Err::<String, _>("bad input".to_string())
            }
        })
        .build();
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(store, Arc::new(acts), call_once("Strict"), fast_options()).await;
    rt.clone().start_instance("strict-1", "CallOnce", "").await.unwrap();

    assert_eq!(failed_with(&rt, "strict-1").await, "bad input");
    assert_eq!(calls.get(), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn panics_timeouts_and_missing_activities_become_failures() {
    let acts = ActivityRegistry::builder()
        .register("Boom", |_input: String| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<_, String>(String::new())
        })
        .register("Hang", |_input: String| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(String::new())
        })
        .build();
    let orchs = OrchestrationRegistry::builder()
        .register("Call", |ctx: OrchestrationContext, name: String| async move {
            ctx.schedule_activity(name, "").into_activity().await
        })
        .build();
    let options = RuntimeOptions {
        activity_timeout: Duration::from_millis(50),
        activity_retry: RetryPolicy::no_retry(),
        ..fast_options()
    };
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(store, Arc::new(acts), orchs, options).await;
    for (inst, name) in [("p-boom", "Boom"), ("p-hang", "Hang"), ("p-missing", "Missing")] {
        rt.clone().start_instance(inst, "Call", name).await.unwrap();
    }

    let boom = failed_with(&rt, "p-boom").await;
    assert!(boom.starts_with("activity panicked: kaboom"), "{boom}");
    let hang = failed_with(&rt, "p-hang").await;
    assert!(hang.contains("timed out after 50ms"), "{hang}");
    assert_eq!(failed_with(&rt, "p-missing").await, "unregistered:Missing");
    rt.shutdown().await;
}

#[tokio::test]
async fn orchestration_panic_fails_the_instance() {
    let orchs = OrchestrationRegistry::builder()
        .register("Panicky", |_ctx: OrchestrationContext, _input: String| async move {
            if true {
                panic!("bad orchestration");
            }
            Ok(String::new())
        })
        .build();
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(store, Arc::new(ActivityRegistry::builder().build()), orchs, fast_options()).await;
    rt.clone().start_instance("panic-1", "Panicky", "").await.unwrap();
    let error = failed_with(&rt, "panic-1").await;
    assert!(error.contains("orchestration panicked: bad orchestration"), "{error}");
    rt.shutdown().await;
}

#[tokio::test]
async fn draining_waits_for_running_instances() {
    let acts = ActivityRegistry::builder()
        .register("Echo", |input: String| async move { Ok::<_, String>(input) })
        .build();
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(store, Arc::new(acts), call_once("Echo"), fast_options()).await;
    rt.clone().start_instance("drain-1", "CallOnce", "hi").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), rt.clone().drain_instances())
        .await
        .unwrap();
    let state = rt.get_orchestration_status("drain-1").await.unwrap();
    assert_eq!(state.status, OrchestrationStatus::Completed { output: "hi".into() });
    rt.shutdown().await;
}

/// In-memory store whose first few Worker enqueues are refused.
struct FlakyWorkerQueue {
    inner: InMemoryHistoryStore,
    refusals_left: AtomicUsize,
}

impl FlakyWorkerQueue {
    fn refusing(n: usize) -> Self {
        Self {
            inner: InMemoryHistoryStore::default(),
            refusals_left: AtomicUsize::new(n),
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for FlakyWorkerQueue {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.inner.read(instance).await
    }
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        self.inner.append(instance, new_events).await
    }
    async fn exists(&self, instance: &str) -> bool {
        self.inner.exists(instance).await
    }
    async fn reset(&self) {
        self.inner.reset().await
    }
    async fn list_instances(&self) -> Vec<String> {
        self.inner.list_instances().await
    }
    async fn dump_all_pretty(&self) -> String {
        self.inner.dump_all_pretty().await
    }
    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        self.inner.create_instance(instance).await
    }
    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        self.inner.remove_instance(instance).await
    }
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        if kind == QueueKind::Worker
            && self
                .refusals_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err("store briefly unavailable".to_string());
        }
        self.inner.enqueue_work(kind, item).await
    }
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        self.inner.dequeue_peek_lock(kind).await
    }
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        self.inner.ack(kind, token).await
    }
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        self.inner.abandon(kind, token).await
    }
}

#[tokio::test]
async fn refused_activity_dispatch_is_retried_until_the_store_accepts() {
    let calls = Counter::default();
    let c = calls.clone();
    let acts = ActivityRegistry::builder()
        .register("Echo", move |input: String| {
            let c = c.clone();
            async move {
                c.bump();
                Ok::<_, String>(input)
            }
        })
        .build();
    let store = Arc::new(FlakyWorkerQueue::refusing(2)) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(store.clone(), Arc::new(acts), call_once("Echo"), fast_options()).await;
    rt.clone().start_instance("flaky-q", "CallOnce", "x").await.unwrap();

    let status = rt.wait_for_orchestration("flaky-q", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "x".into() });
    assert_eq!(calls.get(), 1);
    let hist = store.read("flaky-q").await;
    assert_eq!(count_of(&hist, |e| matches!(e, Event::ActivityScheduled { .. })), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn activity_runs_once_while_noise_resumes_the_instance() {
    let calls = Counter::default();
    let c = calls.clone();
    let acts = ActivityRegistry::builder()
        .register("Slow", move |input: String| {
            let c = c.clone();
            async move {
                c.bump();
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok::<_, String>(input)
            }
        })
        .build();
    let options = RuntimeOptions {
        idle_dehydrate: Duration::from_millis(50),
        ..fast_options()
    };
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(store.clone(), Arc::new(acts), call_once("Slow"), options).await;
    rt.clone().start_instance("slow-1", "CallOnce", "x").await.unwrap();
    for i in 0..10 {
        // late raises after completion are refused, which is fine here
        let _ = rt.raise_event("slow-1", "Noise", i.to_string()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let status = rt.wait_for_orchestration("slow-1", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "x".into() });
    assert_eq!(calls.get(), 1);
    let hist = store.read("slow-1").await;
    assert_eq!(count_of(&hist, |e| matches!(e, Event::ActivityScheduled { .. })), 1);
    assert!(count_of(&hist, |e| matches!(e, Event::ExternalEvent { .. })) > 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn concurrent_starts_of_one_id_report_already_exists() {
    let (_td, fs) = common::fs_store();
    let stores = vec![Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>, fs];
    for store in stores {
        let orchs = OrchestrationRegistry::builder()
            .register("Wait", |ctx: OrchestrationContext, _input: String| async move {
                Ok(ctx.schedule_wait("go").into_event().await)
            })
            .build();
        let rt = Runtime::start_with_options(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchs, fast_options()).await;
        let (a, b) = tokio::join!(
            rt.clone().start_instance("same", "Wait", ""),
            rt.clone().start_instance("same", "Wait", "")
        );
        let mut results = vec![a, b];
        results.sort_by_key(|r| r.is_err());
        assert_eq!(results[0], Ok(()));
        assert_eq!(results[1], Err(RuntimeError::InstanceAlreadyExists("same".into())));
        let hist = store.read("same").await;
        assert_eq!(count_of(&hist, |e| matches!(e, Event::OrchestrationStarted { .. })), 1);
        rt.shutdown().await;
    }
}

#[tokio::test]
async fn raising_to_unknown_instance_creates_nothing() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(ActivityRegistry::builder().build()),
        OrchestrationRegistry::builder().build(),
        fast_options(),
    )
    .await;
    let err = rt.raise_event("ghost", "ApprovalEvent", "").await.unwrap_err();
    assert_eq!(err, RuntimeError::UnknownInstance("ghost".into()));
    assert!(matches!(
        rt.terminate_instance("ghost", "why").await,
        Err(RuntimeError::UnknownInstance(_))
    ));
    assert!(matches!(
        rt.get_orchestration_status("ghost").await,
        Err(RuntimeError::UnknownInstance(_))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.list_instances().await.is_empty());
    rt.shutdown().await;
}

#[tokio::test]
async fn start_rejects_duplicates_and_unknown_names() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let orchs = OrchestrationRegistry::builder()
        .register("Wait", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.schedule_wait("go").into_event().await)
        })
        .build();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchs, fast_options()).await;
    rt.clone().start_instance("dup", "Wait", "").await.unwrap();
    assert_eq!(
        rt.clone().start_instance("dup", "Wait", "").await,
        Err(RuntimeError::InstanceAlreadyExists("dup".into()))
    );
    assert_eq!(
        rt.clone().start_instance("other", "Nope", "").await,
        Err(RuntimeError::UnknownOrchestration("Nope".into()))
    );
    assert!(!store.exists("other").await);
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_stops_a_waiting_instance() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let orchs = OrchestrationRegistry::builder()
        .register("Wait", |ctx: OrchestrationContext, _input: String| async move {
            ctx.set_custom_status("waiting");
            Ok(ctx.schedule_wait("go").into_event().await)
        })
        .build();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchs, fast_options()).await;
    let handle = rt.clone().start_orchestration("term-1", "Wait", "").await.unwrap();
    assert!(common::wait_for_custom_status(store.clone(), "term-1", "waiting", 2_000).await);

    rt.terminate_instance("term-1", "operator request").await.unwrap();
    let (_hist, result) = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(result, Err("terminated: operator request".to_string()));
    assert_eq!(
        rt.get_orchestration_status("term-1").await.unwrap().status,
        OrchestrationStatus::Terminated {
            reason: "operator request".into()
        }
    );
    assert!(rt.raise_event("term-1", "go", "").await.is_err());
    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_timer_fired_items_record_one_firing() {
    let (_td, store) = common::fs_store();
    let orchs = OrchestrationRegistry::builder()
        .register("OneTimer", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(300).into_timer().await;
            Ok("t".to_string())
        })
        .build();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchs, fast_options()).await;
    rt.clone().start_instance("timer-dup", "OneTimer", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "timer-dup",
            |h| h.iter().any(|e| matches!(e, Event::TimerCreated { .. })),
            2_000
        )
        .await
    );
    let (id, fire_at_ms) = store
        .read("timer-dup")
        .await
        .iter()
        .find_map(|e| match e {
            Event::TimerCreated { id, fire_at_ms } => Some((*id, *fire_at_ms)),
            _ => None,
        })
        .unwrap();

    // a fired timer redelivered after a crash between append and ack
    let wi = WorkItem::TimerFired {
        instance: "timer-dup".to_string(),
        id,
        fire_at_ms,
    };
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi).await;

    let status = rt.wait_for_orchestration("timer-dup", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "t".into() });
    // let the armed timer fire into the finished instance too
    tokio::time::sleep(Duration::from_millis(400)).await;
    let hist = store.read("timer-dup").await;
    assert_eq!(count_of(&hist, |e| matches!(e, Event::TimerFired { .. })), 1);
    assert_eq!(count_of(&hist, |e| matches!(e, Event::OrchestrationCompleted { .. })), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_activity_completion_is_ignored() {
    let (_td, store) = common::fs_store();
    let acts = ActivityRegistry::builder()
        .register("Echo", |input: String| async move { Ok::<_, String>(input) })
        .build();
    let orchs = OrchestrationRegistry::builder()
        .register("EchoThenWait", |ctx: OrchestrationContext, _input: String| async move {
            let v = ctx.schedule_activity("Echo", "hi").into_activity().await?;
            let go = ctx.schedule_wait("go").into_event().await;
            Ok(format!("{v}:{go}"))
        })
        .build();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(acts), orchs, fast_options()).await;
    rt.clone().start_instance("act-dup", "EchoThenWait", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "act-dup",
            |h| h.iter().any(|e| matches!(e, Event::ActivityCompleted { .. })),
            3_000
        )
        .await
    );
    let wi = WorkItem::ActivityCompleted {
        instance: "act-dup".to_string(),
        id: 1,
        result: "forged".to_string(),
    };
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi).await;
    rt.raise_event("act-dup", "go", "now").await.unwrap();

    let status = rt.wait_for_orchestration("act-dup", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "hi:now".into() });
    let hist = store.read("act-dup").await;
    assert_eq!(count_of(&hist, |e| matches!(e, Event::ActivityCompleted { .. })), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn idle_instance_dehydrates_and_resumes_on_timer() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let orchs = OrchestrationRegistry::builder()
        .register("Nap", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(600).into_timer().await;
            Ok("rested".to_string())
        })
        .build();
    let options = RuntimeOptions {
        idle_dehydrate: Duration::from_millis(100),
        ..fast_options()
    };
    let rt = Runtime::start_with_options(store, Arc::new(ActivityRegistry::builder().build()), orchs, options).await;
    rt.clone().start_instance("nap-1", "Nap", "").await.unwrap();
    let status = rt.wait_for_orchestration("nap-1", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "rested".into() });
    rt.shutdown().await;
}

#[tokio::test]
async fn fs_store_instance_survives_runtime_restart() {
    let td = tempfile::tempdir().unwrap();
    let orchs = || {
        OrchestrationRegistry::builder()
            .register("Durable", |ctx: OrchestrationContext, _input: String| async move {
                ctx.set_custom_status("waiting");
                let v = ctx.schedule_wait("go").into_event().await;
                Ok(format!("resumed:{v}"))
            })
            .build()
    };

    let store1 = Arc::new(FsHistoryStore::new(td.path(), true)) as Arc<dyn HistoryStore>;
    let rt1 = Runtime::start_with_options(store1.clone(), Arc::new(ActivityRegistry::builder().build()), orchs(), fast_options()).await;
    rt1.clone().start_instance("survivor", "Durable", "").await.unwrap();
    assert!(common::wait_for_custom_status(store1.clone(), "survivor", "waiting", 2_000).await);
    rt1.shutdown().await;

    let store2 = Arc::new(FsHistoryStore::new(td.path(), false)) as Arc<dyn HistoryStore>;
    let rt2 = Runtime::start_with_options(store2.clone(), Arc::new(ActivityRegistry::builder().build()), orchs(), fast_options()).await;
    rt2.raise_event("survivor", "go", "yes").await.unwrap();
    let status = rt2.wait_for_orchestration("survivor", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "resumed:yes".into() });
    let hist = store2.read("survivor").await;
    assert_eq!(count_of(&hist, |e| matches!(e, Event::CustomStatusSet { .. })), 1);
    rt2.shutdown().await;
}
