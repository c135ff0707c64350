#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cloud_scheduler::providers::fs::FsHistoryStore;
use cloud_scheduler::providers::HistoryStore;
use cloud_scheduler::runtime::{RetryPolicy, RuntimeOptions};
use cloud_scheduler::Event;

/// Poll history until `pred` holds or `timeout_ms` elapses.
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await;
        if pred(&hist) {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_custom_status(store: Arc<dyn HistoryStore>, instance: &str, status: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |h| {
            h.iter()
                .any(|e| matches!(e, Event::CustomStatusSet { status: s, .. } if s == status))
        },
        timeout_ms,
    )
    .await
}

pub async fn wait_for_activity_scheduled(
    store: Arc<dyn HistoryStore>,
    instance: &str,
    name: &str,
    timeout_ms: u64,
) -> bool {
    wait_for_history(
        store,
        instance,
        |h| {
            h.iter()
                .any(|e| matches!(e, Event::ActivityScheduled { name: n, .. } if n == name))
        },
        timeout_ms,
    )
    .await
}

pub fn fs_store() -> (tempfile::TempDir, Arc<dyn HistoryStore>) {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(FsHistoryStore::new(td.path(), true)) as Arc<dyn HistoryStore>;
    (td, store)
}

/// Short intervals so retries and dehydration happen quickly under test.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        poll_idle_sleep: Duration::from_millis(5),
        idle_dehydrate: Duration::from_millis(200),
        activity_retry: RetryPolicy::fixed(Duration::from_millis(10), 3),
        activity_timeout: Duration::from_secs(2),
        store_retry_delay: Duration::from_millis(20),
        ..RuntimeOptions::default()
    }
}

/// Shared invocation counter handed to test activities.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn count_of(hist: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    hist.iter().filter(|e| pred(e)).count()
}
