use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::providers::{HistoryStore, QueueKind, WorkItem};

type TimerKey = (String, u64);

/// How long a cancellation for a timer that was never armed here is remembered.
const UNARMED_CANCEL_MEMORY_MS: u64 = 60_000;

/// In-process timer wheel fed from the Timer queue.
/// Keeps a min-heap of armed timers and enqueues `TimerFired` when due.
pub struct TimerService {
    store: Arc<dyn HistoryStore>,
    rx: mpsc::UnboundedReceiver<WorkItem>,
    // (instance, id) -> fire_at_ms
    armed: HashMap<TimerKey, u64>,
    // (instance, id) -> forget the cancellation after this time
    cancelled: HashMap<TimerKey, u64>,
    min_heap: BinaryHeap<Reverse<(u64, String, u64)>>,
    poller_idle: Duration,
}

impl TimerService {
    pub fn start(
        store: Arc<dyn HistoryStore>,
        poller_idle: Duration,
    ) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedSender<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel::<WorkItem>();
        let mut svc = TimerService {
            store,
            rx,
            armed: HashMap::new(),
            cancelled: HashMap::new(),
            min_heap: BinaryHeap::new(),
            poller_idle,
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            while let Ok(item) = self.rx.try_recv() {
                self.apply(item);
            }

            let now = now_ms();
            self.prune_cancelled(now);
            let mut due: Vec<(String, u64, u64)> = Vec::new();
            while let Some(Reverse((ts, _, _))) = self.min_heap.peek() {
                if *ts > now {
                    break;
                }
                let Some(Reverse((ts, instance, id))) = self.min_heap.pop() else {
                    break;
                };
                let key = (instance, id);
                // Stale heap entries belong to cancelled timers
                if self.armed.get(&key) == Some(&ts) {
                    self.armed.remove(&key);
                    due.push((key.0, key.1, ts));
                }
            }

            for (instance, id, fire_at_ms) in due.drain(..) {
                debug!(instance=%instance, id, fire_at_ms, "timer due");
                if let Err(e) = self
                    .store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::TimerFired {
                            instance: instance.clone(),
                            id,
                            fire_at_ms,
                        },
                    )
                    .await
                {
                    warn!(instance=%instance, id, error=%e, "failed to enqueue TimerFired; re-arming");
                    self.arm(instance, id, fire_at_ms);
                    tokio::time::sleep(self.poller_idle).await;
                }
            }

            let next = self.min_heap.peek().map(|Reverse((ts, _, _))| *ts);
            match next {
                Some(next_ts) => {
                    let wait = Duration::from_millis(next_ts.saturating_sub(now_ms()).max(1));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {},
                        maybe = self.rx.recv() => match maybe {
                            Some(item) => self.apply(item),
                            None => tokio::time::sleep(self.poller_idle).await,
                        }
                    }
                }
                None => match self.rx.recv().await {
                    Some(item) => self.apply(item),
                    None => return,
                },
            }
        }
    }

    fn apply(&mut self, item: WorkItem) {
        match item {
            WorkItem::TimerSchedule { instance, id, fire_at_ms } => {
                if self.cancelled.contains_key(&(instance.clone(), id)) {
                    return;
                }
                self.arm(instance, id, fire_at_ms);
            }
            WorkItem::TimerCancel { instance, id } => {
                let key = (instance, id);
                let forget_at = match self.armed.remove(&key) {
                    Some(fire_at_ms) => fire_at_ms,
                    None => now_ms().saturating_add(UNARMED_CANCEL_MEMORY_MS),
                };
                self.cancelled.insert(key, forget_at);
            }
            other => warn!(?other, "timer service ignoring unexpected work item"),
        }
    }

    /// A late schedule past its fire time would be dropped by the instance
    /// anyway, so cancellations only need to outlive the timer itself.
    fn prune_cancelled(&mut self, now: u64) {
        self.cancelled.retain(|_, forget_at| *forget_at > now);
    }

    fn arm(&mut self, instance: String, id: u64, fire_at_ms: u64) {
        let key = (instance.clone(), id);
        if self.armed.contains_key(&key) {
            return;
        }
        self.armed.insert(key, fire_at_ms);
        self.min_heap.push(Reverse((fire_at_ms, instance, id)));
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
