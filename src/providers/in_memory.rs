use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{already_exists, dedupe_key, restore_in_order, HistoryStore, QueueKind, Queued, WorkItem};
use crate::Event;

const CAP: usize = 1024;

#[derive(Default)]
struct Queue {
    visible: Vec<Queued>,
    // Peek-lock state: token -> item. Items here are invisible until ack/abandon.
    locked: HashMap<String, Queued>,
    next_seq: u64,
}

/// History and queues held in process memory; lost on restart.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<Event>>>,
    orchestrator_q: Mutex<Queue>,
    worker_q: Mutex<Queue>,
    timer_q: Mutex<Queue>,
    next_token: AtomicU64,
}

impl InMemoryHistoryStore {
    fn queue(&self, kind: QueueKind) -> &Mutex<Queue> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
            QueueKind::Timer => &self.timer_q,
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.histories.lock().await.get(instance).cloned().unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let mut g = self.histories.lock().await;
        let hist = g
            .get_mut(instance)
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        let mut seen: HashSet<(u64, &'static str)> = hist.iter().filter_map(dedupe_key).collect();
        let fresh: Vec<Event> = new_events
            .into_iter()
            .filter(|e| dedupe_key(e).map_or(true, |k| seen.insert(k)))
            .collect();
        if hist.len() + fresh.len() > CAP {
            return Err(format!(
                "history cap exceeded (cap={CAP}, have={}, append={})",
                hist.len(),
                fresh.len()
            ));
        }
        hist.extend(fresh);
        Ok(())
    }

    async fn exists(&self, instance: &str) -> bool {
        self.histories.lock().await.contains_key(instance)
    }

    async fn reset(&self) {
        self.histories.lock().await.clear();
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            *self.queue(kind).lock().await = Queue::default();
        }
    }

    async fn list_instances(&self) -> Vec<String> {
        self.histories.lock().await.keys().cloned().collect()
    }

    async fn dump_all_pretty(&self) -> String {
        let g = self.histories.lock().await;
        let mut out = String::new();
        for (inst, events) in g.iter() {
            out.push_str(&format!("instance={inst}\n"));
            for e in events {
                out.push_str(&format!("  {e:#?}\n"));
            }
        }
        out
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut g = self.histories.lock().await;
        if g.contains_key(instance) {
            return Err(already_exists(instance));
        }
        g.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let mut g = self.histories.lock().await;
        if g.remove(instance).is_none() {
            return Err(format!("instance not found: {instance}"));
        }
        Ok(())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut q = self.queue(kind).lock().await;
        if item.dedupes() && q.visible.iter().any(|queued| queued.item == item) {
            return Ok(());
        }
        let seq = q.next_seq;
        q.next_seq += 1;
        q.visible.push(Queued { seq, item });
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut q = self.queue(kind).lock().await;
        if q.visible.is_empty() {
            return None;
        }
        let entry = q.visible.remove(0);
        let token = format!("{kind:?}-{}", self.next_token.fetch_add(1, Ordering::Relaxed));
        let item = entry.item.clone();
        q.locked.insert(token.clone(), entry);
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        self.queue(kind).lock().await.locked.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut q = self.queue(kind).lock().await;
        if let Some(entry) = q.locked.remove(token) {
            restore_in_order(&mut q.visible, entry);
        }
        Ok(())
    }
}
