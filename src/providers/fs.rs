use std::collections::HashSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

use super::{already_exists, dedupe_key, restore_in_order, HistoryStore, QueueKind, Queued, WorkItem};
use crate::Event;

const HISTORY_FILE: &str = "history.jsonl";

/// Filesystem-backed history store: one JSONL history per instance directory
/// plus JSONL queue files with lock sidecars for peek-locked items.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    cap: usize,
    // serializes read-modify-write of queue files across dispatchers
    queue_guard: Arc<Mutex<()>>,
    next_token: Arc<AtomicU64>,
    // arrival order for queued items, continued from what is already on disk
    next_seq: Arc<AtomicU64>,
}

impl FsHistoryStore {
    /// Create a store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    /// Items that were locked when a previous process stopped become visible again.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        if let Err(e) = std::fs::create_dir_all(path.join("instances")) {
            warn!(root=%path.display(), error=%e, "failed to create store directory");
        }
        let store = Self {
            root: path,
            cap: 1024,
            queue_guard: Arc::new(Mutex::new(())),
            next_token: Arc::new(AtomicU64::new(0)),
            next_seq: Arc::new(AtomicU64::new(0)),
        };
        let mut next_seq = 0;
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            if let Err(e) = store.recover_locks(kind) {
                warn!(queue=?kind, error=%e, "failed to recover locked work items");
            }
            if let Some(last) = store.load_queue(kind).iter().map(|q| q.seq).max() {
                next_seq = next_seq.max(last + 1);
            }
        }
        store.next_seq.store(next_seq, Ordering::Relaxed);
        store
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(instance)
    }
    fn history_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join(HISTORY_FILE)
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
            QueueKind::Timer => self.root.join(".locks/timer"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join("orch-queue.jsonl"),
            QueueKind::Worker => self.root.join("work-queue.jsonl"),
            QueueKind::Timer => self.root.join("timer-queue.jsonl"),
        }
    }

    fn load_queue(&self, kind: QueueKind) -> Vec<Queued> {
        std::fs::read_to_string(self.queue_file(kind))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| serde_json::from_str::<Queued>(l).ok())
            .collect()
    }

    /// Rewrite a queue file atomically via a temp file + rename.
    fn store_queue(&self, kind: QueueKind, items: &[Queued]) -> Result<(), String> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| e.to_string())?;
            for it in items {
                let line = serde_json::to_string(it).map_err(|e| e.to_string())?;
                tf.write_all(line.as_bytes()).map_err(|e| e.to_string())?;
                tf.write_all(b"\n").map_err(|e| e.to_string())?;
            }
        }
        std::fs::rename(&tmp, &qf).map_err(|e| e.to_string())
    }

    fn recover_locks(&self, kind: QueueKind) -> Result<(), String> {
        let dir = self.lock_dir(kind);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(());
        };
        let mut recovered = Vec::new();
        for ent in entries.flatten() {
            let path = ent.path();
            let data = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
            if let Ok(entry) = serde_json::from_str::<Queued>(&data) {
                recovered.push(entry);
            }
            std::fs::remove_file(&path).map_err(|e| e.to_string())?;
        }
        if recovered.is_empty() {
            return Ok(());
        }
        let mut items = self.load_queue(kind);
        for entry in recovered {
            restore_in_order(&mut items, entry);
        }
        self.store_queue(kind, &items)
    }

    async fn read_events(path: &Path) -> Vec<Event> {
        let data = fs::read_to_string(path).await.unwrap_or_default();
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Event>(l).ok())
            .collect()
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    /// Read the entire JSONL file for the instance and deserialize each line.
    async fn read(&self, instance: &str) -> Vec<Event> {
        Self::read_events(&self.history_path(instance)).await
    }

    /// Append events that are not yet present, enforcing the history cap.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let path = self.history_path(instance);
        if !fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        let existing = Self::read_events(&path).await;
        let mut seen: HashSet<(u64, &'static str)> = existing.iter().filter_map(dedupe_key).collect();
        let fresh: Vec<Event> = new_events
            .into_iter()
            .filter(|e| dedupe_key(e).map_or(true, |k| seen.insert(k)))
            .collect();
        if existing.len() + fresh.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                existing.len(),
                fresh.len()
            ));
        }
        let mut buf = String::new();
        for ev in &fresh {
            buf.push_str(&serde_json::to_string(ev).map_err(|e| e.to_string())?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(buf.as_bytes()).await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn exists(&self, instance: &str) -> bool {
        fs::try_exists(self.history_path(instance)).await.unwrap_or(false)
    }

    /// Remove the root directory and all contents.
    async fn reset(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
        let _ = fs::create_dir_all(self.root.join("instances")).await;
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(self.root.join("instances")).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        out
    }

    /// Produce a human-readable dump of all stored histories.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            for ev in self.read(&inst).await {
                out.push_str(&format!("  {ev:#?}\n"));
            }
        }
        out
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let inst_dir = self.inst_root(instance);
        if fs::try_exists(&inst_dir).await.map_err(|e| e.to_string())? {
            return Err(already_exists(instance));
        }
        fs::create_dir_all(&inst_dir).await.map_err(|e| e.to_string())?;
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.history_path(instance))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(already_exists(instance)),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let inst_dir = self.inst_root(instance);
        if !fs::try_exists(&inst_dir).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        fs::remove_dir_all(&inst_dir).await.map_err(|e| e.to_string())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let _g = self.queue_guard.lock().await;
        let mut items = self.load_queue(kind);
        if item.dedupes() && items.iter().any(|queued| queued.item == item) {
            return Ok(());
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        items.push(Queued { seq, item });
        self.store_queue(kind, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _g = self.queue_guard.lock().await;
        let mut items = self.load_queue(kind);
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        // Persist the lock sidecar before dropping the item from the queue
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = self.next_token.fetch_add(1, Ordering::Relaxed);
        let token = format!("{now_ns:x}-{:x}-{seq:x}", std::process::id());
        std::fs::create_dir_all(self.lock_dir(kind)).ok()?;
        let line = serde_json::to_string(&first).ok()?;
        std::fs::write(self.lock_path(kind, &token), line).ok()?;
        if let Err(e) = self.store_queue(kind, &items) {
            warn!(queue=?kind, error=%e, "failed to rewrite queue after lock");
            let _ = std::fs::remove_file(self.lock_path(kind, &token));
            return None;
        }
        Some((first.item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let _g = self.queue_guard.lock().await;
        let path = self.lock_path(kind, token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        let entry: Queued = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        let mut items = self.load_queue(kind);
        restore_in_order(&mut items, entry);
        self.store_queue(kind, &items)?;
        std::fs::remove_file(&path).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_survives_reopen_and_enforces_cap() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new_with_cap(td.path(), true, 3);
        store.create_instance("a").await.unwrap();
        store
            .append(
                "a",
                vec![
                    Event::OrchestrationStarted {
                        name: "N".into(),
                        input: "".into(),
                        started_at_ms: 1,
                    },
                    Event::TimerCreated { id: 1, fire_at_ms: 5 },
                ],
            )
            .await
            .unwrap();
        let reopened = FsHistoryStore::new_with_cap(td.path(), false, 3);
        assert_eq!(reopened.read("a").await.len(), 2);
        assert!(reopened.exists("a").await);
        assert_eq!(reopened.list_instances().await, vec!["a".to_string()]);
        let err = reopened
            .append("a", vec![Event::TimerFired { id: 1, fire_at_ms: 5 }, Event::TimerCancelled { id: 9 }])
            .await
            .unwrap_err();
        assert!(err.contains("history cap exceeded"));
    }

    #[tokio::test]
    async fn locked_items_reappear_after_reopen() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        let item = WorkItem::ExternalRaised {
            instance: "i".into(),
            name: "Go".into(),
            data: "{}".into(),
        };
        store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
        let (locked, _token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(locked, item);
        assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

        let reopened = FsHistoryStore::new(td.path(), false);
        let (again, token) = reopened.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(again, item);
        reopened.ack(QueueKind::Orchestrator, &token).await.unwrap();
        assert!(reopened.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
    }
}
