//! Draft persistence.
//!
//! Unsent input is kept in memory per thread and written to a
//! [`DraftStorage`] backend by a background writer task after the input has
//! been quiet for the configured debounce.  All drafts live in one JSON blob
//! under a well-known key:
//!
//! ```json
//! { "<thread id>": { "content": "hello", "timestamp": 1718000000000 } }
//! ```
//!
//! A second instance sharing the backend (another tab, another window) picks
//! up changes with [`DraftStore::refresh_from_storage`].  Writes merge into
//! the stored blob rather than replacing it: only threads edited locally
//! since the last write are touched, the newer timestamp wins, and a local
//! clear removes the stored draft unless it was written after the clear.
//! Staged attachments are never persisted.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use gl_domain::config::DraftsConfig;
use gl_domain::error::{Error, Result};
use gl_domain::message::Attachment;
use gl_domain::trace::TraceEvent;

use crate::notify::{Notifier, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDraft {
    pub content: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

type DraftMap = BTreeMap<String, PersistedDraft>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Key/value blob storage shared between instances.
pub trait DraftStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, blob: &str) -> Result<()>;
}

/// One JSON file per key under a directory.
pub struct FileDraftStorage {
    dir: PathBuf,
}

impl FileDraftStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl DraftStorage for FileDraftStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn save(&self, key: &str, blob: &str) -> Result<()> {
        // Write-then-rename so a concurrent reader never sees half a file.
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, blob).map_err(Error::Io)?;
        std::fs::rename(&tmp, &path).map_err(Error::Io)?;
        Ok(())
    }
}

/// In-memory backend.  Counts saves and can be told to fail.
#[derive(Default)]
pub struct MemoryDraftStorage {
    blobs: Mutex<HashMap<String, String>>,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryDraftStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.blobs.lock().get(key).cloned()
    }

    /// Write a blob directly, as another instance would.
    pub fn put_raw(&self, key: &str, blob: impl Into<String>) {
        self.blobs.lock().insert(key.to_owned(), blob.into());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DraftStorage for MemoryDraftStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("storage unavailable".into()));
        }
        Ok(self.raw(key))
    }

    fn save(&self, key: &str, blob: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("quota exceeded".into()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.put_raw(key, blob);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Draft store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Announced whenever a thread's draft text changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftChange {
    pub thread_id: String,
    /// `None` when the draft was cleared.
    pub content: Option<String>,
}

/// A local edit not yet written to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Set,
    Cleared { at: i64 },
}

#[derive(Default)]
struct DraftState {
    drafts: DraftMap,
    pending: BTreeMap<String, Edit>,
    attachments: HashMap<String, Vec<Attachment>>,
}

/// Apply local edits on top of `base` (what storage holds).
fn overlay(base: &mut DraftMap, drafts: &DraftMap, pending: &BTreeMap<String, Edit>) {
    for (thread_id, edit) in pending {
        match edit {
            Edit::Set => {
                let Some(ours) = drafts.get(thread_id) else {
                    continue;
                };
                if base
                    .get(thread_id)
                    .map_or(true, |theirs| theirs.timestamp <= ours.timestamp)
                {
                    base.insert(thread_id.clone(), ours.clone());
                }
            }
            Edit::Cleared { at } => {
                if base.get(thread_id).is_some_and(|theirs| theirs.timestamp <= *at) {
                    base.remove(thread_id);
                }
            }
        }
    }
}

/// State shared with the writer task.
struct Shared {
    storage: Arc<dyn DraftStorage>,
    key: String,
    state: Mutex<DraftState>,
}

impl Shared {
    /// Stored drafts.  Unparseable data reads as empty; a storage error is
    /// returned.
    fn read(&self) -> Result<DraftMap> {
        Ok(match self.storage.load(&self.key)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(key = %self.key, error = %e, "unparseable drafts, treating as empty");
                DraftMap::new()
            }),
            None => DraftMap::new(),
        })
    }

    fn load(&self) -> DraftMap {
        self.read().unwrap_or_else(|e| {
            tracing::warn!(key = %self.key, error = %e, "failed to load drafts");
            DraftMap::new()
        })
    }

    /// Merge local edits into the stored drafts and write them back.
    /// Failures are logged and swallowed; the edits stay pending for the
    /// next write.
    fn persist(&self) {
        let edits = std::mem::take(&mut self.state.lock().pending);
        if edits.is_empty() {
            return;
        }

        let result = self.read().and_then(|mut merged| {
            overlay(&mut merged, &self.state.lock().drafts, &edits);
            let blob = serde_json::to_string(&merged).map_err(Error::Json)?;
            self.storage.save(&self.key, &blob)?;
            Ok(merged.len())
        });

        let (drafts, ok) = match result {
            Ok(drafts) => {
                tracing::debug!(drafts, edits = edits.len(), "drafts persisted");
                (drafts, true)
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "failed to persist drafts");
                let mut state = self.state.lock();
                for (thread_id, edit) in edits {
                    // A newer local edit for the thread takes precedence.
                    state.pending.entry(thread_id).or_insert(edit);
                }
                (state.drafts.len(), false)
            }
        };
        TraceEvent::DraftsPersisted { drafts, ok }.emit();
    }
}

enum WriterCmd {
    /// Write at `deadline` unless rescheduled before then.
    Schedule(Instant),
    Flush(oneshot::Sender<()>),
}

pub struct DraftStore {
    shared: Arc<Shared>,
    debounce: std::time::Duration,
    /// `None` when persistence is disabled.
    writer: Option<mpsc::UnboundedSender<WriterCmd>>,
    notifier: Notifier<DraftChange>,
}

impl DraftStore {
    /// Load persisted drafts and start the writer task.  Must be called
    /// inside a Tokio runtime when persistence is enabled.
    pub fn new(storage: Arc<dyn DraftStorage>, config: &DraftsConfig) -> Self {
        let shared = Arc::new(Shared {
            storage,
            key: config.storage_key.clone(),
            state: Mutex::new(DraftState::default()),
        });

        let writer = if config.enabled {
            shared.state.lock().drafts = shared.load();
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_writer(Arc::clone(&shared), rx));
            Some(tx)
        } else {
            None
        };

        Self {
            shared,
            debounce: config.debounce(),
            writer,
            notifier: Notifier::new(),
        }
    }

    /// Update the draft for `thread_id` and schedule a debounced write.
    /// Empty text clears the draft.
    pub fn set_draft(&self, thread_id: &str, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            self.clear_draft(thread_id);
            return;
        }

        {
            let mut state = self.shared.state.lock();
            if state.drafts.get(thread_id).is_some_and(|d| d.content == text) {
                return;
            }
            state.drafts.insert(
                thread_id.to_owned(),
                PersistedDraft {
                    content: text.clone(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
            );
            if self.writer.is_some() {
                state.pending.insert(thread_id.to_owned(), Edit::Set);
            }
        }

        if let Some(writer) = &self.writer {
            let _ = writer.send(WriterCmd::Schedule(Instant::now() + self.debounce));
        }
        self.notifier.notify(DraftChange {
            thread_id: thread_id.to_owned(),
            content: Some(text),
        });
    }

    /// Draft text for `thread_id`, from memory or else from storage.
    pub fn get_draft(&self, thread_id: &str) -> Option<String> {
        if let Some(draft) = self.shared.state.lock().drafts.get(thread_id) {
            return Some(draft.content.clone());
        }
        if self.writer.is_none() {
            return None;
        }
        self.shared
            .load()
            .remove(thread_id)
            .map(|d| d.content)
    }

    /// Drop the draft and its staged attachments and write immediately.
    pub fn clear_draft(&self, thread_id: &str) {
        let removed = {
            let mut state = self.shared.state.lock();
            state.attachments.remove(thread_id);
            let removed = state.drafts.remove(thread_id).is_some();
            if removed && self.writer.is_some() {
                state.pending.insert(
                    thread_id.to_owned(),
                    Edit::Cleared {
                        at: chrono::Utc::now().timestamp_millis(),
                    },
                );
            }
            removed
        };
        if !removed {
            return;
        }
        if self.writer.is_some() {
            self.shared.persist();
        }
        self.notifier.notify(DraftChange {
            thread_id: thread_id.to_owned(),
            content: None,
        });
    }

    pub fn stage_attachment(&self, thread_id: &str, attachment: Attachment) {
        self.shared
            .state
            .lock()
            .attachments
            .entry(thread_id.to_owned())
            .or_default()
            .push(attachment);
    }

    pub fn attachments(&self, thread_id: &str) -> Vec<Attachment> {
        self.shared
            .state
            .lock()
            .attachments
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove and return the staged attachments (used when sending).
    pub fn take_attachments(&self, thread_id: &str) -> Vec<Attachment> {
        self.shared
            .state
            .lock()
            .attachments
            .remove(thread_id)
            .unwrap_or_default()
    }

    /// Write pending drafts now and wait for the write to finish.
    pub async fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if writer.send(WriterCmd::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Reload drafts another instance wrote to the shared storage.  Returns
    /// the threads whose draft changed.
    pub fn refresh_from_storage(&self) -> Vec<String> {
        if self.writer.is_none() {
            return Vec::new();
        }
        let mut persisted = self.shared.load();
        let changes: Vec<DraftChange> = {
            let mut state = self.shared.state.lock();
            // Local edits not yet written are kept.
            overlay(&mut persisted, &state.drafts, &state.pending);
            let mut changes = Vec::new();
            for (thread_id, draft) in &persisted {
                if state.drafts.get(thread_id).map(|d| &d.content) != Some(&draft.content) {
                    changes.push(DraftChange {
                        thread_id: thread_id.clone(),
                        content: Some(draft.content.clone()),
                    });
                }
            }
            for thread_id in state.drafts.keys() {
                if !persisted.contains_key(thread_id) {
                    changes.push(DraftChange {
                        thread_id: thread_id.clone(),
                        content: None,
                    });
                }
            }
            state.drafts = persisted;
            changes
        };

        let ids = changes.iter().map(|c| c.thread_id.clone()).collect();
        for change in changes {
            self.notifier.notify(change);
        }
        ids
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&DraftChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.notifier.subscribe(listener)
    }
}

/// Debounced writer.  Exits (after a final write if one is pending) when the
/// store is dropped.
async fn run_writer(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<WriterCmd>) {
    let mut deadline: Option<Instant> = None;
    loop {
        let cmd = match deadline {
            Some(at) => tokio::select! {
                cmd = rx.recv() => cmd,
                _ = tokio::time::sleep_until(at) => {
                    deadline = None;
                    shared.persist();
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match cmd {
            Some(WriterCmd::Schedule(at)) => deadline = Some(at),
            Some(WriterCmd::Flush(done)) => {
                deadline = None;
                shared.persist();
                let _ = done.send(());
            }
            None => {
                if deadline.is_some() {
                    shared.persist();
                }
                break;
            }
        }
    }
    tracing::debug!("draft writer stopped");
}
