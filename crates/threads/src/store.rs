//! Thread store.
//!
//! Holds every thread known to the client and which one is current.  Threads
//! are stored as `Arc<Thread>` and mutated copy-on-write, so a snapshot
//! handed to a subscriber is never changed underneath it.  Every mutation
//! runs inside one short critical section and is announced afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use gl_domain::config::ThreadsConfig;
use gl_domain::error::{Error, Result};
use gl_domain::message::{Message, MessagePatch};
use gl_domain::trace::TraceEvent;
use gl_domain::turn::{TurnId, TurnState};

use crate::notify::{Notifier, Subscription};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thread
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    pub id: String,
    pub context_key: String,
    pub messages: Vec<Message>,
    pub status: TurnState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_turn: Option<TurnId>,
    /// Reason of the last failed turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Thread {
    fn new(id: String, context_key: String) -> Self {
        Self {
            id,
            context_key,
            messages: Vec::new(),
            status: TurnState::Idle,
            active_turn: None,
            error: None,
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// A turn is in flight.
    pub fn is_busy(&self) -> bool {
        self.status.is_active()
    }

    fn message_mut(&mut self, id: &str) -> Result<&mut Message> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::MessageNotFound(id.to_owned()))
    }

    /// Sequenced messages stay in sequence order; optimistic ones go last.
    fn insert_ordered(&mut self, message: Message) {
        let pos = match message.sequence {
            Some(seq) => self
                .messages
                .iter()
                .position(|m| m.sequence.is_some_and(|s| s > seq))
                .unwrap_or(self.messages.len()),
            None => self.messages.len(),
        };
        self.messages.insert(pos, message);
    }
}

/// What subscribers receive after every mutation.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub version: u64,
    /// The thread the mutation touched.
    pub changed: Arc<Thread>,
    /// The current thread after the mutation.
    pub current: Arc<Thread>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StoreInner {
    threads: HashMap<String, Arc<Thread>>,
    current: String,
    version: u64,
}

impl StoreInner {
    fn current(&self) -> Arc<Thread> {
        // The current id always names a stored thread.
        Arc::clone(&self.threads[&self.current])
    }

    fn ensure(&mut self, id: &str, context_key: &str) -> bool {
        if self.threads.contains_key(id) {
            return false;
        }
        self.threads.insert(
            id.to_owned(),
            Arc::new(Thread::new(id.to_owned(), context_key.to_owned())),
        );
        true
    }

    fn snapshot_of(&mut self, changed: &str) -> StoreSnapshot {
        self.version += 1;
        StoreSnapshot {
            version: self.version,
            changed: Arc::clone(&self.threads[changed]),
            current: self.current(),
        }
    }
}

pub struct ThreadStore {
    context_key: String,
    inner: RwLock<StoreInner>,
    notifier: Notifier<StoreSnapshot>,
    version_tx: watch::Sender<u64>,
}

impl ThreadStore {
    /// A store holding one empty thread, which is current.
    pub fn new(context_key: impl Into<String>) -> Self {
        let context_key = context_key.into();
        let first = uuid::Uuid::new_v4().to_string();
        let mut threads = HashMap::new();
        threads.insert(
            first.clone(),
            Arc::new(Thread::new(first.clone(), context_key.clone())),
        );
        let (version_tx, _) = watch::channel(0);

        Self {
            context_key,
            inner: RwLock::new(StoreInner {
                threads,
                current: first,
                version: 0,
            }),
            notifier: Notifier::new(),
            version_tx,
        }
    }

    pub fn from_config(config: &ThreadsConfig) -> Self {
        Self::new(config.context_key.clone())
    }

    pub fn context_key(&self) -> &str {
        &self.context_key
    }

    pub fn current_thread(&self) -> Arc<Thread> {
        self.inner.read().current()
    }

    pub fn current_thread_id(&self) -> String {
        self.inner.read().current.clone()
    }

    pub fn thread(&self, id: &str) -> Option<Arc<Thread>> {
        self.inner.read().threads.get(id).cloned()
    }

    pub fn thread_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().threads.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Receiver that observes the store version; `changed().await` wakes on
    /// every mutation.
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&StoreSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.notifier.subscribe(listener)
    }

    /// Create an empty thread without switching to it.
    pub fn create_thread(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let snapshot = {
            let mut inner = self.inner.write();
            inner.ensure(&id, &self.context_key);
            inner.snapshot_of(&id)
        };
        self.publish(snapshot);
        id
    }

    /// Make `id` current, creating it if unknown.
    ///
    /// Waits until the current thread has no active turn first; callers
    /// that want the turn gone rather than finished cancel it before
    /// switching.
    pub async fn switch_thread(&self, id: &str) -> Arc<Thread> {
        let mut rx = self.version_tx.subscribe();
        let mut drained = false;

        loop {
            rx.borrow_and_update();
            let switched = {
                let mut inner = self.inner.write();
                if inner.current().is_busy() {
                    None
                } else {
                    let from = std::mem::replace(&mut inner.current, id.to_owned());
                    inner.ensure(id, &self.context_key);
                    Some((from, inner.snapshot_of(id)))
                }
            };

            if let Some((from, snapshot)) = switched {
                let current = Arc::clone(&snapshot.current);
                tracing::info!(from = %from, to = %id, drained, "thread switched");
                TraceEvent::ThreadSwitched {
                    from,
                    to: id.to_owned(),
                    drained,
                }
                .emit();
                self.publish(snapshot);
                return current;
            }

            drained = true;
            tracing::debug!(to = %id, "waiting for active turn to drain before switching");
            if rx.changed().await.is_err() {
                return self.current_thread();
            }
        }
    }

    /// Append a message.  A message whose idempotency token matches an
    /// existing message reconciles that message instead of duplicating it.
    pub fn append_message(&self, thread_id: &str, message: Message) -> Result<()> {
        let mut reconciled = None;
        self.mutate(thread_id, |thread| {
            if let Some(token) = message.idempotency_token.as_deref() {
                if let Some(existing) = thread
                    .messages
                    .iter_mut()
                    .find(|m| m.idempotency_token.as_deref() == Some(token))
                {
                    let Some(sequence) = message.sequence else {
                        return Ok(((), false));
                    };
                    let changed = existing.apply(MessagePatch::Acknowledge {
                        id: message.id.clone(),
                        sequence,
                    })?;
                    reconciled = Some((message.id.clone(), sequence));
                    return Ok(((), changed));
                }
            }
            thread.insert_ordered(message);
            Ok(((), true))
        })?;

        if let Some((message_id, sequence)) = reconciled {
            TraceEvent::MessageReconciled {
                thread_id: thread_id.to_owned(),
                message_id,
                sequence,
            }
            .emit();
        }
        Ok(())
    }

    /// Server acknowledged an optimistic message.  The message keeps its
    /// position and takes the server's id and sequence.  Returns false when
    /// no message carries `token`.
    pub fn reconcile(
        &self,
        thread_id: &str,
        token: &str,
        message_id: &str,
        sequence: u64,
    ) -> Result<bool> {
        let found = self.mutate(thread_id, |thread| {
            let Some(existing) = thread
                .messages
                .iter_mut()
                .find(|m| m.idempotency_token.as_deref() == Some(token))
            else {
                return Ok((false, false));
            };
            let changed = existing.apply(MessagePatch::Acknowledge {
                id: message_id.to_owned(),
                sequence,
            })?;
            Ok((true, changed))
        })?;

        if found {
            TraceEvent::MessageReconciled {
                thread_id: thread_id.to_owned(),
                message_id: message_id.to_owned(),
                sequence,
            }
            .emit();
        } else {
            tracing::debug!(thread_id, token, "acknowledgment for unknown message ignored");
        }
        Ok(found)
    }

    /// Apply a patch to one message.  Returns whether it changed.
    pub fn update_message(
        &self,
        thread_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<bool> {
        self.mutate(thread_id, |thread| {
            let changed = thread.message_mut(message_id)?.apply(patch)?;
            Ok((changed, changed))
        })
    }

    /// Mark a new turn as submitted.  Fails with [`Error::TurnActive`]
    /// while another turn is running on the thread.
    pub fn begin_turn(&self, thread_id: &str, turn_id: &TurnId) -> Result<()> {
        self.mutate(thread_id, |thread| {
            if thread.is_busy() {
                return Err(Error::TurnActive(thread_id.to_owned()));
            }
            thread.status = TurnState::Submitting;
            thread.active_turn = Some(turn_id.clone());
            thread.error = None;
            Ok(((), true))
        })
    }

    /// Record a non-terminal state for the active turn.  Writes from any
    /// other turn are ignored.
    pub fn set_turn_state(&self, thread_id: &str, turn_id: &TurnId, state: TurnState) -> Result<bool> {
        if state.is_terminal() {
            return self.finish_turn(thread_id, turn_id, state, None);
        }
        self.mutate(thread_id, |thread| {
            if thread.active_turn.as_ref() != Some(turn_id) || thread.status == state {
                return Ok((false, false));
            }
            thread.status = state;
            Ok((true, true))
        })
    }

    /// Append a message produced by `turn_id`.  Dropped (returns false)
    /// once that turn is no longer the active one, so a driver racing a
    /// cancellation cannot add content after the turn was frozen.
    pub fn append_turn_message(
        &self,
        thread_id: &str,
        turn_id: &TurnId,
        message: Message,
    ) -> Result<bool> {
        self.mutate(thread_id, |thread| {
            if thread.active_turn.as_ref() != Some(turn_id) {
                return Ok((false, false));
            }
            thread.insert_ordered(message.with_turn(turn_id));
            Ok((true, true))
        })
    }

    /// Move the active turn to a terminal state and freeze every message it
    /// produced, in one mutation.  A failure reason is attached to the
    /// thread and to those messages.  Returns false when `turn_id` is not
    /// the active turn (already finished, or superseded).
    pub fn finish_turn(
        &self,
        thread_id: &str,
        turn_id: &TurnId,
        state: TurnState,
        reason: Option<String>,
    ) -> Result<bool> {
        debug_assert!(state.is_terminal());
        self.mutate(thread_id, |thread| {
            if thread.active_turn.as_ref() != Some(turn_id) {
                return Ok((false, false));
            }
            thread.status = state;
            thread.active_turn = None;
            thread.error = reason.clone();

            let cancelled = state == TurnState::Cancelled;
            for message in thread
                .messages
                .iter_mut()
                .filter(|m| m.turn_id.as_ref() == Some(turn_id))
            {
                if let Some(reason) = &reason {
                    message.apply(MessagePatch::Fail {
                        reason: reason.clone(),
                    })?;
                }
                message.apply(MessagePatch::Freeze { cancelled })?;
            }
            Ok((true, true))
        })
    }

    // ── internals ──────────────────────────────────────────────────

    /// Run `f` against a private copy-on-write view of the thread.  `f`
    /// returns its output and whether the thread changed.
    fn mutate<R>(
        &self,
        thread_id: &str,
        f: impl FnOnce(&mut Thread) -> Result<(R, bool)>,
    ) -> Result<R> {
        let (out, snapshot) = {
            let mut inner = self.inner.write();
            let slot = inner
                .threads
                .get_mut(thread_id)
                .ok_or_else(|| Error::ThreadNotFound(thread_id.to_owned()))?;

            // Work on a copy so a failing patch leaves the stored thread intact.
            let mut draft = Thread::clone(slot);
            let (out, changed) = f(&mut draft)?;
            if !changed {
                return Ok(out);
            }
            *slot = Arc::new(draft);
            (out, inner.snapshot_of(thread_id))
        };
        self.publish(snapshot);
        Ok(out)
    }

    fn publish(&self, snapshot: StoreSnapshot) {
        self.version_tx.send_replace(snapshot.version);
        self.notifier.notify(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gl_domain::message::Role;
    use parking_lot::Mutex;

    fn store() -> ThreadStore {
        ThreadStore::new("test")
    }

    #[test]
    fn starts_with_one_idle_current_thread() {
        let store = store();
        let current = store.current_thread();
        assert_eq!(current.status, TurnState::Idle);
        assert_eq!(store.thread_ids(), vec![current.id.clone()]);
        assert_eq!(current.context_key, "test");
    }

    #[test]
    fn append_and_patch() {
        let store = store();
        let tid = store.current_thread_id();
        let msg = Message::agent().with_id("m1");
        store.append_message(&tid, msg).unwrap();
        assert!(store
            .update_message(&tid, "m1", MessagePatch::AppendText("hi".into()))
            .unwrap());
        assert_eq!(store.current_thread().messages[0].text(), "hi");

        let err = store
            .update_message(&tid, "nope", MessagePatch::AppendText("x".into()))
            .unwrap_err();
        assert!(matches!(err, Error::MessageNotFound(_)));
        assert!(matches!(
            store.append_message("missing", Message::agent()),
            Err(Error::ThreadNotFound(_))
        ));
    }

    #[test]
    fn snapshots_are_immutable() {
        let store = store();
        let tid = store.current_thread_id();
        store.append_message(&tid, Message::agent().with_id("m1")).unwrap();
        let before = store.current_thread();
        store
            .update_message(&tid, "m1", MessagePatch::AppendText("later".into()))
            .unwrap();
        assert_eq!(before.messages[0].text(), "");
        assert_eq!(store.current_thread().messages[0].text(), "later");
    }

    #[test]
    fn sequenced_messages_sort_and_optimistic_go_last() {
        let store = store();
        let tid = store.current_thread_id();
        store.append_message(&tid, Message::agent().with_id("s2").with_sequence(2)).unwrap();
        store.append_message(&tid, Message::user("hi", vec![]).with_id("opt")).unwrap();
        store.append_message(&tid, Message::agent().with_id("s1").with_sequence(1)).unwrap();
        store.append_message(&tid, Message::agent().with_id("s3").with_sequence(3)).unwrap();

        let ids: Vec<String> = store.current_thread().messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, ["s1", "s2", "opt", "s3"]);
    }

    #[test]
    fn server_echo_reconciles_in_place() {
        let store = store();
        let tid = store.current_thread_id();
        let optimistic = Message::user("hello", vec![]);
        let token = optimistic.idempotency_token.clone().unwrap();
        store.append_message(&tid, optimistic.clone()).unwrap();
        store.append_message(&tid, Message::agent().with_id("reply")).unwrap();

        let mut echo = optimistic.with_id("srv-1").with_sequence(10);
        echo.idempotency_token = Some(token.clone());
        store.append_message(&tid, echo).unwrap();

        let thread = store.current_thread();
        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.messages[0].id, "srv-1");
        assert_eq!(thread.messages[0].sequence, Some(10));
        assert_eq!(thread.messages[0].role, Role::User);

        // A second acknowledgment for the same token is a no-op.
        let version = store.version();
        assert!(store.reconcile(&tid, &token, "srv-1", 10).unwrap());
        assert_eq!(store.version(), version);
        assert!(!store.reconcile(&tid, "other", "x", 1).unwrap());
    }

    #[test]
    fn one_active_turn_per_thread() {
        let store = store();
        let tid = store.current_thread_id();
        let t1 = TurnId::new();
        store.begin_turn(&tid, &t1).unwrap();
        let err = store.begin_turn(&tid, &TurnId::new()).unwrap_err();
        assert!(matches!(err, Error::TurnActive(_)));

        store.finish_turn(&tid, &t1, TurnState::Complete, None).unwrap();
        assert!(store.begin_turn(&tid, &TurnId::new()).is_ok());
    }

    #[test]
    fn late_writes_from_finished_turn_are_ignored() {
        let store = store();
        let tid = store.current_thread_id();
        let turn = TurnId::new();
        store.begin_turn(&tid, &turn).unwrap();
        assert!(store
            .append_turn_message(&tid, &turn, Message::agent().with_id("a"))
            .unwrap());
        store
            .update_message(&tid, "a", MessagePatch::AppendText("partial".into()))
            .unwrap();

        assert!(store
            .finish_turn(&tid, &turn, TurnState::Cancelled, None)
            .unwrap());
        assert!(!store.set_turn_state(&tid, &turn, TurnState::GeneratingText).unwrap());
        assert!(!store.finish_turn(&tid, &turn, TurnState::Complete, None).unwrap());
        assert!(!store
            .append_turn_message(&tid, &turn, Message::agent().with_id("late"))
            .unwrap());
        assert_eq!(store.current_thread().messages.len(), 1);

        let thread = store.current_thread();
        assert_eq!(thread.status, TurnState::Cancelled);
        assert!(thread.messages[0].cancelled);
        assert!(matches!(
            store.update_message(&tid, "a", MessagePatch::AppendText("more".into())),
            Err(Error::MessageFrozen(_))
        ));
        assert_eq!(store.current_thread().messages[0].text(), "partial");
    }

    #[test]
    fn error_reason_labels_thread_and_messages() {
        let store = store();
        let tid = store.current_thread_id();
        let turn = TurnId::new();
        store.begin_turn(&tid, &turn).unwrap();
        store
            .append_turn_message(&tid, &turn, Message::agent().with_id("a"))
            .unwrap();
        store.append_message(&tid, Message::agent().with_id("other")).unwrap();
        store
            .finish_turn(&tid, &turn, TurnState::Error, Some("disconnected".into()))
            .unwrap();
        let thread = store.current_thread();
        assert_eq!(thread.error.as_deref(), Some("disconnected"));
        assert_eq!(thread.messages[0].error.as_deref(), Some("disconnected"));
        assert!(thread.messages[0].frozen);
        // Messages from outside the turn are left alone.
        assert!(thread.messages[1].error.is_none());
        assert!(!thread.messages[1].frozen);
    }

    #[test]
    fn subscribers_see_consistent_snapshots_in_order() {
        let store = Arc::new(store());
        let tid = store.current_thread_id();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        let _sub = store.subscribe(move |snap| {
            s.lock().push((snap.version, snap.changed.messages.len()));
        });

        store.append_message(&tid, Message::agent().with_id("a")).unwrap();
        store.append_message(&tid, Message::agent().with_id("b")).unwrap();
        assert_eq!(*seen.lock(), vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn listener_may_mutate_store() {
        let store = Arc::new(store());
        let tid = store.current_thread_id();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (st, t, s) = (Arc::clone(&store), tid.clone(), Arc::clone(&seen));
        let _sub = store.subscribe(move |snap| {
            s.lock().push(snap.changed.messages.len());
            if snap.changed.messages.len() == 1 {
                st.append_message(&t, Message::agent().with_id("echo")).unwrap();
            }
        });

        store.append_message(&tid, Message::agent().with_id("a")).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(store.current_thread().messages.len(), 2);
    }

    #[test]
    fn faulty_listener_does_not_stop_updates() {
        let store = store();
        let tid = store.current_thread_id();
        let _bad = store.subscribe(|_| panic!("render failed"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _good = store.subscribe(move |snap| s.lock().push(snap.changed.messages.len()));

        store.append_message(&tid, Message::agent().with_id("a")).unwrap();
        store.append_message(&tid, Message::agent().with_id("b")).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn switch_creates_unknown_thread() {
        let store = store();
        let first = store.current_thread_id();
        let switched = store.switch_thread("t2").await;
        assert_eq!(switched.id, "t2");
        assert_eq!(store.current_thread_id(), "t2");
        assert!(store.thread(&first).is_some());
    }

    #[tokio::test]
    async fn switch_waits_for_active_turn_to_drain() {
        let store = Arc::new(store());
        let tid = store.current_thread_id();
        let turn = TurnId::new();
        store.begin_turn(&tid, &turn).unwrap();

        let s = Arc::clone(&store);
        let switch = tokio::spawn(async move { s.switch_thread("next").await.id.clone() });

        tokio::task::yield_now().await;
        assert_eq!(store.current_thread_id(), tid);

        store.finish_turn(&tid, &turn, TurnState::Complete, None).unwrap();
        assert_eq!(switch.await.unwrap(), "next");
        assert_eq!(store.current_thread_id(), "next");
    }
}
