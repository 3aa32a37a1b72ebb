//! The session engine.
//!
//! [`Engine`] wires the capability registry, thread store, draft store, tool
//! coordinator and transport together behind a small control surface:
//! `send`, `cancel_active_turn`, `switch_thread` and `subscribe`.  Each sent
//! message starts one turn driver task (see [`crate::runtime::turn`]).

use std::sync::Arc;

use gl_capabilities::CapabilityRegistry;
use gl_domain::config::GlintConfig;
use gl_domain::error::{Error, Result};
use gl_domain::message::{Attachment, Message};
use gl_domain::turn::{TurnId, TurnState};
use gl_threads::{DraftStorage, DraftStore, StoreSnapshot, Subscription, Thread, ThreadStore};
use gl_tools::ToolCoordinator;

use crate::adapters::{CallbackAdapter, DraftWatch, Selector, ThreadStream, WatchAdapter};
use crate::runtime::{spawn_turn, TurnDeps, TurnMap};
use crate::transport::{Transport, TurnRequest};

pub struct Engine {
    deps: TurnDeps,
    drafts: Arc<DraftStore>,
}

impl Engine {
    /// Build an engine from config.  Must be called inside a Tokio runtime
    /// (the draft writer is a background task).
    pub fn new(
        config: &GlintConfig,
        transport: Arc<dyn Transport>,
        draft_storage: Arc<dyn DraftStorage>,
    ) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let store = Arc::new(ThreadStore::from_config(&config.threads));
        let tools = Arc::new(ToolCoordinator::new(
            Arc::clone(&registry),
            config.tools.clone(),
        ));
        let drafts = Arc::new(DraftStore::new(draft_storage, &config.drafts));

        tracing::debug!(
            context_key = %config.threads.context_key,
            tool_timeout_ms = config.tools.timeout_ms,
            drafts_enabled = config.drafts.enabled,
            "engine ready"
        );

        Self {
            deps: TurnDeps {
                store,
                registry,
                tools,
                transport,
                turns: Arc::new(TurnMap::new()),
            },
            drafts,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.deps.registry
    }

    pub fn store(&self) -> &Arc<ThreadStore> {
        &self.deps.store
    }

    pub fn drafts(&self) -> &Arc<DraftStore> {
        &self.drafts
    }

    pub fn tools(&self) -> &Arc<ToolCoordinator> {
        &self.deps.tools
    }

    pub fn current_thread(&self) -> Arc<Thread> {
        self.deps.store.current_thread()
    }

    // ── turn control ───────────────────────────────────────────────

    /// Send a user message on the current thread and start a turn.
    ///
    /// Attachments staged in the draft store are sent along with
    /// `attachments`, and the thread's draft is cleared.  Fails with
    /// [`Error::TurnActive`] while a turn is running on the thread.
    pub fn send(&self, text: impl Into<String>, attachments: Vec<Attachment>) -> Result<TurnId> {
        let text = text.into();
        let store = &self.deps.store;
        let thread_id = store.current_thread_id();

        if text.trim().is_empty()
            && attachments.is_empty()
            && self.drafts.attachments(&thread_id).is_empty()
        {
            return Err(Error::Validation("nothing to send".into()));
        }

        let turn_id = TurnId::new();
        store.begin_turn(&thread_id, &turn_id)?;

        let mut staged = self.drafts.take_attachments(&thread_id);
        staged.extend(attachments);
        let message = Message::user(text, staged);
        if let Err(e) = store.append_message(&thread_id, message.clone()) {
            if let Err(finish) =
                store.finish_turn(&thread_id, &turn_id, TurnState::Error, Some(e.to_string()))
            {
                tracing::warn!(error = %finish, "failed to roll back turn");
            }
            return Err(e);
        }
        self.drafts.clear_draft(&thread_id);

        let request = TurnRequest {
            thread_id: thread_id.clone(),
            turn_id: turn_id.clone(),
            context_key: store.context_key().to_owned(),
            message,
            capabilities: self.deps.registry.descriptors(),
        };
        let cancel = self.deps.turns.register(&thread_id, &turn_id);
        let task = spawn_turn(self.deps.clone(), request, cancel);
        self.deps.turns.attach(&thread_id, &turn_id, task);

        tracing::debug!(thread_id = %thread_id, turn_id = %turn_id, "message sent");
        Ok(turn_id)
    }

    /// Cancel the running turn of the current thread.  Its messages are
    /// frozen as they are.  Returns false when no turn was running.
    pub fn cancel_active_turn(&self) -> bool {
        let thread_id = self.deps.store.current_thread_id();
        self.cancel_turn(&thread_id)
    }

    fn cancel_turn(&self, thread_id: &str) -> bool {
        let Some(turn_id) = self.deps.turns.cancel(thread_id) else {
            return false;
        };
        // Recorded here rather than by the driver so the cancellation is
        // visible as soon as this returns.
        match self
            .deps
            .store
            .finish_turn(thread_id, &turn_id, TurnState::Cancelled, None)
        {
            Ok(finished) => {
                if finished {
                    tracing::info!(thread_id, turn_id = %turn_id, "turn cancelled");
                }
                finished
            }
            Err(e) => {
                tracing::warn!(thread_id, error = %e, "failed to record cancellation");
                false
            }
        }
    }

    /// Make `id` current, creating it if unknown.  A turn running on the
    /// current thread is cancelled and drained first.
    pub async fn switch_thread(&self, id: &str) -> Arc<Thread> {
        let current = self.deps.store.current_thread_id();
        if current != id {
            self.cancel_turn(&current);
            self.drain(&current).await;
        }
        self.deps.store.switch_thread(id).await
    }

    /// Wait for the current thread's turn driver (if any) to finish and
    /// return the thread.
    pub async fn wait_idle(&self) -> Arc<Thread> {
        let thread_id = self.deps.store.current_thread_id();
        self.drain(&thread_id).await;
        self.deps.store.current_thread()
    }

    async fn drain(&self, thread_id: &str) {
        if let Some(task) = self.deps.turns.take_task(thread_id) {
            if let Err(e) = task.await {
                tracing::warn!(thread_id, error = %e, "turn driver ended abnormally");
            }
        }
    }

    // ── bindings ───────────────────────────────────────────────────

    pub fn subscribe(
        &self,
        listener: impl Fn(&StoreSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.deps.store.subscribe(listener)
    }

    pub fn on_change(
        &self,
        callback: impl Fn(&Arc<Thread>) + Send + Sync + 'static,
    ) -> CallbackAdapter {
        CallbackAdapter::attach(&self.deps.store, callback)
    }

    pub fn watch(&self) -> WatchAdapter {
        WatchAdapter::new(&self.deps.store)
    }

    pub fn stream(&self) -> ThreadStream {
        ThreadStream::new(&self.deps.store)
    }

    pub fn select<T>(&self, project: impl Fn(&Thread) -> T + Send + Sync + 'static) -> Selector<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        Selector::new(Arc::clone(&self.deps.store), project)
    }

    pub fn draft_watch(&self, thread_id: &str) -> DraftWatch {
        DraftWatch::new(&self.drafts, thread_id)
    }
}
