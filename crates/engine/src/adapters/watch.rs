use std::sync::Arc;

use tokio::sync::watch;

use gl_threads::{Subscription, Thread, ThreadStore};

/// The current thread as a `watch` signal.
pub struct WatchAdapter {
    rx: watch::Receiver<Arc<Thread>>,
    _subscription: Subscription,
}

impl WatchAdapter {
    pub fn new(store: &ThreadStore) -> Self {
        let (tx, rx) = watch::channel(store.current_thread());
        let subscription = store.subscribe(move |snapshot| {
            tx.send_if_modified(|current| {
                if Arc::ptr_eq(current, &snapshot.current) {
                    return false;
                }
                *current = Arc::clone(&snapshot.current);
                true
            });
        });
        Self {
            rx,
            _subscription: subscription,
        }
    }

    pub fn get(&self) -> Arc<Thread> {
        Arc::clone(&self.rx.borrow())
    }

    /// A receiver for tasks that await changes on their own.  It stops
    /// receiving updates once the adapter is dropped.
    pub fn receiver(&self) -> watch::Receiver<Arc<Thread>> {
        self.rx.clone()
    }

    /// Wait for the next change and return the new value.
    pub async fn changed(&mut self) -> Option<Arc<Thread>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gl_domain::message::{Message, MessagePatch};

    #[tokio::test]
    async fn follows_mutations() {
        let store = ThreadStore::new("test");
        let tid = store.current_thread_id();
        let mut adapter = WatchAdapter::new(&store);
        assert!(adapter.get().messages.is_empty());

        store.append_message(&tid, Message::agent().with_id("a")).unwrap();
        let next = adapter.changed().await.unwrap();
        assert_eq!(next.messages.len(), 1);

        store
            .update_message(&tid, "a", MessagePatch::AppendText("hi".into()))
            .unwrap();
        assert_eq!(adapter.get().messages[0].text(), "hi");
    }
}
