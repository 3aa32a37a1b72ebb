use tokio::sync::watch;

use gl_threads::{DraftStore, Subscription};

/// One thread's draft text as a `watch` signal.
pub struct DraftWatch {
    rx: watch::Receiver<Option<String>>,
    _subscription: Subscription,
}

impl DraftWatch {
    pub fn new(drafts: &DraftStore, thread_id: &str) -> Self {
        let (tx, rx) = watch::channel(drafts.get_draft(thread_id));
        let thread_id = thread_id.to_owned();
        let subscription = drafts.subscribe(move |change| {
            if change.thread_id == thread_id {
                tx.send_replace(change.content.clone());
            }
        });
        Self {
            rx,
            _subscription: subscription,
        }
    }

    pub fn get(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    pub fn receiver(&self) -> watch::Receiver<Option<String>> {
        self.rx.clone()
    }

    /// Wait for the next change and return the new text.
    pub async fn changed(&mut self) -> Option<Option<String>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use gl_domain::config::DraftsConfig;
    use gl_threads::MemoryDraftStorage;

    #[tokio::test]
    async fn tracks_one_thread() {
        let drafts = DraftStore::new(Arc::new(MemoryDraftStorage::new()), &DraftsConfig::default());
        let mut watch = DraftWatch::new(&drafts, "t1");
        assert_eq!(watch.get(), None);

        drafts.set_draft("t2", "elsewhere");
        drafts.set_draft("t1", "hello");
        assert_eq!(watch.changed().await, Some(Some("hello".into())));

        drafts.clear_draft("t1");
        assert_eq!(watch.get(), None);
    }
}
