use std::sync::Arc;

use gl_threads::{Subscription, Thread, ThreadStore};

/// Calls a closure with the current thread whenever it changes.
///
/// Mutations of other threads are not reported; a thread switch is.
#[must_use = "dropping the adapter detaches the callback"]
#[derive(Debug)]
pub struct CallbackAdapter {
    subscription: Subscription,
}

impl CallbackAdapter {
    pub fn attach(
        store: &ThreadStore,
        callback: impl Fn(&Arc<Thread>) + Send + Sync + 'static,
    ) -> Self {
        let subscription = store.subscribe(move |snapshot| {
            if snapshot.changed.id == snapshot.current.id {
                callback(&snapshot.current);
            }
        });
        Self { subscription }
    }

    pub fn detach(self) {
        self.subscription.unsubscribe();
    }
}
