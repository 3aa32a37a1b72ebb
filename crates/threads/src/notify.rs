//! Push-based change notification.
//!
//! Listeners are always called with no store lock held.  A listener that
//! mutates the store re-entrantly does not recurse: the new notification is
//! queued and delivered after the current one has reached every listener,
//! so each listener sees snapshots in mutation order.
//!
//! Delivery is synchronous for the thread that starts it.  A `notify` from
//! another thread while a delivery is running only queues its value and
//! returns; the running delivery hands it to the listeners afterwards.
//!
//! A panicking listener is logged and skipped; the other listeners still
//! receive the value.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<T>>,
    draining: AtomicBool,
}

pub struct Notifier<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Notifier<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Queue `value` and deliver everything queued, unless a delivery is
    /// already in progress (on this thread or another), in which case that
    /// delivery picks it up.
    pub fn notify(&self, value: T) {
        let inner = &self.inner;
        inner.queue.lock().push_back(value);
        if inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }

        loop {
            let next = inner.queue.lock().pop_front();
            let Some(value) = next else {
                inner.draining.store(false, Ordering::Release);
                // Something may have been queued between the pop and the store.
                if inner.queue.lock().is_empty() || inner.draining.swap(true, Ordering::AcqRel) {
                    return;
                }
                continue;
            };

            let listeners: Vec<Listener<T>> = inner
                .listeners
                .lock()
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();
            for listener in listeners {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&value))) {
                    tracing::error!(panic = panic_message(&*panic), "change listener panicked");
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Keeps a listener registered.  Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
