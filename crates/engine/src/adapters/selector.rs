use std::sync::Arc;

use parking_lot::Mutex;

use gl_threads::{Subscription, Thread, ThreadStore};

type Projection<T> = dyn Fn(&Thread) -> T + Send + Sync;

/// A projection of the current thread with change detection.
///
/// `get_snapshot` returns the same value for as long as the projection is
/// unchanged, and `subscribe` only fires when it changes, which is the
/// contract external-store hooks rely on to avoid redundant renders.
pub struct Selector<T> {
    store: Arc<ThreadStore>,
    project: Arc<Projection<T>>,
    /// Last thread seen by `get_snapshot` and its projection.
    cache: Mutex<Option<(Arc<Thread>, T)>>,
}

impl<T> Selector<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<ThreadStore>,
        project: impl Fn(&Thread) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            project: Arc::new(project),
            cache: Mutex::new(None),
        }
    }

    pub fn get_snapshot(&self) -> T {
        let thread = self.store.current_thread();
        let mut cache = self.cache.lock();
        if let Some((seen, value)) = cache.as_ref() {
            if Arc::ptr_eq(seen, &thread) {
                return value.clone();
            }
        }
        let value = (self.project)(&*thread);
        *cache = Some((thread, value.clone()));
        value
    }

    /// Call `on_change` with the new projection whenever it differs from
    /// the last one this subscription reported.
    pub fn subscribe(&self, on_change: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let project = Arc::clone(&self.project);
        let last = Mutex::new((project)(&*self.store.current_thread()));
        self.store.subscribe(move |snapshot| {
            let next = (project)(&*snapshot.current);
            {
                let mut last = last.lock();
                if *last == next {
                    return;
                }
                *last = next.clone();
            }
            on_change(&next);
        })
    }
}
