use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use gl_domain::stream::BoxStream;
use gl_threads::{Subscription, Thread, ThreadStore};

/// Snapshots buffered per stream before a slow consumer starts skipping.
const CAPACITY: usize = 64;

/// The current thread as an async stream of snapshots.
///
/// Yields the thread as it is when the stream is created, then one item per
/// change.  A consumer that falls more than [`CAPACITY`] snapshots behind
/// skips ahead; every item is a complete snapshot, so nothing is lost but
/// intermediate states.
pub struct ThreadStream {
    inner: BoxStream<'static, Arc<Thread>>,
    _subscription: Subscription,
}

impl ThreadStream {
    pub fn new(store: &ThreadStore) -> Self {
        let (tx, rx) = broadcast::channel(CAPACITY);
        let subscription = store.subscribe(move |snapshot| {
            if snapshot.changed.id == snapshot.current.id {
                // No receiver only while the stream is being dropped.
                let _ = tx.send(Arc::clone(&snapshot.current));
            }
        });

        let initial = store.current_thread();
        let inner = async_stream::stream! {
            let mut rx = rx;
            yield initial;
            loop {
                match rx.recv().await {
                    Ok(thread) => {
                        yield thread;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "thread stream consumer lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        Self {
            inner: Box::pin(inner),
            _subscription: subscription,
        }
    }
}

impl Stream for ThreadStream {
    type Item = Arc<Thread>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use gl_domain::message::Message;

    #[tokio::test]
    async fn yields_initial_then_changes() {
        let store = ThreadStore::new("test");
        let tid = store.current_thread_id();
        let mut stream = ThreadStream::new(&store);

        store.append_message(&tid, Message::agent()).unwrap();
        store.append_message(&tid, Message::agent()).unwrap();

        let counts: Vec<usize> = (&mut stream)
            .take(3)
            .map(|t| t.messages.len())
            .collect()
            .await;
        assert_eq!(counts, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn lagging_consumer_skips_to_newer_snapshots() {
        let store = ThreadStore::new("test");
        let tid = store.current_thread_id();
        let mut stream = ThreadStream::new(&store);
        assert_eq!(stream.next().await.unwrap().messages.len(), 0);

        for _ in 0..(CAPACITY + 10) {
            store.append_message(&tid, Message::agent()).unwrap();
        }
        let next = stream.next().await.unwrap();
        assert!(next.messages.len() > 10);
    }
}
