//! Per-thread registry of running turns.
//!
//! Each running turn gets a [`CancellationToken`].  Cancelling it stops the
//! driver at its next suspension point; tool waits hang off child tokens so
//! they stop with it.  The driver task's handle is kept so a caller can
//! wait for the turn to drain.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use gl_domain::turn::TurnId;

struct ActiveTurn {
    turn_id: TurnId,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Tracks the running turn of every thread.
#[derive(Default)]
pub struct TurnMap {
    turns: Mutex<HashMap<String, ActiveTurn>>,
}

impl TurnMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register the token for a new turn on `thread_id`.
    pub fn register(&self, thread_id: &str, turn_id: &TurnId) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self.turns.lock().insert(
            thread_id.to_owned(),
            ActiveTurn {
                turn_id: turn_id.clone(),
                token: token.clone(),
                task: None,
            },
        );
        if let Some(previous) = previous {
            // A finished driver that has not removed itself yet.
            previous.token.cancel();
        }
        token
    }

    /// Keep the driver task for `turn_id`.  Dropped (the task detaches)
    /// when the turn already removed itself.
    pub fn attach(&self, thread_id: &str, turn_id: &TurnId, task: JoinHandle<()>) {
        if let Some(active) = self
            .turns
            .lock()
            .get_mut(thread_id)
            .filter(|a| &a.turn_id == turn_id)
        {
            active.task = Some(task);
        }
    }

    /// Cancel the running turn of `thread_id`.  Returns its id, or `None`
    /// when nothing is running.
    pub fn cancel(&self, thread_id: &str) -> Option<TurnId> {
        let turns = self.turns.lock();
        let active = turns.get(thread_id)?;
        active.token.cancel();
        Some(active.turn_id.clone())
    }

    /// Take the driver task so the caller can await it.
    pub fn take_task(&self, thread_id: &str) -> Option<JoinHandle<()>> {
        self.turns.lock().get_mut(thread_id)?.task.take()
    }

    /// Remove the entry for `turn_id` (called by the driver when it ends).
    /// An entry for a newer turn is left alone.
    pub fn remove(&self, thread_id: &str, turn_id: &TurnId) -> bool {
        let mut turns = self.turns.lock();
        if turns.get(thread_id).is_some_and(|a| &a.turn_id == turn_id) {
            turns.remove(thread_id);
            return true;
        }
        false
    }

    pub fn active_turn(&self, thread_id: &str) -> Option<TurnId> {
        self.turns.lock().get(thread_id).map(|a| a.turn_id.clone())
    }

    pub fn is_running(&self, thread_id: &str) -> bool {
        self.turns.lock().contains_key(thread_id)
    }

    pub fn len(&self) -> usize {
        self.turns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_cancel() {
        let map = TurnMap::new();
        let turn = TurnId::from("turn-1");
        let token = map.register("t1", &turn);
        assert!(!token.is_cancelled());
        assert!(map.is_running("t1"));

        assert_eq!(map.cancel("t1"), Some(turn.clone()));
        assert!(token.is_cancelled());

        assert!(map.remove("t1", &turn));
        assert!(!map.is_running("t1"));
        assert_eq!(map.cancel("t1"), None);
    }

    #[test]
    fn child_tokens_follow_the_turn() {
        let map = TurnMap::new();
        let token = map.register("t1", &TurnId::from("turn-1"));
        let tool_wait = token.child_token();
        map.cancel("t1");
        assert!(tool_wait.is_cancelled());
    }

    #[test]
    fn stale_remove_keeps_newer_turn() {
        let map = TurnMap::new();
        let old = TurnId::from("old");
        let new = TurnId::from("new");
        let old_token = map.register("t1", &old);
        map.register("t1", &new);

        // The old driver is told to stop and its late removal is a no-op.
        assert!(old_token.is_cancelled());
        assert!(!map.remove("t1", &old));
        assert_eq!(map.active_turn("t1"), Some(new));
    }

    #[test]
    fn threads_are_independent() {
        let map = TurnMap::new();
        let a = map.register("a", &TurnId::from("1"));
        let b = map.register("b", &TurnId::from("2"));
        map.cancel("a");
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn attached_task_can_be_awaited() {
        let map = TurnMap::new();
        let turn = TurnId::from("turn-1");
        let token = map.register("t1", &turn);
        let task = tokio::spawn(async move { token.cancelled().await });
        map.attach("t1", &turn, task);

        map.cancel("t1");
        let task = map.take_task("t1").unwrap();
        task.await.unwrap();
        assert!(map.take_task("t1").is_none());
    }
}
