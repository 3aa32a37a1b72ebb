//! Conversation state for Glint.
//!
//! The [`ThreadStore`] is the single source of truth every front-end binding
//! reads from.  The [`DraftStore`] keeps unsent input per thread and persists
//! it on a debounce.

pub mod drafts;
pub mod notify;
pub mod store;

pub use drafts::{
    DraftChange, DraftStorage, DraftStore, FileDraftStorage, MemoryDraftStorage, PersistedDraft,
};
pub use notify::{Notifier, Subscription};
pub use store::{StoreSnapshot, Thread, ThreadStore};
