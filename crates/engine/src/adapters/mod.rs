//! Front-end bindings over the thread store.
//!
//! Every adapter is a thin shell around one store subscription; none keeps
//! conversation state of its own.  Pick the one that matches how the UI
//! framework consumes change:
//!
//! | Adapter | Shape |
//! |---|---|
//! | [`CallbackAdapter`] | imperative listener |
//! | [`WatchAdapter`] | signal / store (`watch::Receiver`) |
//! | [`ThreadStream`] | observable (`Stream` of snapshots) |
//! | [`Selector`] | external-store hook (`get_snapshot` + `subscribe`) |
//! | [`DraftWatch`] | signal over one thread's draft |

mod callback;
mod draft;
mod selector;
mod stream;
mod watch;

pub use callback::CallbackAdapter;
pub use draft::DraftWatch;
pub use selector::Selector;
pub use stream::ThreadStream;
pub use watch::WatchAdapter;
