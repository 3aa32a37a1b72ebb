pub mod cancel;
pub mod turn;

pub use cancel::TurnMap;
pub use turn::{spawn_turn, TurnDeps};
