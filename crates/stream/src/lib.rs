//! Turn-level streaming primitives: the partial-value assembler that turns
//! out-of-order argument fragments into a growing props snapshot, and the
//! turn state machine.

pub mod assembler;
pub mod path;
pub mod turn;

pub use assembler::{Applied, AssemblyWarning, Fragment, PartialAssembler, MAX_ARRAY_INDEX};
pub use path::{ArgPath, Seg};
pub use turn::{Signal, TurnMachine};
