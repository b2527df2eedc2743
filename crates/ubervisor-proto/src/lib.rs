//! Wire vocabulary shared by the ubervisor daemon and its clients:
//! chunk framing, command mnemonics and the JSON bodies that travel
//! inside chunks.

pub mod command;
pub mod frame;
pub mod wire;

pub use command::Command;
pub use frame::{Message, CHUNKEXT, CHUNKSIZ};
pub use wire::{GroupSpec, GroupStatus};
