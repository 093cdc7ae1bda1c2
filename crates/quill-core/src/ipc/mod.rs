//! Kernel IPC: message types, wire framing, and the kernel process handle.

pub mod process;
pub mod protocol;

pub use process::{KernelLink, KernelProcess};
pub use protocol::{KernelMessage, KernelRequest};
