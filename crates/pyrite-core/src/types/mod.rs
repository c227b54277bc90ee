//! # Types
//!
//! Small value types shared by every layer: remote addresses, OS-level
//! process and thread ids, backend handles and session identity.

pub mod address;
pub mod process;

pub use address::Address;
pub use process::{ProcessHandle, ProcessId, SessionId, ThreadId};
