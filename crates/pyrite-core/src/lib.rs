//! # pyrite-core
//!
//! Live inspection of, and code injection into, running CPython
//! processes.
//!
//! This crate provides:
//! - Attaching to a process and identifying its runtime build
//! - Enumerating runtime threads and walking their frame stacks
//! - Reading locals, globals and builtins as typed values or lazy proxies
//! - Running source code inside the target on a chosen thread
//!
//! ## Layers
//!
//! - [`backend`]: the process-control trait the engine is written against
//! - [`platform`]: the Linux `ptrace` implementation of that trait
//! - [`layout`]: per-build struct offsets and type-object recognition
//! - [`value`]: turning remote objects into [`RemoteValue`]s
//! - [`walker`]: thread and frame enumeration
//! - [`inject`]: the injection state machine
//! - [`session`]: the [`SessionManager`] that ties them together
//!
//! ## Platform Support
//!
//! - **Linux x86-64**: `ptrace` and procfs
//! - Everything else compiles, but
//!   [`create_backend`](backend::create_backend) reports it unsupported
//!
//! ## No unsafe code
//!
//! Tracing goes through `nix`'s safe `ptrace` wrappers and target memory
//! through `/proc/<pid>/mem`, so this crate needs no `unsafe`.

pub mod backend;
pub mod error;
pub mod inject;
pub mod layout;
pub mod linetable;
pub mod memory;
pub mod platform;
pub mod prelude;
pub mod session;
pub mod types;
pub mod value;
pub mod walker;

pub use backend::{ProcessControl, create_backend};
// Re-export commonly used types
pub use error::{PyriteError, Result};
pub use inject::{InjectionRequest, InjectionResult};
pub use layout::BuildSignature;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use platform::linux::LinuxBackend;
pub use session::{AttachmentState, SessionManager};
pub use types::{Address, ProcessId, SessionId, ThreadId};
pub use value::{Proxy, RemoteValue, Scalar};
pub use walker::{CodeLocation, Frame, ThreadHandle};
