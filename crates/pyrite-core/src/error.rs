//! # Error Types
//!
//! Error handling for inspection and injection.
//!
//! Every public operation returns [`Result`], whose error is a
//! [`PyriteError`]. The backend boundary has its own, narrower
//! [`BackendError`](crate::backend::BackendError), converted with `From` so
//! that `?` works across the seam.
//!
//! ## Which errors end a session?
//!
//! Most do not. Read failures, over-long frame chains and unknown threads
//! are local to the query that hit them. Attach and layout errors leave the
//! manager cleanly detached. [`PyriteError::TargetExited`] tears the session
//! down. [`PyriteError::InjectionTimeout`] leaves the target paused until
//! the caller force-detaches.

use std::time::Duration;

use thiserror::Error;

use crate::backend::{BackendError, InvocationError};
use crate::types::Address;

/// Main error type for Pyrite operations
///
/// ## Error Categories
///
/// 1. **Attach errors**: ProcessNotFound, PermissionDenied, AttachFailed
/// 2. **Layout errors**: UnsupportedBuild, MissingDebugInfo
/// 3. **Read errors**: RemoteRead, Malformed, FrameChainTooDeep, ThreadChainTooLong
/// 4. **Injection errors**: UnsafeInjectionPoint, InjectionTimeout, Invocation, InjectionStalled
/// 5. **Session errors**: NotAttached, StaleHandle, UnknownThread, Position, TargetExited
#[derive(Error, Debug)]
pub enum PyriteError
{
    /// The process with the given PID doesn't exist or has exited
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Insufficient permissions to trace the target process
    ///
    /// On Linux this usually means `kernel.yama.ptrace_scope` forbids
    /// attaching to non-children, or the target runs as another user.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Attaching failed for a reason other than a missing process or
    /// missing permissions
    #[error("Failed to attach to process: {0}")]
    AttachFailed(String),

    /// Operation requires an attached session
    #[error("Not attached to a process")]
    NotAttached,

    /// The runtime build mapped into the target has no known layout
    #[error("Unsupported runtime build: {0}")]
    UnsupportedBuild(String),

    /// A symbol needed to interpret the runtime could not be resolved
    ///
    /// Static symbols such as `interp_head` need an unstripped image or a
    /// separate symbol file.
    #[error("Missing debug info: cannot resolve `{0}`")]
    MissingDebugInfo(String),

    /// Reading target memory failed (unmapped or inaccessible)
    #[error("Failed to read {len} bytes at {address}: {reason}")]
    RemoteRead
    {
        /// First address of the failed read
        address: Address,
        /// Number of bytes requested
        len: usize,
        /// Backend-provided reason
        reason: String,
    },

    /// Writing target memory failed
    #[error("Failed to write {len} bytes at {address}: {reason}")]
    RemoteWrite
    {
        /// First address of the failed write
        address: Address,
        /// Number of bytes to be written
        len: usize,
        /// Backend-provided reason
        reason: String,
    },

    /// Memory was readable but does not hold a sane object
    #[error("Malformed remote object at {address}: {reason}")]
    Malformed
    {
        /// Address of the object
        address: Address,
        /// What was inconsistent
        reason: String,
    },

    /// A frame chain did not terminate within the traversal cap
    #[error("Frame chain exceeds {limit} frames")]
    FrameChainTooDeep
    {
        /// Configured cap
        limit: usize,
    },

    /// An interpreter or thread-state chain did not terminate within the cap
    #[error("Thread chain exceeds {limit} entries")]
    ThreadChainTooLong
    {
        /// Configured cap
        limit: usize,
    },

    /// The selected thread is inside a non-reentrant call
    #[error("Thread {thread:#x} is at an unsafe injection point: {reason}")]
    UnsafeInjectionPoint
    {
        /// Runtime thread identity
        thread: u64,
        /// Which range or condition matched
        reason: String,
    },

    /// An inferior call did not return within the configured timeout
    ///
    /// The target is left paused. Only a forced detach releases it.
    #[error("Injection did not finish within {timeout:?}; the target remains paused")]
    InjectionTimeout
    {
        /// Configured timeout
        timeout: Duration,
    },

    /// An inferior call failed or returned an unusable result
    #[error("Inferior call failed: {0}")]
    Invocation(String),

    /// A previous injection timed out and has not been cleared
    #[error("A previous injection stalled; force-detach to release the target")]
    InjectionStalled,

    /// A proxy or thread handle from a session that is no longer attached
    #[error("Stale handle: it belongs to a session that is no longer attached")]
    StaleHandle,

    /// No runtime thread with this identity exists in the target
    #[error("Unknown thread: {0:#x}")]
    UnknownThread(u64),

    /// Frame navigation moved past either end of the stack
    #[error("Invalid position: {0}")]
    Position(String),

    /// The target exited while attached
    #[error("Target process {pid} has exited")]
    TargetExited
    {
        /// PID of the exited process
        pid: u32,
    },

    /// Stopping or resuming target threads failed
    #[error("Thread control failed: {0}")]
    Control(String),

    /// The current platform has no process control backend
    #[error("Unsupported platform: {0}")]
    Unsupported(String),

    /// I/O error (reading an injected file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for PyriteError
{
    fn from(err: BackendError) -> Self
    {
        match err {
            BackendError::NotFound(pid) => PyriteError::ProcessNotFound(pid.0),
            BackendError::PermissionDenied { pid, reason } => {
                PyriteError::PermissionDenied(format!("PID {}: {reason}", pid.0))
            }
            BackendError::Attach(reason) => PyriteError::AttachFailed(reason),
            BackendError::Read { address, len, reason } => PyriteError::RemoteRead { address, len, reason },
            BackendError::Write { address, len, reason } => PyriteError::RemoteWrite { address, len, reason },
            BackendError::Symbol(name) => PyriteError::MissingDebugInfo(name),
            BackendError::Invocation(inner) => PyriteError::Invocation(inner.to_string()),
            BackendError::Control(reason) => PyriteError::Control(reason),
        }
    }
}

impl From<InvocationError> for PyriteError
{
    fn from(err: InvocationError) -> Self
    {
        PyriteError::Invocation(err.to_string())
    }
}

/// Convenience type alias for `Result<T, PyriteError>`
///
/// ```rust
/// use pyrite_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, PyriteError>;
