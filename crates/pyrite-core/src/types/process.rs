//! Process, thread and session identity types.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process identifier (PID)
///
/// ## Example
///
/// ```rust
/// use pyrite_core::types::ProcessId;
///
/// let pid = ProcessId::from(4242);
/// assert_eq!(u32::from(pid), 4242);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Operating-system thread identifier
///
/// On Linux this is the kernel TID. It is *not* the identity the runtime
/// reports for its threads (`threading.get_ident()`), which is the
/// `pthread_t` of the thread. See
/// [`ThreadHandle`](crate::walker::ThreadHandle) for the runtime identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Backend-issued token for one attachment
///
/// Handles are plain values; the backend keeps the live state (traced
/// threads, open memory file) and checks that a handle refers to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle
{
    pid: ProcessId,
}

impl ProcessHandle
{
    /// Create a handle for an attached process
    pub fn new(pid: ProcessId) -> Self
    {
        Self { pid }
    }

    /// PID of the attached process
    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Identity of one attach/detach lifetime
///
/// Every proxy and thread handle carries the id of the session that made
/// it. Ids are never reused within a process, so a handle from an earlier
/// session can't be mistaken for one from the current session, even after
/// reattaching to the same PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId
{
    /// Allocate a fresh, process-unique id
    pub fn next() -> Self
    {
        SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn value(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for SessionId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "session#{}", self.0)
    }
}
