//! # Process Control Backend
//!
//! The narrow interface the inspection engine consumes from whatever
//! actually controls the target: attaching, stopping threads, moving bytes
//! and running a function on a target thread.
//!
//! Everything above this trait is platform-agnostic. The Linux
//! implementation lives in [`crate::platform::linux`]; tests drive the
//! engine through an in-memory fake.
//!
//! ## Thread-stop semantics
//!
//! [`pause_all_except`](ProcessControl::pause_all_except) stops **every**
//! thread. The named thread is stopped as well, but it is the one thread
//! that [`invoke_inferior_function`](ProcessControl::invoke_inferior_function)
//! may advance; all others stay held until
//! [`resume_all`](ProcessControl::resume_all).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::error::Result;
use crate::types::{Address, ProcessHandle, ProcessId, ThreadId};

/// A resolved symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol
{
    /// Symbol name as found in the symbol table
    pub name: String,
    /// Relocated address in the target
    pub address: Address,
    /// Extent in bytes (0 when the table doesn't say)
    pub size: u64,
}

impl Symbol
{
    /// Whether `address` falls inside this symbol's extent
    ///
    /// Zero-sized symbols only contain their own start address.
    pub fn contains(&self, address: Address) -> bool
    {
        let start = self.address.value();
        let end = start.saturating_add(self.size.max(1));
        (start..end).contains(&address.value())
    }
}

/// Registers needed by the unsafe-point check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRegisters
{
    /// Program counter
    pub pc: Address,
    /// Stack pointer
    pub sp: Address,
}

/// Why an inferior call did not produce a return value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError
{
    /// The call did not return before the deadline; the thread is left
    /// stopped mid-call
    #[error("inferior call timed out")]
    TimedOut,

    /// The thread took a fatal signal during the call; its registers have
    /// been restored
    #[error("inferior call faulted with signal {signal}")]
    Faulted
    {
        /// Signal number
        signal: i32,
    },

    /// The target exited during the call
    #[error("target exited during inferior call")]
    TargetExited,

    /// Any other failure setting up or completing the call
    #[error("{0}")]
    Failed(String),
}

/// Errors at the backend boundary
#[derive(Error, Debug)]
pub enum BackendError
{
    /// The PID doesn't exist
    #[error("process {0} not found")]
    NotFound(ProcessId),

    /// The OS refused to let us trace the process
    #[error("permission denied tracing {pid}: {reason}")]
    PermissionDenied
    {
        /// Target PID
        pid: ProcessId,
        /// OS-provided reason
        reason: String,
    },

    /// Attach failed for another reason
    #[error("attach failed: {0}")]
    Attach(String),

    /// Memory read failed
    #[error("read of {len} bytes at {address} failed: {reason}")]
    Read
    {
        /// First address
        address: Address,
        /// Requested length
        len: usize,
        /// OS-provided reason
        reason: String,
    },

    /// Memory write failed
    #[error("write of {len} bytes at {address} failed: {reason}")]
    Write
    {
        /// First address
        address: Address,
        /// Length
        len: usize,
        /// OS-provided reason
        reason: String,
    },

    /// No symbol with this name in any mapped image
    #[error("symbol `{0}` not found")]
    Symbol(String),

    /// Inferior call failure
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// Stopping, resuming or inspecting a thread failed
    #[error("thread control failed: {0}")]
    Control(String),
}

/// Convenience alias for backend results
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Process control primitives consumed by the engine
///
/// Implementations are **not** expected to be thread-safe: the session
/// manager serialises every call behind its own lock.
pub trait ProcessControl
{
    /// Attach to a running process without stopping it
    ///
    /// ## Errors
    ///
    /// - `NotFound`: the PID doesn't exist
    /// - `PermissionDenied`: tracing is not allowed
    /// - `Attach`: anything else
    fn attach(&mut self, pid: ProcessId) -> BackendResult<ProcessHandle>;

    /// Release the process and all of its threads
    ///
    /// ## Errors
    ///
    /// Returns `Control` if a thread could not be released.
    fn detach(&mut self, handle: &ProcessHandle) -> BackendResult<()>;

    /// Whether the attached process still exists
    fn is_alive(&self, handle: &ProcessHandle) -> bool;

    /// OS-level thread ids of the process
    ///
    /// ## Errors
    ///
    /// Returns `Control` if the thread list can't be read.
    fn list_os_threads(&self, handle: &ProcessHandle) -> BackendResult<Vec<ThreadId>>;

    /// Read exactly `len` bytes at `address`
    ///
    /// ## Errors
    ///
    /// Returns `Read` if any byte of the range is unmapped or unreadable.
    /// Never returns a short or partially garbage buffer.
    fn read_memory(&self, handle: &ProcessHandle, address: Address, len: usize) -> BackendResult<Vec<u8>>;

    /// Write `data` at `address`
    ///
    /// ## Errors
    ///
    /// Returns `Write` if the range isn't writable.
    fn write_memory(&mut self, handle: &ProcessHandle, address: Address, data: &[u8]) -> BackendResult<()>;

    /// Look up a symbol by exact name, relocated into the target
    ///
    /// ## Errors
    ///
    /// Returns `Symbol` if no mapped image (or configured symbol file)
    /// defines it.
    fn resolve_symbol(&self, handle: &ProcessHandle, name: &str) -> BackendResult<Symbol>;

    /// Paths of the file-backed images mapped into the process, in mapping
    /// order
    ///
    /// ## Errors
    ///
    /// Returns `Control` if the mapping list can't be read.
    fn mapped_images(&self, handle: &ProcessHandle) -> BackendResult<Vec<PathBuf>>;

    /// Stop all threads, keeping `thread` available for inferior calls
    ///
    /// ## Errors
    ///
    /// Returns `Control` if a thread could not be stopped. Threads already
    /// stopped by this call stay stopped; call `resume_all` to release them.
    fn pause_all_except(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<()>;

    /// Resume every thread stopped by `pause_all_except`
    ///
    /// ## Errors
    ///
    /// Returns `Control` if a thread could not be resumed.
    fn resume_all(&mut self, handle: &ProcessHandle) -> BackendResult<()>;

    /// Program counter and stack pointer of one thread
    ///
    /// A running thread is stopped briefly to read them.
    ///
    /// ## Errors
    ///
    /// Returns `Control` if the thread can't be inspected.
    fn thread_registers(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<ThreadRegisters>;

    /// The thread pointer of one thread
    ///
    /// On glibc x86-64 this is `fs_base`, which equals `pthread_self()` and
    /// therefore the runtime's own thread identity.
    ///
    /// ## Errors
    ///
    /// Returns `Control` if the thread can't be inspected.
    fn thread_pointer(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<u64>;

    /// Call the function at `function` on `thread` with integer/pointer
    /// arguments and return its integer result
    ///
    /// The thread must have been stopped by `pause_all_except`. Its
    /// registers are restored after the call returns or faults. On timeout
    /// they are not: the thread stays stopped inside the callee.
    ///
    /// ## Errors
    ///
    /// Returns `Invocation` with the specific [`InvocationError`].
    fn invoke_inferior_function(
        &mut self,
        handle: &ProcessHandle,
        thread: ThreadId,
        function: Address,
        args: &[u64],
        timeout: Duration,
    ) -> BackendResult<u64>;
}

impl<P: ProcessControl + ?Sized> ProcessControl for Box<P>
{
    fn attach(&mut self, pid: ProcessId) -> BackendResult<ProcessHandle>
    {
        (**self).attach(pid)
    }

    fn detach(&mut self, handle: &ProcessHandle) -> BackendResult<()>
    {
        (**self).detach(handle)
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool
    {
        (**self).is_alive(handle)
    }

    fn list_os_threads(&self, handle: &ProcessHandle) -> BackendResult<Vec<ThreadId>>
    {
        (**self).list_os_threads(handle)
    }

    fn read_memory(&self, handle: &ProcessHandle, address: Address, len: usize) -> BackendResult<Vec<u8>>
    {
        (**self).read_memory(handle, address, len)
    }

    fn write_memory(&mut self, handle: &ProcessHandle, address: Address, data: &[u8]) -> BackendResult<()>
    {
        (**self).write_memory(handle, address, data)
    }

    fn resolve_symbol(&self, handle: &ProcessHandle, name: &str) -> BackendResult<Symbol>
    {
        (**self).resolve_symbol(handle, name)
    }

    fn mapped_images(&self, handle: &ProcessHandle) -> BackendResult<Vec<PathBuf>>
    {
        (**self).mapped_images(handle)
    }

    fn pause_all_except(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<()>
    {
        (**self).pause_all_except(handle, thread)
    }

    fn resume_all(&mut self, handle: &ProcessHandle) -> BackendResult<()>
    {
        (**self).resume_all(handle)
    }

    fn thread_registers(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<ThreadRegisters>
    {
        (**self).thread_registers(handle, thread)
    }

    fn thread_pointer(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<u64>
    {
        (**self).thread_pointer(handle, thread)
    }

    fn invoke_inferior_function(
        &mut self,
        handle: &ProcessHandle,
        thread: ThreadId,
        function: Address,
        args: &[u64],
        timeout: Duration,
    ) -> BackendResult<u64>
    {
        (**self).invoke_inferior_function(handle, thread, function, args, timeout)
    }
}

/// Create the process control backend for the current platform
///
/// `symbol_file` is an optional separate debug-symbol file for the runtime
/// image.
///
/// ## Errors
///
/// Returns [`PyriteError::Unsupported`](crate::error::PyriteError::Unsupported)
/// on platforms without a backend (anything but Linux x86-64).
///
/// ## Example
///
/// ```rust,no_run
/// use pyrite_core::backend::create_backend;
/// use pyrite_core::SessionManager;
/// use pyrite_utils::InspectorConfig;
///
/// let config = InspectorConfig::default();
/// let backend = create_backend(config.symbol_file.clone())?;
/// let manager = SessionManager::new(backend, config);
/// # Ok::<(), pyrite_core::error::PyriteError>(())
/// ```
pub fn create_backend(symbol_file: Option<PathBuf>) -> Result<Box<dyn ProcessControl>>
{
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        Ok(Box::new(crate::platform::linux::LinuxBackend::new(symbol_file)))
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        let _ = symbol_file;
        Err(crate::error::PyriteError::Unsupported(format!(
            "no process control backend for {}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )))
    }
}
