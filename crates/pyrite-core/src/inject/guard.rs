//! # RAII Guard for Paused Targets
//!
//! [`PauseGuard`] stops every thread of the target and resumes them when
//! dropped, so an error or panic anywhere between pausing and resuming
//! still releases the target.
//!
//! The one case where the target must stay paused, an inferior call that
//! did not return, is handled by [`PauseGuard::disarm`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use pyrite_core::backend::{create_backend, ProcessControl};
//! use pyrite_core::inject::guard::PauseGuard;
//! use pyrite_core::types::{ProcessId, ThreadId};
//!
//! let mut backend = create_backend(None)?;
//! let handle = backend.attach(ProcessId::from(4242))?;
//! {
//!     let mut guard = PauseGuard::pause(&mut backend, &handle, ThreadId::from(4242))?;
//!     // Every thread is stopped here
//!     let registers = guard.backend_mut().thread_registers(&handle, ThreadId::from(4242))?;
//!     println!("pc = {}", registers.pc);
//!     // Dropping the guard resumes the target
//! }
//! # Ok::<(), pyrite_core::error::PyriteError>(())
//! ```

use tracing::{debug, warn};

use crate::backend::ProcessControl;
use crate::error::Result;
use crate::types::{ProcessHandle, ThreadId};

/// RAII guard that pauses the target and resumes it when dropped
///
/// The guard holds the only mutable borrow of the backend while it lives;
/// use [`backend`](Self::backend) and [`backend_mut`](Self::backend_mut) to
/// reach it.
pub struct PauseGuard<'a, B: ProcessControl + ?Sized>
{
    backend: &'a mut B,
    handle: &'a ProcessHandle,
    thread: ThreadId,
    active: bool,
}

impl<'a, B: ProcessControl + ?Sized> PauseGuard<'a, B>
{
    /// Stop every thread of the target, keeping `thread` callable
    ///
    /// ## Errors
    ///
    /// Returns `Control` if a thread could not be stopped. Threads that did
    /// stop are resumed before returning.
    pub fn pause(backend: &'a mut B, handle: &'a ProcessHandle, thread: ThreadId) -> Result<Self>
    {
        if let Err(err) = backend.pause_all_except(handle, thread) {
            if let Err(resume_err) = backend.resume_all(handle) {
                warn!(pid = %handle.pid(), error = %resume_err, "resume after failed pause also failed");
            }
            return Err(err.into());
        }
        debug!(pid = %handle.pid(), %thread, "target paused");

        Ok(Self {
            backend,
            handle,
            thread,
            active: true,
        })
    }

    /// The backend, for reads while paused
    pub fn backend(&self) -> &B
    {
        self.backend
    }

    /// The backend, for writes and calls while paused
    pub fn backend_mut(&mut self) -> &mut B
    {
        self.backend
    }

    /// Handle of the paused process
    pub fn handle(&self) -> &'a ProcessHandle
    {
        self.handle
    }

    /// The thread kept available for inferior calls
    pub fn thread(&self) -> ThreadId
    {
        self.thread
    }

    /// Resume the target now and report failure instead of logging it
    pub fn resume(mut self) -> Result<()>
    {
        self.active = false;
        self.backend.resume_all(self.handle)?;
        debug!(pid = %self.handle.pid(), "target resumed");
        Ok(())
    }

    /// Drop the guard without resuming; the target stays paused
    pub fn disarm(mut self)
    {
        self.active = false;
        warn!(pid = %self.handle.pid(), thread = %self.thread, "target left paused");
    }
}

impl<B: ProcessControl + ?Sized> Drop for PauseGuard<'_, B>
{
    fn drop(&mut self)
    {
        if self.active {
            if let Err(err) = self.backend.resume_all(self.handle) {
                warn!(pid = %self.handle.pid(), error = %err, "failed to resume target");
            }
        }
    }
}
