//! # ptrace Thread Control
//!
//! Seizing, stopping and resuming the threads of a traced process.
//!
//! Threads are attached with `PTRACE_SEIZE`, which leaves them running.
//! Stopping uses `PTRACE_INTERRUPT` and waits for the matching
//! `PTRACE_EVENT_STOP`. Signals that arrive while we wait are swallowed and
//! remembered so they can be redelivered once the target resumes.
//!
//! ## ptrace APIs Used
//!
//! - **PTRACE_SEIZE**: attach without stopping
//! - **PTRACE_INTERRUPT**: stop a seized thread
//! - **PTRACE_CONT**: resume a stopped thread
//! - **PTRACE_DETACH**: release a stopped thread
//!
//! ## References
//!
//! - [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - [waitpid(2) man page](https://man7.org/linux/man-pages/man2/waitpid.2.html)

use std::collections::BTreeMap;
use std::fs;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::backend::{BackendError, BackendResult};

/// Whether a traced thread is currently held by us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState
{
    /// Seized and running
    Running,
    /// Stopped by `PTRACE_INTERRUPT` (or by a returning inferior call)
    Stopped,
}

/// The set of seized threads of one process and the signals swallowed
/// while stopping them
#[derive(Debug)]
pub struct ThreadSet
{
    pid: Pid,
    threads: BTreeMap<i32, TraceState>,
    pending: Vec<Signal>,
}

/// Kernel thread ids of `pid`, from `/proc/<pid>/task`
pub fn list_tasks(pid: Pid) -> std::io::Result<Vec<Pid>>
{
    let mut tids: Vec<i32> = fs::read_dir(format!("/proc/{pid}/task"))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .collect();
    tids.sort_unstable();
    Ok(tids.into_iter().map(Pid::from_raw).collect())
}

/// Build a `Control` error for a failed ptrace request on one thread
pub fn control_error(what: &str, tid: Pid, errno: Errno) -> BackendError
{
    BackendError::Control(format!("{what} on thread {tid}: {errno}"))
}

impl ThreadSet
{
    /// Empty set for `pid`
    pub fn new(pid: Pid) -> Self
    {
        Self {
            pid,
            threads: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    /// Seize one thread, leaving it running
    ///
    /// Returns `Ok(false)` if the thread exited before it could be seized.
    pub fn seize(&mut self, tid: Pid) -> Result<bool, Errno>
    {
        if self.contains(tid) {
            return Ok(true);
        }
        match ptrace::seize(tid, ptrace::Options::empty()) {
            Ok(()) => {
                trace!(%tid, "seized thread");
                self.threads.insert(tid.as_raw(), TraceState::Running);
                Ok(true)
            }
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(errno),
        }
    }

    /// Seize any thread created since the last scan
    ///
    /// Returns whether a new thread was found.
    pub fn rescan(&mut self) -> BackendResult<bool>
    {
        let tids = list_tasks(self.pid)
            .map_err(|err| BackendError::Control(format!("listing threads of {}: {err}", self.pid)))?;
        let mut found = false;
        for tid in tids {
            if self.contains(tid) {
                continue;
            }
            match self.seize(tid) {
                Ok(seized) => found |= seized,
                Err(errno) => return Err(control_error("PTRACE_SEIZE", tid, errno)),
            }
        }
        Ok(found)
    }

    /// Traced thread ids
    pub fn tids(&self) -> impl Iterator<Item = Pid> + '_
    {
        self.threads.keys().copied().map(Pid::from_raw)
    }

    /// Whether `tid` is traced by us
    pub fn contains(&self, tid: Pid) -> bool
    {
        self.threads.contains_key(&tid.as_raw())
    }

    /// Whether `tid` is traced and stopped
    pub fn is_stopped(&self, tid: Pid) -> bool
    {
        self.threads.get(&tid.as_raw()) == Some(&TraceState::Stopped)
    }

    /// Record a state change made outside this type
    pub fn set_state(&mut self, tid: Pid, state: TraceState)
    {
        if let Some(entry) = self.threads.get_mut(&tid.as_raw()) {
            *entry = state;
        }
    }

    /// Forget a thread that has exited
    pub fn forget(&mut self, tid: Pid)
    {
        self.threads.remove(&tid.as_raw());
    }

    /// Remember a signal to redeliver after resuming
    pub fn defer(&mut self, signal: Signal)
    {
        trace!(pid = %self.pid, %signal, "deferring signal");
        self.pending.push(signal);
    }

    /// Stop one running thread and wait until it reports the stop
    pub fn stop(&mut self, tid: Pid) -> BackendResult<()>
    {
        if self.is_stopped(tid) {
            return Ok(());
        }
        match ptrace::interrupt(tid) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                self.forget(tid);
                return Err(BackendError::Control(format!("thread {tid} exited")));
            }
            Err(errno) => return Err(control_error("PTRACE_INTERRUPT", tid, errno)),
        }
        self.wait_for_stop(tid)?;
        self.set_state(tid, TraceState::Stopped);
        Ok(())
    }

    /// Wait until `tid` enters an interrupt stop, swallowing and deferring
    /// any signal-delivery stops on the way
    pub fn wait_for_stop(&mut self, tid: Pid) -> BackendResult<()>
    {
        loop {
            match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP)) => return Ok(()),
                Ok(WaitStatus::Stopped(_, signal)) => {
                    self.defer(signal);
                    ptrace::cont(tid, None).map_err(|errno| control_error("PTRACE_CONT", tid, errno))?;
                }
                Ok(WaitStatus::PtraceEvent(..)) => {
                    ptrace::cont(tid, None).map_err(|errno| control_error("PTRACE_CONT", tid, errno))?;
                }
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                    self.forget(tid);
                    return Err(BackendError::Control(format!("thread {tid} exited")));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => return Err(control_error("waitpid", tid, errno)),
            }
        }
    }

    /// Stop every traced thread, picking up threads created meanwhile
    pub fn stop_all(&mut self) -> BackendResult<()>
    {
        loop {
            let tids: Vec<Pid> = self.tids().collect();
            for tid in tids {
                match self.stop(tid) {
                    Ok(()) => {}
                    // Exited while we were stopping it
                    Err(_) if !self.contains(tid) => {}
                    Err(err) => return Err(err),
                }
            }
            if !self.rescan()? {
                break;
            }
        }
        debug!(pid = %self.pid, threads = self.threads.len(), "all threads stopped");
        Ok(())
    }

    /// Resume every thread we stopped and redeliver deferred signals
    pub fn resume_all(&mut self) -> BackendResult<()>
    {
        let mut first_error = None;
        let stopped: Vec<Pid> = self
            .threads
            .iter()
            .filter(|(_, state)| **state == TraceState::Stopped)
            .map(|(tid, _)| Pid::from_raw(*tid))
            .collect();

        for tid in stopped {
            match ptrace::cont(tid, None) {
                Ok(()) => self.set_state(tid, TraceState::Running),
                Err(Errno::ESRCH) => self.forget(tid),
                Err(errno) => {
                    warn!(%tid, %errno, "failed to resume thread");
                    first_error.get_or_insert(control_error("PTRACE_CONT", tid, errno));
                }
            }
        }
        self.redeliver();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop and release every thread
    pub fn detach_all(&mut self) -> BackendResult<()>
    {
        let mut first_error = None;
        let tids: Vec<Pid> = self.tids().collect();
        for tid in tids {
            if let Err(err) = self.stop(tid) {
                if self.contains(tid) {
                    first_error.get_or_insert(err);
                }
                continue;
            }
            match ptrace::detach(tid, None) {
                Ok(()) | Err(Errno::ESRCH) => self.forget(tid),
                Err(errno) => {
                    first_error.get_or_insert(control_error("PTRACE_DETACH", tid, errno));
                }
            }
        }
        self.redeliver();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn redeliver(&mut self)
    {
        for signal in self.pending.drain(..) {
            if let Err(errno) = signal::kill(self.pid, signal) {
                warn!(pid = %self.pid, %signal, %errno, "failed to redeliver signal");
            }
        }
    }
}
