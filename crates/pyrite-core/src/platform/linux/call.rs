//! # Inferior Function Calls
//!
//! Runs one function on a stopped thread using the System V x86-64 calling
//! convention: up to six integer arguments in `rdi`, `rsi`, `rdx`, `rcx`,
//! `r8` and `r9`, result in `rax`.
//!
//! The return address pushed for the callee is 0. When the callee returns
//! the thread faults with `SIGSEGV` at `rip == 0`; the tracer sees the
//! fault before the target does, reads `rax` and restores the registers.
//!
//! The new stack frame starts below the red zone of the interrupted code
//! and is 16-byte aligned at the call boundary.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::thread;
use std::time::{Duration, Instant};

use libc::user_regs_struct;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use super::threads::{ThreadSet, TraceState, control_error};
use crate::backend::{BackendError, BackendResult, InvocationError};
use crate::types::Address;

/// Bytes below `rsp` the interrupted code may be using
const RED_ZONE: u64 = 128;
/// Extra room left between the interrupted frame and ours
const SCRATCH: u64 = 128;
const MAX_ARGS: usize = 6;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Registers set up for a call to `function` with `args`, on a stack below
/// the one in `saved`
pub fn call_registers(saved: &user_regs_struct, function: Address, args: &[u64]) -> user_regs_struct
{
    let mut regs = *saved;
    // rsp + 8 must be 16-byte aligned on entry
    regs.rsp = ((saved.rsp - RED_ZONE - SCRATCH) & !0xf) - 8;
    regs.rip = function.value();
    regs.rax = 0;
    // Keeps the kernel from restarting an interrupted syscall at our rip
    regs.orig_rax = u64::MAX;

    let slots = [
        &mut regs.rdi,
        &mut regs.rsi,
        &mut regs.rdx,
        &mut regs.rcx,
        &mut regs.r8,
        &mut regs.r9,
    ];
    for (slot, arg) in slots.into_iter().zip(args) {
        *slot = *arg;
    }
    regs
}

/// Call `function` on the stopped thread `tid`
pub fn invoke(
    threads: &mut ThreadSet,
    mem: &File,
    tid: Pid,
    function: Address,
    args: &[u64],
    timeout: Duration,
) -> BackendResult<u64>
{
    if args.len() > MAX_ARGS {
        return Err(InvocationError::Failed(format!(
            "{} arguments given; at most {MAX_ARGS} are passed in registers",
            args.len()
        ))
        .into());
    }
    if !threads.is_stopped(tid) {
        return Err(InvocationError::Failed(format!("thread {tid} is not stopped")).into());
    }

    let saved = ptrace::getregs(tid).map_err(|errno| control_error("PTRACE_GETREGS", tid, errno))?;
    let regs = call_registers(&saved, function, args);
    mem.write_all_at(&0u64.to_le_bytes(), regs.rsp)
        .map_err(|err| BackendError::Write {
            address: Address::new(regs.rsp),
            len: 8,
            reason: err.to_string(),
        })?;
    ptrace::setregs(tid, regs).map_err(|errno| control_error("PTRACE_SETREGS", tid, errno))?;

    trace!(%tid, %function, ?args, "calling into target");
    ptrace::cont(tid, None).map_err(|errno| control_error("PTRACE_CONT", tid, errno))?;
    threads.set_state(tid, TraceState::Running);

    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(tid, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    warn!(%tid, %function, ?timeout, "inferior call timed out");
                    threads.stop(tid)?;
                    return Err(InvocationError::TimedOut.into());
                }
                thread::sleep(POLL_INTERVAL);
            }
            Ok(WaitStatus::Stopped(_, signal)) if is_fault(signal) => {
                threads.set_state(tid, TraceState::Stopped);
                let current = ptrace::getregs(tid).map_err(|errno| control_error("PTRACE_GETREGS", tid, errno))?;
                ptrace::setregs(tid, saved).map_err(|errno| control_error("PTRACE_SETREGS", tid, errno))?;
                if signal == Signal::SIGSEGV && current.rip == 0 {
                    debug!(%tid, %function, result = current.rax, "inferior call returned");
                    return Ok(current.rax);
                }
                warn!(%tid, %function, %signal, rip = current.rip, "inferior call faulted");
                return Err(InvocationError::Faulted { signal: signal as i32 }.into());
            }
            Ok(WaitStatus::Stopped(_, signal)) => {
                threads.defer(signal);
                ptrace::cont(tid, None).map_err(|errno| control_error("PTRACE_CONT", tid, errno))?;
            }
            Ok(WaitStatus::PtraceEvent(..)) => {
                ptrace::cont(tid, None).map_err(|errno| control_error("PTRACE_CONT", tid, errno))?;
            }
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                threads.forget(tid);
                return Err(InvocationError::TargetExited.into());
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(errno) => return Err(control_error("waitpid", tid, errno)),
        }
    }
}

fn is_fault(signal: Signal) -> bool
{
    matches!(
        signal,
        Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGILL | Signal::SIGFPE | Signal::SIGABRT | Signal::SIGTRAP
    )
}
