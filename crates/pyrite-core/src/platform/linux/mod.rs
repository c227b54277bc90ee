//! # Linux Process Control
//!
//! [`LinuxBackend`] implements [`ProcessControl`] with `ptrace` and procfs.
//!
//! - Threads are seized with `PTRACE_SEIZE` and stopped on demand
//!   ([`threads`]).
//! - Memory goes through `/proc/<pid>/mem`, which reads and writes whole
//!   ranges with one `pread`/`pwrite` and fails instead of returning
//!   partial data.
//! - Images come from `/proc/<pid>/maps` ([`maps`]); symbols from their
//!   ELF tables ([`symbols`]).
//! - Inferior calls run on a stopped thread ([`call`]).
//!
//! ## The tracer thread
//!
//! The kernel ties a tracee to the *thread* that attached it. Every
//! ptrace request must come from that same thread, so a `LinuxBackend`
//! has to be used from the thread that called [`attach`](ProcessControl::attach).
//! The CLI is single-threaded; embedders that move a session between
//! threads will see `ESRCH` from every ptrace request.
//!
//! ## Permissions
//!
//! With `kernel.yama.ptrace_scope = 1` (the default on most distributions)
//! only ancestors may attach. Run as root, grant `CAP_SYS_PTRACE`, or lower
//! the scope to 0.

pub mod call;
pub mod maps;
pub mod symbols;
pub mod threads;

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::Duration;

use libc::user_regs_struct;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use self::symbols::SymbolIndex;
use self::threads::{ThreadSet, control_error, list_tasks};
use crate::backend::{BackendError, BackendResult, ProcessControl, Symbol, ThreadRegisters};
use crate::types::{Address, ProcessHandle, ProcessId, ThreadId};

/// State of one traced process
struct Traced
{
    pid: Pid,
    mem: File,
    threads: ThreadSet,
    symbols: OnceCell<SymbolIndex>,
}

/// `ptrace`-based process control for Linux x86-64
///
/// One backend traces at most one process at a time.
///
/// ## Example
///
/// ```rust,no_run
/// use pyrite_core::backend::ProcessControl;
/// use pyrite_core::platform::linux::LinuxBackend;
/// use pyrite_core::types::ProcessId;
///
/// let mut backend = LinuxBackend::new(None);
/// let handle = backend.attach(ProcessId::from(4242))?;
/// for image in backend.mapped_images(&handle)? {
///     println!("{}", image.display());
/// }
/// backend.detach(&handle)?;
/// # Ok::<(), pyrite_core::backend::BackendError>(())
/// ```
pub struct LinuxBackend
{
    symbol_file: Option<PathBuf>,
    traced: Option<Traced>,
}

impl LinuxBackend
{
    /// Create a backend; `symbol_file` supplements the runtime image's
    /// symbols
    pub fn new(symbol_file: Option<PathBuf>) -> Self
    {
        Self {
            symbol_file,
            traced: None,
        }
    }

    fn traced(&self, handle: &ProcessHandle) -> BackendResult<&Traced>
    {
        match &self.traced {
            Some(traced) if traced.pid.as_raw() as u32 == handle.pid().0 => Ok(traced),
            _ => Err(BackendError::Control(format!("process {} is not attached", handle.pid()))),
        }
    }

    fn traced_mut(&mut self, handle: &ProcessHandle) -> BackendResult<&mut Traced>
    {
        match &mut self.traced {
            Some(traced) if traced.pid.as_raw() as u32 == handle.pid().0 => Ok(traced),
            _ => Err(BackendError::Control(format!("process {} is not attached", handle.pid()))),
        }
    }

    /// Registers of one thread, stopping it briefly if it is running
    fn registers(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<user_regs_struct>
    {
        let traced = self.traced_mut(handle)?;
        let tid = tid_of(thread);
        if !traced.threads.contains(tid) {
            traced.threads.rescan()?;
            if !traced.threads.contains(tid) {
                return Err(BackendError::Control(format!("thread {thread} is not part of {}", traced.pid)));
            }
        }

        if traced.threads.is_stopped(tid) {
            return ptrace::getregs(tid).map_err(|errno| control_error("PTRACE_GETREGS", tid, errno));
        }

        traced.threads.stop(tid)?;
        let regs = ptrace::getregs(tid).map_err(|errno| control_error("PTRACE_GETREGS", tid, errno));
        let resumed = ptrace::cont(tid, None).map_err(|errno| control_error("PTRACE_CONT", tid, errno));
        traced.threads.set_state(tid, threads::TraceState::Running);
        let regs = regs?;
        resumed?;
        Ok(regs)
    }
}

fn tid_of(thread: ThreadId) -> Pid
{
    Pid::from_raw(thread.raw() as i32)
}

/// Whether `pid` exists and is not a zombie
fn process_alive(pid: Pid) -> bool
{
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state follows the parenthesised command name, which may contain
    // spaces and parentheses itself
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next())
        .is_some_and(|state| !matches!(state, "Z" | "X" | "x"))
}

fn attach_error(pid: ProcessId, errno: Errno) -> BackendError
{
    match errno {
        Errno::EPERM => BackendError::PermissionDenied {
            pid,
            reason: "ptrace is not permitted (see kernel.yama.ptrace_scope, or run with CAP_SYS_PTRACE)".to_string(),
        },
        Errno::ESRCH => BackendError::NotFound(pid),
        other => BackendError::Attach(format!("PTRACE_SEIZE on {pid}: {other}")),
    }
}

impl ProcessControl for LinuxBackend
{
    fn attach(&mut self, pid: ProcessId) -> BackendResult<ProcessHandle>
    {
        if let Some(traced) = &self.traced {
            return Err(BackendError::Attach(format!("already tracing process {}", traced.pid)));
        }

        let raw = Pid::from_raw(i32::try_from(pid.0).map_err(|_| BackendError::NotFound(pid))?);
        if raw == Pid::this() {
            return Err(BackendError::Attach("cannot trace our own process".to_string()));
        }
        if !process_alive(raw) {
            return Err(BackendError::NotFound(pid));
        }

        let tids = list_tasks(raw).map_err(|_| BackendError::NotFound(pid))?;
        let mut threads = ThreadSet::new(raw);
        for tid in tids {
            if let Err(errno) = threads.seize(tid) {
                // Release whatever we already hold
                if let Err(err) = threads.detach_all() {
                    warn!(%pid, error = %err, "failed to release threads after attach failure");
                }
                return Err(attach_error(pid, errno));
            }
        }
        if threads.tids().next().is_none() {
            return Err(BackendError::NotFound(pid));
        }

        let mem = match OpenOptions::new().read(true).write(true).open(format!("/proc/{raw}/mem")) {
            Ok(mem) => mem,
            Err(err) => {
                if let Err(detach_err) = threads.detach_all() {
                    warn!(%pid, error = %detach_err, "failed to release threads after attach failure");
                }
                return Err(match err.kind() {
                    std::io::ErrorKind::PermissionDenied => BackendError::PermissionDenied {
                        pid,
                        reason: format!("/proc/{pid}/mem: {err}"),
                    },
                    std::io::ErrorKind::NotFound => BackendError::NotFound(pid),
                    _ => BackendError::Attach(format!("/proc/{pid}/mem: {err}")),
                });
            }
        };

        info!(%pid, threads = threads.tids().count(), "attached");
        self.traced = Some(Traced {
            pid: raw,
            mem,
            threads,
            symbols: OnceCell::new(),
        });
        Ok(ProcessHandle::new(pid))
    }

    fn detach(&mut self, handle: &ProcessHandle) -> BackendResult<()>
    {
        self.traced(handle)?;
        let Some(mut traced) = self.traced.take() else {
            return Ok(());
        };
        let result = traced.threads.detach_all();
        match &result {
            Ok(()) => info!(pid = %handle.pid(), "detached"),
            Err(err) => warn!(pid = %handle.pid(), error = %err, "detached with errors"),
        }
        result
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool
    {
        self.traced(handle).is_ok_and(|traced| process_alive(traced.pid))
    }

    fn list_os_threads(&self, handle: &ProcessHandle) -> BackendResult<Vec<ThreadId>>
    {
        let traced = self.traced(handle)?;
        let tids = list_tasks(traced.pid)
            .map_err(|err| BackendError::Control(format!("listing threads of {}: {err}", traced.pid)))?;
        Ok(tids.into_iter().map(|tid| ThreadId::from(tid.as_raw() as u64)).collect())
    }

    fn read_memory(&self, handle: &ProcessHandle, address: Address, len: usize) -> BackendResult<Vec<u8>>
    {
        let traced = self.traced(handle)?;
        let mut buffer = vec![0u8; len];
        if len == 0 {
            return Ok(buffer);
        }
        traced
            .mem
            .read_exact_at(&mut buffer, address.value())
            .map_err(|err| BackendError::Read {
                address,
                len,
                reason: err.to_string(),
            })?;
        Ok(buffer)
    }

    fn write_memory(&mut self, handle: &ProcessHandle, address: Address, data: &[u8]) -> BackendResult<()>
    {
        let traced = self.traced(handle)?;
        traced
            .mem
            .write_all_at(data, address.value())
            .map_err(|err| BackendError::Write {
                address,
                len: data.len(),
                reason: err.to_string(),
            })
    }

    fn resolve_symbol(&self, handle: &ProcessHandle, name: &str) -> BackendResult<Symbol>
    {
        let traced = self.traced(handle)?;
        let index = traced.symbols.get_or_try_init(|| {
            let mappings = maps::read_maps(traced.pid.as_raw())
                .map_err(|err| BackendError::Control(format!("reading maps of {}: {err}", traced.pid)))?;
            let index = SymbolIndex::load(
                traced.pid.as_raw(),
                &maps::images(&mappings),
                self.symbol_file.as_deref(),
            );
            debug!(pid = %traced.pid, symbols = index.len(), "symbol index built");
            Ok::<_, BackendError>(index)
        })?;
        index
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::Symbol(name.to_string()))
    }

    fn mapped_images(&self, handle: &ProcessHandle) -> BackendResult<Vec<PathBuf>>
    {
        let traced = self.traced(handle)?;
        let mappings = maps::read_maps(traced.pid.as_raw())
            .map_err(|err| BackendError::Control(format!("reading maps of {}: {err}", traced.pid)))?;
        Ok(maps::images(&mappings).into_iter().map(|image| image.path).collect())
    }

    fn pause_all_except(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<()>
    {
        let traced = self.traced_mut(handle)?;
        traced.threads.rescan()?;
        traced.threads.stop_all()?;
        if !traced.threads.is_stopped(tid_of(thread)) {
            return Err(BackendError::Control(format!("thread {thread} is not part of {}", traced.pid)));
        }
        Ok(())
    }

    fn resume_all(&mut self, handle: &ProcessHandle) -> BackendResult<()>
    {
        self.traced_mut(handle)?.threads.resume_all()
    }

    fn thread_registers(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<ThreadRegisters>
    {
        let regs = self.registers(handle, thread)?;
        Ok(ThreadRegisters {
            pc: Address::new(regs.rip),
            sp: Address::new(regs.rsp),
        })
    }

    fn thread_pointer(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<u64>
    {
        Ok(self.registers(handle, thread)?.fs_base)
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
        let traced = self.traced_mut(handle)?;
        call::invoke(&mut traced.threads, &traced.mem, tid_of(thread), function, args, timeout)
    }
}

impl Drop for LinuxBackend
{
    fn drop(&mut self)
    {
        if let Some(mut traced) = self.traced.take() {
            if let Err(err) = traced.threads.detach_all() {
                warn!(pid = %traced.pid, error = %err, "failed to detach on drop");
            }
        }
    }
}
