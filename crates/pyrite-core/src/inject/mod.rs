//! # Injection Engine
//!
//! Runs caller-supplied source text on one thread of the target, inside the
//! target's own interpreter.
//!
//! ## Phases
//!
//! ```text
//! Idle ──► ThreadSelected ──► Paused ──► Executing ──► Restoring ──► Idle
//!               │               │            │             │
//!               └───────────────┴─────┬──────┴─────────────┘
//!                                     ▼
//!                                  Errored
//! ```
//!
//! - **ThreadSelected**: the runtime thread is mapped to its OS thread and
//!   checked for an unsafe injection point ([`safety`]).
//! - **Paused**: every thread is stopped ([`guard::PauseGuard`]), the check
//!   is repeated on the frozen registers, and the thread's exception state
//!   and recursion depth are snapshotted, then the exception is stashed.
//! - **Executing**: the payload ([`payload`]) is copied into a `malloc`ed
//!   buffer and run with `PyRun_SimpleString` under `PyGILState_Ensure`.
//!   The result tuple is read back from `__main__`, then removed.
//! - **Restoring**: the snapshot is written back and the target resumed.
//!
//! Every failure attempts the same restoration, except two: a call that
//! didn't return (the thread is still inside the callee, so the target is
//! left paused) and a target that exited.
//!
//! Fast locals of the frames on the selected thread are not written back
//! by the interpreter, so assigning to a function's local by name from
//! injected code may have no visible effect.

pub mod guard;
pub mod payload;
pub mod safety;
pub mod state;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{BackendError, InvocationError, ProcessControl, ThreadRegisters};
use crate::error::{PyriteError, Result};
use crate::layout::{RuntimeLayout, TypeTag};
use crate::memory::RemoteMemory;
use crate::types::{Address, ProcessHandle, SessionId, ThreadId};
use crate::value::{Classifier, Limits, RemoteValue, Scalar};
use crate::walker::ThreadHandle;
use guard::PauseGuard;
use payload::{DEFAULT_FILENAME, RESULT_NAME};
use safety::{collect_suspects, UnsafeRanges, STACK_SCAN_WORDS};
use state::ThreadSnapshot;

/// Functions every injection calls in the target
const INJECTION_SYMBOLS: [&str; 7] = [
    "PyGILState_Ensure",
    "PyGILState_Release",
    "PyRun_SimpleString",
    "PyImport_AddModule",
    "PyErr_Clear",
    "malloc",
    "free",
];

/// Where an injection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPhase
{
    /// Nothing in progress
    Idle,
    /// Thread mapped and checked
    ThreadSelected,
    /// Target stopped, state snapshotted
    Paused,
    /// Calls running in the target
    Executing,
    /// Writing the snapshot back and resuming
    Restoring,
    /// A step failed; absorbing
    Errored,
}

impl fmt::Display for InjectionPhase
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            InjectionPhase::Idle => "idle",
            InjectionPhase::ThreadSelected => "thread-selected",
            InjectionPhase::Paused => "paused",
            InjectionPhase::Executing => "executing",
            InjectionPhase::Restoring => "restoring",
            InjectionPhase::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Source text to run and the file name it is compiled under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionRequest
{
    /// Source text
    pub source: String,
    /// File name shown in tracebacks
    pub filename: String,
}

impl InjectionRequest
{
    /// A request compiled under the default file name
    pub fn new(source: impl Into<String>) -> Self
    {
        Self {
            source: source.into(),
            filename: DEFAULT_FILENAME.to_string(),
        }
    }

    /// A request for a local file's contents, compiled under its path
    ///
    /// ## Errors
    ///
    /// `Io` if the file can't be read.
    pub fn from_file(path: &Path) -> Result<Self>
    {
        Ok(Self {
            source: std::fs::read_to_string(path)?,
            filename: path.display().to_string(),
        })
    }
}

/// What injected code did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionResult
{
    /// Ran to completion
    Completed
    {
        /// Everything written to `sys.stdout`
        stdout: String,
    },
    /// Raised an exception, which was caught in the target
    Raised
    {
        /// Everything written to `sys.stdout` before the exception
        stdout: String,
        /// Formatted traceback
        traceback: String,
    },
}

impl InjectionResult
{
    /// Captured output
    pub fn stdout(&self) -> &str
    {
        match self {
            InjectionResult::Completed { stdout } | InjectionResult::Raised { stdout, .. } => stdout,
        }
    }

    /// Traceback of the exception, if one was raised
    pub fn traceback(&self) -> Option<&str>
    {
        match self {
            InjectionResult::Completed { .. } => None,
            InjectionResult::Raised { traceback, .. } => Some(traceback),
        }
    }

    /// Whether the code completed without raising
    pub fn is_completed(&self) -> bool
    {
        matches!(self, InjectionResult::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct InjectionSymbols
{
    gil_ensure: Address,
    gil_release: Address,
    run_string: Address,
    add_module: Address,
    err_clear: Address,
    malloc: Address,
    free: Address,
}

impl InjectionSymbols
{
    fn resolve<B: ProcessControl + ?Sized>(backend: &B, handle: &ProcessHandle) -> Result<Self>
    {
        let mut addresses = [Address::NULL; INJECTION_SYMBOLS.len()];
        for (slot, name) in addresses.iter_mut().zip(INJECTION_SYMBOLS) {
            *slot = backend.resolve_symbol(handle, name)?.address;
        }
        let [gil_ensure, gil_release, run_string, add_module, err_clear, malloc, free] = addresses;
        Ok(Self {
            gil_ensure,
            gil_release,
            run_string,
            add_module,
            err_clear,
            malloc,
            free,
        })
    }
}

/// Session facts every step needs
#[derive(Clone, Copy)]
struct Target<'a>
{
    handle: &'a ProcessHandle,
    runtime: &'a RuntimeLayout,
    limits: Limits,
    session: SessionId,
    timeout: Duration,
}

/// Runs one injection against an attached session
pub struct Injector<'a, B: ProcessControl + ?Sized>
{
    backend: &'a mut B,
    target: Target<'a>,
    phase: InjectionPhase,
}

impl<'a, B: ProcessControl + ?Sized> Injector<'a, B>
{
    /// Create an injector for one session
    pub fn new(
        backend: &'a mut B,
        handle: &'a ProcessHandle,
        runtime: &'a RuntimeLayout,
        limits: Limits,
        session: SessionId,
        timeout: Duration,
    ) -> Self
    {
        Self {
            backend,
            target: Target {
                handle,
                runtime,
                limits,
                session,
                timeout,
            },
            phase: InjectionPhase::Idle,
        }
    }

    /// Current phase
    pub fn phase(&self) -> InjectionPhase
    {
        self.phase
    }

    /// Run `request` on `thread`
    ///
    /// ## Errors
    ///
    /// - `StaleHandle`: the thread is from another session
    /// - `MissingDebugInfo`: an injection symbol doesn't resolve
    /// - `UnknownThread`: no OS thread carries this runtime thread
    /// - `UnsafeInjectionPoint`: see [`safety`]
    /// - `InjectionTimeout`: a call didn't return; the target stays paused
    /// - `TargetExited`: the target died during the injection
    /// - `Invocation`: a call faulted or returned something unusable
    pub fn inject(&mut self, thread: &ThreadHandle, request: &InjectionRequest) -> Result<InjectionResult>
    {
        if thread.session() != self.target.session {
            return Err(PyriteError::StaleHandle);
        }
        if self.phase != InjectionPhase::Idle {
            return Err(PyriteError::Invocation(format!("injector is {}", self.phase)));
        }

        let result = self.run(thread, request);
        match &result {
            Ok(outcome) => {
                set_phase(&mut self.phase, InjectionPhase::Idle);
                info!(thread = %thread, completed = outcome.is_completed(), "injection finished");
            }
            Err(err) => {
                set_phase(&mut self.phase, InjectionPhase::Errored);
                warn!(thread = %thread, error = %err, "injection failed");
            }
        }
        result
    }

    fn run(&mut self, thread: &ThreadHandle, request: &InjectionRequest) -> Result<InjectionResult>
    {
        let target = self.target;
        let layout = &target.runtime.descriptor.thread;
        let thread_state = thread.thread_state();

        set_phase(&mut self.phase, InjectionPhase::ThreadSelected);
        let symbols = InjectionSymbols::resolve(&*self.backend, target.handle)?;
        let os_thread = self.os_thread(thread)?;
        let ranges = UnsafeRanges::resolve(&*self.backend, target.handle);
        debug!(%os_thread, ranges = ranges.len(), "checking injection point");
        let registers = self.backend.thread_registers(target.handle, os_thread)?;
        check_injection_point(&*self.backend, &target, thread, &ranges, registers)?;

        let mut guard = PauseGuard::pause(&mut *self.backend, target.handle, os_thread)?;
        set_phase(&mut self.phase, InjectionPhase::Paused);

        // The thread may have moved between the first check and the stop
        let registers = guard.backend_mut().thread_registers(target.handle, os_thread)?;
        check_injection_point(guard.backend(), &target, thread, &ranges, registers)?;

        let snapshot = ThreadSnapshot::capture(RemoteMemory::new(guard.backend(), target.handle), layout, thread_state)?;
        if let Err(err) = ThreadSnapshot::stash(guard.backend_mut(), target.handle, layout, thread_state) {
            if let Err(restore_err) = snapshot.restore(guard.backend_mut(), target.handle, layout, thread_state) {
                warn!(error = %restore_err, "failed to restore thread state after a failed stash");
            }
            return Err(err);
        }

        set_phase(&mut self.phase, InjectionPhase::Executing);
        let outcome = execute(&mut guard, &target, &symbols, thread_state, request);
        if let Err(err) = &outcome {
            if leaves_target_paused(err) {
                guard.disarm();
                return outcome;
            }
        }

        set_phase(&mut self.phase, InjectionPhase::Restoring);
        let restored = snapshot.restore(guard.backend_mut(), target.handle, layout, thread_state);
        let resumed = guard.resume();

        match outcome {
            Ok(result) => {
                restored?;
                resumed?;
                Ok(result)
            }
            Err(err) => {
                if let Err(restore_err) = restored {
                    warn!(error = %restore_err, "failed to restore thread state");
                }
                if let Err(resume_err) = resumed {
                    warn!(error = %resume_err, "failed to resume target");
                }
                Err(err)
            }
        }
    }

    fn os_thread(&mut self, thread: &ThreadHandle) -> Result<ThreadId>
    {
        let handle = self.target.handle;
        for tid in self.backend.list_os_threads(handle)? {
            match self.backend.thread_pointer(handle, tid) {
                Ok(pointer) if pointer == thread.runtime_id() => return Ok(tid),
                Ok(_) => {}
                Err(err) => debug!(%tid, error = %err, "skipping thread"),
            }
        }
        Err(PyriteError::UnknownThread(thread.runtime_id()))
    }
}

fn set_phase(phase: &mut InjectionPhase, next: InjectionPhase)
{
    debug!(from = %phase, to = %next, "injection phase");
    *phase = next;
}

/// Errors after which the target must not be touched again
fn leaves_target_paused(err: &PyriteError) -> bool
{
    matches!(err, PyriteError::InjectionTimeout { .. } | PyriteError::TargetExited { .. })
}

fn check_injection_point<B: ProcessControl + ?Sized>(
    backend: &B,
    target: &Target<'_>,
    thread: &ThreadHandle,
    ranges: &UnsafeRanges,
    registers: ThreadRegisters,
) -> Result<()>
{
    let memory = RemoteMemory::new(backend, target.handle);
    let unsafe_point = |reason: String| PyriteError::UnsafeInjectionPoint {
        thread: thread.runtime_id(),
        reason,
    };

    let suspects = collect_suspects(memory, registers.pc, registers.sp, STACK_SCAN_WORDS);
    if let Some(reason) = ranges.check(&suspects) {
        return Err(unsafe_point(reason));
    }

    // A null holder means the GIL is released, e.g. while blocked in I/O
    let holder = memory.read_ptr(target.runtime.gil_holder)?;
    if !holder.is_null() && holder != thread.thread_state() {
        let reason = match memory.read_u64(holder + target.runtime.descriptor.thread.thread_id) {
            Ok(owner) => format!("the GIL is held by thread {owner:#x}"),
            Err(_) => format!("the GIL is held by thread state {holder}"),
        };
        return Err(unsafe_point(reason));
    }
    Ok(())
}

fn call<B: ProcessControl + ?Sized>(
    guard: &mut PauseGuard<'_, B>,
    target: &Target<'_>,
    function: Address,
    args: &[u64],
) -> Result<u64>
{
    let thread = guard.thread();
    guard
        .backend_mut()
        .invoke_inferior_function(target.handle, thread, function, args, target.timeout)
        .map_err(|err| match err {
            BackendError::Invocation(InvocationError::TimedOut) => PyriteError::InjectionTimeout {
                timeout: target.timeout,
            },
            BackendError::Invocation(InvocationError::TargetExited) => PyriteError::TargetExited {
                pid: target.handle.pid().0,
            },
            other => other.into(),
        })
}

/// Call a cleanup function, logging ordinary failures
fn best_effort<B: ProcessControl + ?Sized>(
    guard: &mut PauseGuard<'_, B>,
    target: &Target<'_>,
    step: &str,
    function: Address,
    args: &[u64],
) -> Result<()>
{
    match call(guard, target, function, args) {
        Ok(_) => Ok(()),
        Err(err) if leaves_target_paused(&err) => Err(err),
        Err(err) => {
            warn!(step, error = %err, "injection cleanup step failed");
            Ok(())
        }
    }
}

/// Offsets of the strings packed into the injection buffer
struct Buffer
{
    address: Address,
    cleanup: u64,
    main: u64,
}

fn execute<B: ProcessControl + ?Sized>(
    guard: &mut PauseGuard<'_, B>,
    target: &Target<'_>,
    symbols: &InjectionSymbols,
    thread_state: Address,
    request: &InjectionRequest,
) -> Result<InjectionResult>
{
    let payload = payload::build(target.runtime.build, &request.source, &request.filename);

    let mut block = Vec::with_capacity(payload.script.len() + payload.cleanup.len() + 16);
    block.extend_from_slice(payload.script.as_bytes());
    block.push(0);
    let cleanup = block.len() as u64;
    block.extend_from_slice(payload.cleanup.as_bytes());
    block.push(0);
    let main = block.len() as u64;
    block.extend_from_slice(b"__main__\0");

    let address = Address::new(call(guard, target, symbols.malloc, &[block.len() as u64])?);
    if address.is_null() {
        return Err(PyriteError::Invocation(format!(
            "malloc({}) returned NULL in the target",
            block.len()
        )));
    }
    let buffer = Buffer { address, cleanup, main };

    let outcome = match guard.backend_mut().write_memory(target.handle, address, &block) {
        Ok(()) => run_locked(guard, target, symbols, thread_state, &buffer),
        Err(err) => Err(err.into()),
    };
    if let Err(err) = &outcome {
        if leaves_target_paused(err) {
            return outcome;
        }
    }

    best_effort(guard, target, "free", symbols.free, &[address.value()])?;
    outcome
}

/// Everything that runs while holding the GIL
fn run_locked<B: ProcessControl + ?Sized>(
    guard: &mut PauseGuard<'_, B>,
    target: &Target<'_>,
    symbols: &InjectionSymbols,
    thread_state: Address,
    buffer: &Buffer,
) -> Result<InjectionResult>
{
    let gil = call(guard, target, symbols.gil_ensure, &[])?;

    let outcome = run_script(guard, target, symbols, buffer);
    if let Err(err) = &outcome {
        if leaves_target_paused(err) {
            return outcome;
        }
    }

    best_effort(
        guard,
        target,
        "cleanup",
        symbols.run_string,
        &[(buffer.address + buffer.cleanup).value()],
    )?;

    // Whatever is pending now was raised by the machinery, not the target
    let layout = &target.runtime.descriptor.thread;
    let pending = RemoteMemory::new(guard.backend(), target.handle).read_ptr(thread_state + layout.curexc_type);
    match pending {
        Ok(pending) if !pending.is_null() => best_effort(guard, target, "PyErr_Clear", symbols.err_clear, &[])?,
        Ok(_) => {}
        Err(err) => warn!(error = %err, "could not check for a pending exception"),
    }

    best_effort(guard, target, "PyGILState_Release", symbols.gil_release, &[gil])?;
    outcome
}

fn run_script<B: ProcessControl + ?Sized>(
    guard: &mut PauseGuard<'_, B>,
    target: &Target<'_>,
    symbols: &InjectionSymbols,
    buffer: &Buffer,
) -> Result<InjectionResult>
{
    // PyRun_SimpleString returns a C int
    let status = call(guard, target, symbols.run_string, &[buffer.address.value()])? as u32 as i32;
    if status != 0 {
        return Err(PyriteError::Invocation(format!(
            "PyRun_SimpleString returned {status}; the injection wrapper did not run"
        )));
    }

    let module = Address::new(call(
        guard,
        target,
        symbols.add_module,
        &[(buffer.address + buffer.main).value()],
    )?);
    if module.is_null() {
        return Err(PyriteError::Invocation("PyImport_AddModule(\"__main__\") returned NULL".to_string()));
    }

    read_result(guard.backend(), target, module)
}

fn read_result<B: ProcessControl + ?Sized>(backend: &B, target: &Target<'_>, module: Address) -> Result<InjectionResult>
{
    let memory = RemoteMemory::new(backend, target.handle);
    let classifier = Classifier::new(memory, target.runtime, target.limits, target.session);
    let missing = || PyriteError::Invocation("the injection wrapper left no result".to_string());

    let globals = classifier.classify(memory.read_ptr(module + target.runtime.descriptor.module_dict)?)?;
    let globals = globals.as_proxy().ok_or_else(missing)?;
    let result = classifier.get(globals, RESULT_NAME)?.ok_or_else(missing)?;

    let tuple = result
        .as_proxy()
        .filter(|proxy| proxy.tag == TypeTag::Tuple && proxy.len() == 3)
        .ok_or_else(|| PyriteError::Invocation(format!("unexpected injection result {result}")))?;
    let field = |index: usize| -> Result<RemoteValue> { classifier.item(tuple, index)?.ok_or_else(missing) };

    let completed = match field(0)? {
        RemoteValue::Scalar(Scalar::Bool(completed)) => completed,
        other => return Err(PyriteError::Invocation(format!("unexpected injection status {other}"))),
    };
    let stdout = text_of(field(1)?);

    Ok(if completed {
        InjectionResult::Completed { stdout }
    } else {
        InjectionResult::Raised {
            stdout,
            traceback: text_of(field(2)?),
        }
    })
}

fn text_of(value: RemoteValue) -> String
{
    match value {
        RemoteValue::Scalar(Scalar::Str { text, .. }) => text,
        RemoteValue::Scalar(Scalar::Bytes { data, .. }) => String::from_utf8_lossy(&data).into_owned(),
        other => other.to_string(),
    }
}
