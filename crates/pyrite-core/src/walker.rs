//! # Frame & Thread Walker
//!
//! Enumerates runtime threads and walks their frame chains.
//!
//! ```text
//! interpreter head ──► PyInterpreterState ──next──► ...
//!                        │ tstate_head
//!                        ▼
//!                      PyThreadState ──next──► PyThreadState ──► ...
//!                        │ frame
//!                        ▼
//!                      PyFrameObject (innermost) ──f_back──► ... ──► NULL
//! ```
//!
//! Every chain is bounded by [`Limits`](crate::value::Limits), so a cycle in
//! target memory ends the walk with an error instead of looping.

use std::fmt;
use std::fmt::Write as _;

use tracing::debug;

use crate::backend::ProcessControl;
use crate::error::{PyriteError, Result};
use crate::layout::TypeTag;
use crate::linetable::line_for_offset;
use crate::types::{Address, SessionId};
use crate::value::{Classifier, EntryKey, MappingEntry, RemoteValue, Shape};

/// A runtime thread of the attached process
///
/// Only valid inside the session that listed it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadHandle
{
    runtime_id: u64,
    thread_state: Address,
    session: SessionId,
}

impl ThreadHandle
{
    /// Create a handle
    pub fn new(runtime_id: u64, thread_state: Address, session: SessionId) -> Self
    {
        Self {
            runtime_id,
            thread_state,
            session,
        }
    }

    /// Runtime thread identity (`threading.get_ident()`)
    pub fn runtime_id(&self) -> u64
    {
        self.runtime_id
    }

    /// Address of the thread state
    pub fn thread_state(&self) -> Address
    {
        self.thread_state
    }

    /// Owning session
    pub fn session(&self) -> SessionId
    {
        self.session
    }
}

impl fmt::Display for ThreadHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "Thread {:#x}", self.runtime_id)
    }
}

/// Where a frame is executing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLocation
{
    /// `co_filename`
    pub filename: String,
    /// Current source line
    pub line: i64,
    /// `co_name`
    pub function: String,
}

impl fmt::Display for CodeLocation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "File \"{}\", line {}, in {}", self.filename, self.line, self.function)
    }
}

/// One activation record
#[derive(Debug, Clone, PartialEq)]
pub struct Frame
{
    /// Depth from the innermost frame (0)
    pub index: usize,
    /// Address of the frame object
    pub address: Address,
    /// Code location
    pub location: CodeLocation,
    /// Local variables: the `f_locals` dict, or the fast-local slots
    pub locals: RemoteValue,
    /// Module globals
    pub globals: RemoteValue,
    /// Builtins
    pub builtins: RemoteValue,
}

/// List every runtime thread, across every interpreter
///
/// ## Errors
///
/// - `ThreadChainTooLong`: a chain exceeds the thread limit
/// - `RemoteRead`: a chain link is unreadable
pub fn list_threads<B: ProcessControl + ?Sized>(classifier: &Classifier<'_, B>) -> Result<Vec<ThreadHandle>>
{
    let memory = classifier.memory();
    let runtime = classifier.runtime();
    let layout = runtime.descriptor;
    let limit = classifier.limits().max_threads;

    let mut threads = Vec::new();
    let mut interpreters = 0usize;
    let mut interpreter = memory.read_ptr(runtime.interpreter_head)?;

    while !interpreter.is_null() {
        interpreters += 1;
        if interpreters > limit {
            return Err(PyriteError::ThreadChainTooLong { limit });
        }

        let mut thread_state = memory.read_ptr(interpreter + layout.interpreter.tstate_head)?;
        while !thread_state.is_null() {
            if threads.len() >= limit {
                return Err(PyriteError::ThreadChainTooLong { limit });
            }
            let runtime_id = memory.read_u64(thread_state + layout.thread.thread_id)?;
            threads.push(ThreadHandle::new(runtime_id, thread_state, classifier.session()));
            thread_state = memory.read_ptr(thread_state + layout.thread.next)?;
        }

        interpreter = memory.read_ptr(interpreter + layout.interpreter.next)?;
    }

    debug!(count = threads.len(), interpreters, "threads listed");
    Ok(threads)
}

/// Frames of `thread`, innermost first
///
/// A thread that isn't running Python code has no frames.
///
/// ## Errors
///
/// - `StaleHandle`: the handle is from another session
/// - `FrameChainTooDeep`: the chain exceeds the frame limit
/// - `RemoteRead` / `Malformed`: a frame or its code object is unreadable
pub fn frames<B: ProcessControl + ?Sized>(classifier: &Classifier<'_, B>, thread: &ThreadHandle) -> Result<Vec<Frame>>
{
    if thread.session != classifier.session() {
        return Err(PyriteError::StaleHandle);
    }

    let memory = classifier.memory();
    let layout = classifier.runtime().descriptor;
    let limit = classifier.limits().max_frames;

    let mut frames = Vec::new();
    let mut address = memory.read_ptr(thread.thread_state + layout.thread.frame)?;
    while !address.is_null() {
        if frames.len() >= limit {
            return Err(PyriteError::FrameChainTooDeep { limit });
        }
        frames.push(read_frame(classifier, frames.len(), address)?);
        address = memory.read_ptr(address + layout.frame.back)?;
    }
    Ok(frames)
}

/// Render frames (innermost first) as a traceback, outermost call first
pub fn format_traceback(frames: &[Frame]) -> String
{
    let mut out = String::from("Traceback (most recent call last):\n");
    for frame in frames.iter().rev() {
        let _ = writeln!(out, "  {}", frame.location);
    }
    out
}

fn read_frame<B: ProcessControl + ?Sized>(classifier: &Classifier<'_, B>, index: usize, address: Address) -> Result<Frame>
{
    let memory = classifier.memory();
    let layout = &classifier.runtime().descriptor.frame;

    let code = memory.read_ptr(address + layout.code)?;
    if code.is_null() {
        return Err(PyriteError::Malformed {
            address,
            reason: "frame without a code object".to_string(),
        });
    }

    Ok(Frame {
        index,
        address,
        location: code_location(classifier, address, code)?,
        locals: frame_locals(classifier, address, code)?,
        globals: classifier.classify(memory.read_ptr(address + layout.globals)?)?,
        builtins: classifier.classify(memory.read_ptr(address + layout.builtins)?)?,
    })
}

fn code_location<B: ProcessControl + ?Sized>(
    classifier: &Classifier<'_, B>,
    frame: Address,
    code: Address,
) -> Result<CodeLocation>
{
    let memory = classifier.memory();
    let descriptor = classifier.runtime().descriptor;
    let code_layout = &descriptor.code;
    let frame_layout = &descriptor.frame;

    let name_at = |offset: u64| -> Result<String> {
        let object = memory.read_ptr(code + offset)?;
        Ok(classifier.read_name(object)?.unwrap_or_else(|| "<unknown>".to_string()))
    };
    let filename = name_at(code_layout.filename)?;
    let function = name_at(code_layout.name)?;

    let firstlineno = i64::from(memory.read_i32(code + code_layout.firstlineno)?);
    let lasti = i64::from(memory.read_i32(frame + frame_layout.lasti)?);
    let (table, _) = classifier.raw_bytes(memory.read_ptr(code + code_layout.line_table)?)?;

    let line = match line_for_offset(
        code_layout.line_encoding,
        &table,
        firstlineno,
        lasti * frame_layout.lasti_scale,
    ) {
        Some(line) => line,
        None => i64::from(memory.read_i32(frame + frame_layout.lineno)?),
    };

    Ok(CodeLocation {
        filename,
        line,
        function,
    })
}

fn frame_locals<B: ProcessControl + ?Sized>(
    classifier: &Classifier<'_, B>,
    frame: Address,
    code: Address,
) -> Result<RemoteValue>
{
    let memory = classifier.memory();
    let descriptor = classifier.runtime().descriptor;

    let locals = memory.read_ptr(frame + descriptor.frame.locals)?;
    if !locals.is_null() {
        return classifier.classify(locals);
    }

    // Function frames keep locals in f_localsplus, named by co_varnames
    let nlocals = memory.read_i32(code + descriptor.code.nlocals)?;
    let nlocals = usize::try_from(nlocals).unwrap_or(0);
    let names = classifier.tuple_items(memory.read_ptr(code + descriptor.code.varnames)?)?;
    let count = nlocals.min(names.len());
    let slots = if count == 0 {
        Vec::new()
    } else {
        memory.read_ptrs(frame + descriptor.frame.localsplus, count)?
    };

    let mut entries = Vec::with_capacity(count);
    for (slot, (name, value)) in names.iter().zip(slots).enumerate() {
        // Unbound locals hold NULL
        if value.is_null() {
            continue;
        }
        let name = classifier
            .read_name(*name)?
            .unwrap_or_else(|| format!("<local {slot}>"));
        entries.push(MappingEntry {
            key: EntryKey::Name(name),
            value,
        });
    }

    Ok(classifier.proxy(
        frame,
        TypeTag::FastLocals,
        Shape::Mapping {
            entries,
            truncated: false,
        },
    ))
}
