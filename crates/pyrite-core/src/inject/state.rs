//! Exception state and recursion depth of one thread state.

use crate::backend::ProcessControl;
use crate::error::Result;
use crate::layout::descriptor::ThreadStateLayout;
use crate::memory::RemoteMemory;
use crate::types::{Address, ProcessHandle};

/// What an injection must leave unchanged in the selected thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot
{
    /// `curexc_type`
    pub exc_type: Address,
    /// `curexc_value`
    pub exc_value: Address,
    /// `curexc_traceback`
    pub exc_traceback: Address,
    /// `recursion_depth`
    pub recursion_depth: i32,
}

impl ThreadSnapshot
{
    /// Read the fields from `thread_state`
    pub fn capture<B: ProcessControl + ?Sized>(
        memory: RemoteMemory<'_, B>,
        layout: &ThreadStateLayout,
        thread_state: Address,
    ) -> Result<Self>
    {
        Ok(Self {
            exc_type: memory.read_ptr(thread_state + layout.curexc_type)?,
            exc_value: memory.read_ptr(thread_state + layout.curexc_value)?,
            exc_traceback: memory.read_ptr(thread_state + layout.curexc_traceback)?,
            recursion_depth: memory.read_i32(thread_state + layout.recursion_depth)?,
        })
    }

    /// Clear the pending exception without touching reference counts
    ///
    /// The snapshot keeps the references; [`restore`](Self::restore) puts
    /// them back.
    pub fn stash<B: ProcessControl + ?Sized>(
        backend: &mut B,
        handle: &ProcessHandle,
        layout: &ThreadStateLayout,
        thread_state: Address,
    ) -> Result<()>
    {
        for offset in [layout.curexc_type, layout.curexc_value, layout.curexc_traceback] {
            backend.write_memory(handle, thread_state + offset, &0u64.to_le_bytes())?;
        }
        Ok(())
    }

    /// Write every field back
    pub fn restore<B: ProcessControl + ?Sized>(
        &self,
        backend: &mut B,
        handle: &ProcessHandle,
        layout: &ThreadStateLayout,
        thread_state: Address,
    ) -> Result<()>
    {
        let fields = [
            (layout.curexc_type, self.exc_type),
            (layout.curexc_value, self.exc_value),
            (layout.curexc_traceback, self.exc_traceback),
        ];
        for (offset, value) in fields {
            backend.write_memory(handle, thread_state + offset, &value.value().to_le_bytes())?;
        }
        backend.write_memory(
            handle,
            thread_state + layout.recursion_depth,
            &self.recursion_depth.to_le_bytes(),
        )?;
        Ok(())
    }
}
