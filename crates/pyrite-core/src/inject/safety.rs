//! Unsafe injection point detection.
//!
//! Running the interpreter on a thread that is already inside the
//! allocator, a GIL transition, the import lock or the collector can
//! deadlock or corrupt the target. The check looks at the program counter
//! and at every stack word near the stack pointer that points into one of
//! those functions, which catches callers a few frames up as well.
//!
//! This is approximate. Symbols that don't resolve in the target are
//! skipped, a stale return address on the stack can cause a false refusal,
//! and a callee reached through a tail call can be missed.

use smallvec::SmallVec;
use tracing::trace;

use crate::backend::{ProcessControl, Symbol};
use crate::memory::{RemoteMemory, POINTER_SIZE};
use crate::types::{Address, ProcessHandle};

/// Functions a thread must not be inside when the interpreter is entered
pub const UNSAFE_SYMBOLS: &[&str] = &[
    "malloc",
    "free",
    "calloc",
    "realloc",
    "_int_malloc",
    "_int_free",
    "malloc_consolidate",
    "take_gil",
    "drop_gil",
    "PyGILState_Ensure",
    "PyGILState_Release",
    "PyThread_acquire_lock_timed",
    "PyObject_Malloc",
    "PyObject_Free",
    "_PyImport_AcquireLock",
    "gc_collect_main",
    "collect_with_callback",
    "_PyGC_CollectNoFail",
    "PyGC_Collect",
    "__lll_lock_wait",
    "__lll_lock_wait_private",
    "dlopen",
];

/// Stack words scanned above the stack pointer
pub const STACK_SCAN_WORDS: usize = 512;

const PAGE_SIZE: u64 = 4096;

/// Candidate code addresses of one thread: the PC first, then stack words
pub type Suspects = SmallVec<[Address; 64]>;

/// Extents of the unsafe functions that resolve in one target
#[derive(Debug, Clone, Default)]
pub struct UnsafeRanges
{
    symbols: Vec<Symbol>,
}

impl UnsafeRanges
{
    /// Resolve [`UNSAFE_SYMBOLS`] in the target, skipping unknown names
    pub fn resolve<B: ProcessControl + ?Sized>(backend: &B, handle: &ProcessHandle) -> Self
    {
        let symbols = UNSAFE_SYMBOLS
            .iter()
            .filter_map(|name| match backend.resolve_symbol(handle, name) {
                Ok(symbol) => Some(symbol),
                Err(err) => {
                    trace!(name, error = %err, "unsafe range unavailable");
                    None
                }
            })
            .collect();
        Self { symbols }
    }

    /// Build from already resolved symbols
    pub fn from_symbols(symbols: Vec<Symbol>) -> Self
    {
        Self { symbols }
    }

    /// Number of ranges checked
    pub fn len(&self) -> usize
    {
        self.symbols.len()
    }

    /// Whether no range resolved
    pub fn is_empty(&self) -> bool
    {
        self.symbols.is_empty()
    }

    /// The unsafe function containing `address`, if any
    pub fn find(&self, address: Address) -> Option<&Symbol>
    {
        self.symbols.iter().find(|symbol| symbol.contains(address))
    }

    /// Why injecting with these suspects is unsafe, or `None` if it isn't
    ///
    /// `suspects[0]` is taken to be the program counter.
    pub fn check(&self, suspects: &[Address]) -> Option<String>
    {
        suspects.iter().enumerate().find_map(|(index, &address)| {
            self.find(address).map(|symbol| {
                if index == 0 {
                    format!("executing inside `{}` at {address}", symbol.name)
                } else {
                    format!("`{}` is on the stack (return address {address})", symbol.name)
                }
            })
        })
    }
}

/// The program counter followed by up to `words` stack words from `sp`
///
/// Reads stop at the first unreadable page.
pub fn collect_suspects<B: ProcessControl + ?Sized>(
    memory: RemoteMemory<'_, B>,
    pc: Address,
    sp: Address,
    words: usize,
) -> Suspects
{
    let mut suspects = Suspects::new();
    suspects.push(pc);

    let mut cursor = sp;
    let mut remaining = words;
    while remaining > 0 {
        let to_page_end = (PAGE_SIZE - cursor.value() % PAGE_SIZE) / POINTER_SIZE;
        let count = remaining.min(to_page_end.max(1) as usize);
        match memory.read_ptrs(cursor, count) {
            Ok(chunk) => suspects.extend(chunk.into_iter().filter(|word| !word.is_null())),
            Err(_) => break,
        }
        remaining -= count;
        cursor = cursor + (count as u64) * POINTER_SIZE;
    }
    suspects
}
