//! Field offsets for one runtime build.
//!
//! All offsets are in bytes from the start of the object, for the x86-64
//! (LP64) ABI. A descriptor is plain data; the table of known descriptors
//! lives in [`super::known`].

use super::types::TypeTag;
use super::BuildSignature;

/// Offsets shared by every object (`PyObject` / `PyVarObject`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout
{
    /// `ob_refcnt`
    pub refcnt: u64,
    /// `ob_type`
    pub ob_type: u64,
    /// `ob_size` of variable-sized objects
    pub ob_size: u64,
}

/// `PyTypeObject`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeObjectLayout
{
    /// `tp_name` (`const char *`)
    pub name: u64,
    /// `tp_flags`
    pub flags: u64,
    /// `tp_dictoffset`
    pub dictoffset: u64,
    /// `Py_TPFLAGS_HEAPTYPE`
    pub heap_type_flag: u64,
}

/// Arbitrary-precision integers (`PyLongObject`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongLayout
{
    /// First digit; the signed digit count is `ob_size`
    pub digits: u64,
    /// Payload bits per digit
    pub digit_bits: u32,
    /// Storage bytes per digit
    pub digit_size: u64,
}

/// A single fixed-size scalar payload (`ob_ival`, `ob_fval`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarLayout
{
    /// Offset of the payload
    pub value: u64,
}

/// Text objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextLayout
{
    /// PEP 393 flexible representation (3.3+)
    Compact
    {
        /// `length` in code points
        length: u64,
        /// `state` bitfield
        state: u64,
        /// Inline data of compact ASCII strings (`sizeof(PyASCIIObject)`)
        ascii_data: u64,
        /// Inline data of compact non-ASCII strings
        /// (`sizeof(PyCompactUnicodeObject)`)
        compact_data: u64,
        /// `data.any` pointer of non-compact strings
        data_pointer: u64,
    },
    /// Fixed-width `Py_UNICODE` buffer (2.x, UCS4 builds)
    Wide
    {
        /// `length` in code units
        length: u64,
        /// `str` pointer
        data_pointer: u64,
        /// Bytes per code unit
        unit_size: u64,
    },
}

/// Byte strings (`PyBytesObject`, 2.x `PyStringObject`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytesLayout
{
    /// `ob_size`
    pub size: u64,
    /// `ob_sval`
    pub data: u64,
}

/// Sequences. Lists hold a pointer to their item array, tuples hold the
/// array inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLayout
{
    /// `ob_size`
    pub size: u64,
    /// `ob_item`
    pub items: u64,
    /// Whether `items` holds a pointer to the array (list) rather than the
    /// array itself (tuple)
    pub indirect: bool,
}

/// Dictionaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictLayout
{
    /// Compact, insertion-ordered table (3.6+)
    Compact
    {
        /// `ma_used`
        used: u64,
        /// `ma_keys`
        keys: u64,
        /// `ma_values` (non-null for split tables)
        values: u64,
        /// `dk_size` within the keys object
        keys_size: u64,
        /// `dk_nentries`
        keys_nentries: u64,
        /// `dk_indices`
        keys_indices: u64,
        /// `sizeof(PyDictKeyEntry)`
        entry_size: u64,
    },
    /// Open-addressing table of `(hash, key, value)` slots (2.x)
    Open
    {
        /// `ma_used`
        used: u64,
        /// `ma_mask`
        mask: u64,
        /// `ma_table`
        table: u64,
        /// `sizeof(PyDictEntry)`
        entry_size: u64,
    },
}

/// How a code object maps bytecode offsets to line numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEncoding
{
    /// `co_lnotab` byte pairs; line deltas are signed from 3.6 on
    Lnotab
    {
        /// Whether line increments are signed bytes
        signed: bool,
    },
    /// 3.10 `co_linetable` (start delta, line delta; -128 = no line)
    LineTable,
}

/// `PyCodeObject`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLayout
{
    /// `co_nlocals`
    pub nlocals: u64,
    /// `co_firstlineno`
    pub firstlineno: u64,
    /// `co_varnames`
    pub varnames: u64,
    /// `co_filename`
    pub filename: u64,
    /// `co_name`
    pub name: u64,
    /// `co_lnotab` / `co_linetable`
    pub line_table: u64,
    /// Format of `line_table`
    pub line_encoding: LineEncoding,
}

/// `PyFrameObject`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout
{
    /// `f_back`
    pub back: u64,
    /// `f_code`
    pub code: u64,
    /// `f_builtins`
    pub builtins: u64,
    /// `f_globals`
    pub globals: u64,
    /// `f_locals`
    pub locals: u64,
    /// `f_lasti`
    pub lasti: u64,
    /// Bytes per unit of `f_lasti` (2 when it counts code units)
    pub lasti_scale: i64,
    /// `f_lineno`
    pub lineno: u64,
    /// `f_localsplus`
    pub localsplus: u64,
}

/// `PyThreadState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStateLayout
{
    /// `next`
    pub next: u64,
    /// `frame`
    pub frame: u64,
    /// `recursion_depth`
    pub recursion_depth: u64,
    /// `curexc_type`
    pub curexc_type: u64,
    /// `curexc_value`
    pub curexc_value: u64,
    /// `curexc_traceback`
    pub curexc_traceback: u64,
    /// `thread_id`
    pub thread_id: u64,
}

/// `PyInterpreterState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterLayout
{
    /// `next`
    pub next: u64,
    /// `tstate_head`
    pub tstate_head: u64,
}

/// 2.x classic (old-style) instances and classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicLayout
{
    /// `PyInstanceObject.in_class`
    pub in_class: u64,
    /// `PyInstanceObject.in_dict`
    pub in_dict: u64,
    /// `PyClassObject.cl_name`
    pub cl_name: u64,
}

/// Where a runtime-wide pointer slot lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalSlot
{
    /// A pointer at `offset` inside a global symbol
    /// (`_PyRuntime.interpreters.head`)
    Field
    {
        /// Global symbol
        symbol: &'static str,
        /// Offset of the head pointer
        offset: u64,
    },
    /// A global pointer variable of its own (`interp_head`)
    Pointer
    {
        /// Global symbol
        symbol: &'static str,
    },
}

/// Everything needed to interpret one runtime build's memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutDescriptor
{
    /// Build this descriptor describes
    pub build: BuildSignature,
    /// Common object header
    pub object: ObjectLayout,
    /// Type objects
    pub type_object: TypeObjectLayout,
    /// 2.x machine-word `int`; absent on 3.x
    pub small_int: Option<ScalarLayout>,
    /// Arbitrary-precision integers
    pub long: LongLayout,
    /// `float`
    pub float: ScalarLayout,
    /// Text strings (`str` on 3.x, `unicode` on 2.x)
    pub text: TextLayout,
    /// Byte strings (`bytes` on 3.x, `str` on 2.x)
    pub bytes: BytesLayout,
    /// `list`
    pub list: SequenceLayout,
    /// `tuple`
    pub tuple: SequenceLayout,
    /// `dict`
    pub dict: DictLayout,
    /// Code objects
    pub code: CodeLayout,
    /// Frame objects
    pub frame: FrameLayout,
    /// Thread states
    pub thread: ThreadStateLayout,
    /// Interpreter states
    pub interpreter: InterpreterLayout,
    /// `PyModuleObject.md_dict`
    pub module_dict: u64,
    /// Classic instances (2.x only)
    pub classic: Option<ClassicLayout>,
    /// Location of the interpreter list head
    pub interpreter_head: GlobalSlot,
    /// Location of the thread state that currently owns the GIL
    /// (`_PyRuntime.gilstate.tstate_current` or `_PyThreadState_Current`)
    pub gil_holder: GlobalSlot,
    /// Type objects to recognise, by symbol
    pub type_symbols: &'static [(&'static str, TypeTag)],
    /// The `None` singleton
    pub none_symbol: &'static str,
    /// The `True` singleton
    pub true_symbol: &'static str,
}
