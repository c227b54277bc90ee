//! Table of known runtime layouts (CPython, Linux x86-64).
//!
//! Offsets were taken from the public and internal headers of each release
//! (`Include/cpython/*.h`, `Include/internal/pycore_*.h`) for a default
//! `./configure` build: no `Py_TRACE_REFS`, 30-bit long digits, UCS4
//! `Py_UNICODE` on 2.7.

use once_cell::sync::Lazy;

use super::descriptor::{
    BytesLayout, ClassicLayout, CodeLayout, DictLayout, FrameLayout, GlobalSlot, InterpreterLayout,
    LayoutDescriptor, LineEncoding, LongLayout, ObjectLayout, ScalarLayout, SequenceLayout, TextLayout,
    ThreadStateLayout, TypeObjectLayout,
};
use super::types::TypeTag;
use super::BuildSignature;

const PY3_TYPES: &[(&str, TypeTag)] = &[
    ("PyBool_Type", TypeTag::Bool),
    ("PyLong_Type", TypeTag::Long),
    ("PyFloat_Type", TypeTag::Float),
    ("PyUnicode_Type", TypeTag::Str),
    ("PyBytes_Type", TypeTag::Bytes),
    ("PyList_Type", TypeTag::List),
    ("PyTuple_Type", TypeTag::Tuple),
    ("PyDict_Type", TypeTag::Dict),
    ("PyCode_Type", TypeTag::Code),
    ("PyFrame_Type", TypeTag::Frame),
    ("PyFunction_Type", TypeTag::Function),
    ("PyModule_Type", TypeTag::Module),
    ("PyType_Type", TypeTag::Type),
];

const PY2_TYPES: &[(&str, TypeTag)] = &[
    ("PyBool_Type", TypeTag::Bool),
    ("PyInt_Type", TypeTag::Int),
    ("PyLong_Type", TypeTag::Long),
    ("PyFloat_Type", TypeTag::Float),
    ("PyUnicode_Type", TypeTag::Str),
    ("PyString_Type", TypeTag::Bytes),
    ("PyList_Type", TypeTag::List),
    ("PyTuple_Type", TypeTag::Tuple),
    ("PyDict_Type", TypeTag::Dict),
    ("PyCode_Type", TypeTag::Code),
    ("PyFrame_Type", TypeTag::Frame),
    ("PyFunction_Type", TypeTag::Function),
    ("PyModule_Type", TypeTag::Module),
    ("PyType_Type", TypeTag::Type),
    ("PyClass_Type", TypeTag::ClassicClass),
    ("PyInstance_Type", TypeTag::ClassicInstance),
];

const OBJECT: ObjectLayout = ObjectLayout {
    refcnt: 0,
    ob_type: 8,
    ob_size: 16,
};

const TYPE_OBJECT: TypeObjectLayout = TypeObjectLayout {
    name: 24,
    flags: 168,
    dictoffset: 288,
    heap_type_flag: 1 << 9,
};

const LONG: LongLayout = LongLayout {
    digits: 24,
    digit_bits: 30,
    digit_size: 4,
};

const FLOAT: ScalarLayout = ScalarLayout { value: 16 };

const LIST: SequenceLayout = SequenceLayout {
    size: 16,
    items: 24,
    indirect: true,
};

const TUPLE: SequenceLayout = SequenceLayout {
    size: 16,
    items: 24,
    indirect: false,
};

fn python3(minor: u32) -> LayoutDescriptor
{
    // 3.10 dropped f_stacktop and f_executing; f_lasti now counts code units
    let frame = if minor >= 10 {
        FrameLayout {
            back: 24,
            code: 32,
            builtins: 40,
            globals: 48,
            locals: 56,
            lasti: 96,
            lasti_scale: 2,
            lineno: 100,
            localsplus: 352,
        }
    } else {
        FrameLayout {
            back: 24,
            code: 32,
            builtins: 40,
            globals: 48,
            locals: 56,
            lasti: 104,
            lasti_scale: 1,
            lineno: 108,
            localsplus: 360,
        }
    };

    let line_encoding = if minor >= 10 {
        LineEncoding::LineTable
    } else {
        LineEncoding::Lnotab { signed: true }
    };

    // _PyRuntime.gilstate.tstate_current; 3.9 moved gc and exitfuncs out
    // of the runtime state
    let tstate_current = if minor >= 9 { 568 } else { 1368 };

    LayoutDescriptor {
        build: BuildSignature::new(3, minor),
        object: OBJECT,
        type_object: TYPE_OBJECT,
        small_int: None,
        long: LONG,
        float: FLOAT,
        text: TextLayout::Compact {
            length: 16,
            state: 32,
            ascii_data: 48,
            compact_data: 72,
            data_pointer: 72,
        },
        bytes: BytesLayout { size: 16, data: 32 },
        list: LIST,
        tuple: TUPLE,
        dict: DictLayout::Compact {
            used: 16,
            keys: 32,
            values: 40,
            keys_size: 8,
            keys_nentries: 32,
            keys_indices: 40,
            entry_size: 24,
        },
        code: CodeLayout {
            nlocals: 28,
            firstlineno: 40,
            varnames: 72,
            filename: 104,
            name: 112,
            line_table: 120,
            line_encoding,
        },
        frame,
        thread: ThreadStateLayout {
            next: 8,
            frame: 24,
            recursion_depth: 32,
            curexc_type: 88,
            curexc_value: 96,
            curexc_traceback: 104,
            thread_id: 176,
        },
        interpreter: InterpreterLayout {
            next: 0,
            tstate_head: 8,
        },
        module_dict: 16,
        classic: None,
        interpreter_head: GlobalSlot::Field {
            symbol: "_PyRuntime",
            offset: 32,
        },
        gil_holder: GlobalSlot::Field {
            symbol: "_PyRuntime",
            offset: tstate_current,
        },
        type_symbols: PY3_TYPES,
        none_symbol: "_Py_NoneStruct",
        true_symbol: "_Py_TrueStruct",
    }
}

fn python27() -> LayoutDescriptor
{
    LayoutDescriptor {
        build: BuildSignature::new(2, 7),
        object: OBJECT,
        type_object: TYPE_OBJECT,
        small_int: Some(ScalarLayout { value: 16 }),
        long: LONG,
        float: FLOAT,
        text: TextLayout::Wide {
            length: 16,
            data_pointer: 24,
            unit_size: 4,
        },
        bytes: BytesLayout { size: 16, data: 36 },
        list: LIST,
        tuple: TUPLE,
        dict: DictLayout::Open {
            used: 24,
            mask: 32,
            table: 40,
            entry_size: 24,
        },
        code: CodeLayout {
            nlocals: 20,
            firstlineno: 96,
            varnames: 56,
            filename: 80,
            name: 88,
            line_table: 104,
            line_encoding: LineEncoding::Lnotab { signed: false },
        },
        frame: FrameLayout {
            back: 24,
            code: 32,
            builtins: 40,
            globals: 48,
            locals: 56,
            lasti: 120,
            lasti_scale: 1,
            lineno: 124,
            localsplus: 376,
        },
        thread: ThreadStateLayout {
            next: 0,
            frame: 16,
            recursion_depth: 24,
            curexc_type: 72,
            curexc_value: 80,
            curexc_traceback: 88,
            thread_id: 144,
        },
        interpreter: InterpreterLayout {
            next: 0,
            tstate_head: 8,
        },
        module_dict: 16,
        classic: Some(ClassicLayout {
            in_class: 16,
            in_dict: 24,
            cl_name: 32,
        }),
        interpreter_head: GlobalSlot::Pointer { symbol: "interp_head" },
        gil_holder: GlobalSlot::Pointer {
            symbol: "_PyThreadState_Current",
        },
        type_symbols: PY2_TYPES,
        none_symbol: "_Py_NoneStruct",
        true_symbol: "_Py_TrueStruct",
    }
}

static KNOWN_LAYOUTS: Lazy<Vec<LayoutDescriptor>> =
    Lazy::new(|| vec![python27(), python3(8), python3(9), python3(10)]);

/// The descriptor for `build`, if this build is known
pub fn lookup(build: BuildSignature) -> Option<&'static LayoutDescriptor>
{
    KNOWN_LAYOUTS.iter().find(|layout| layout.build == build)
}

/// Every build with a known layout
pub fn supported_builds() -> impl Iterator<Item = BuildSignature>
{
    KNOWN_LAYOUTS.iter().map(|layout| layout.build)
}
