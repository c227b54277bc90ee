//! In-memory stand-in for a traced CPython 3.10 process
//!
//! [`FakeProcess`] lays real 3.10 object layouts out in a sparse address
//! space, so the engine's readers run unchanged against it. Inferior calls
//! are simulated: `PyRun_SimpleString` understands the injection wrapper
//! and a handful of statements the tests use.
//!
//! The default process has three runtime threads:
//!
//! - thread 1 runs `<module>` → `f` → `g` in `app.py`
//! - thread 2 runs `worker` with an `f_locals` dict
//! - thread 3 has no frames

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use byteorder::{ByteOrder, LE};
use pyrite_core::backend::{BackendError, BackendResult, InvocationError, ProcessControl, Symbol, ThreadRegisters};
use pyrite_core::types::{Address, ProcessHandle, ProcessId, ThreadId};
use pyrite_core::SessionManager;
use pyrite_utils::InspectorConfig;

/// PID of the fake target
pub const PID: u32 = 4242;

/// Program counter of every thread unless a test moves it
pub const SAFE_PC: u64 = 0x0050_1234;

/// Name of the `__main__` global the injection wrapper writes
pub const RESULT_NAME: &str = "__pyrite_result__";

const STATIC_BASE: u64 = 0x0060_0000;
const STATIC_SIZE: usize = 0x2_0000;
const RUNTIME_SIZE: usize = 1024;
/// `_PyRuntime.gilstate.tstate_current` on 3.10
const GIL_HOLDER: u64 = 568;
const HEAP_BASE: u64 = 0x1000_0000;
const HEAP_SIZE: usize = 0x40_0000;
const STACK_BASE: u64 = 0x7fff_0000;
const STACK_SIZE: usize = 0x3000;
const CODE_BASE: u64 = 0x0040_0000;

const TYPE_OBJECT_SIZE: usize = 400;
const HEAP_TYPE_FLAG: u64 = 1 << 9;
/// Buckets in every fake dict's keys table
const DICT_SLOTS: usize = 64;
/// 3.10 linetable: four 4-byte ranges, one line each
const LINE_TABLE: [u8; 8] = [4, 1, 4, 1, 4, 1, 4, 1];
/// ASCII, compact, ready, 1-byte kind
const ASCII_STATE: u32 = 0xe4;

const BUILTIN_TYPES: [(&str, &str); 13] = [
    ("PyBool_Type", "bool"),
    ("PyLong_Type", "int"),
    ("PyFloat_Type", "float"),
    ("PyUnicode_Type", "str"),
    ("PyBytes_Type", "bytes"),
    ("PyList_Type", "list"),
    ("PyTuple_Type", "tuple"),
    ("PyDict_Type", "dict"),
    ("PyCode_Type", "code"),
    ("PyFrame_Type", "frame"),
    ("PyFunction_Type", "function"),
    ("PyModule_Type", "module"),
    ("PyType_Type", "type"),
];

const FUNCTIONS: [&str; 9] = [
    "PyGILState_Ensure",
    "PyGILState_Release",
    "PyRun_SimpleString",
    "PyImport_AddModule",
    "PyErr_Clear",
    "malloc",
    "free",
    "take_gil",
    "drop_gil",
];

struct Region
{
    start: u64,
    data: Vec<u8>,
}

impl Region
{
    fn covers(&self, start: u64, end: u64) -> bool
    {
        start >= self.start && end <= self.start + self.data.len() as u64
    }
}

/// One OS thread of the fake target
#[derive(Debug, Clone)]
pub struct FakeThread
{
    /// Kernel thread id
    pub tid: ThreadId,
    /// `fs_base`, which is also the runtime thread identity
    pub pointer: u64,
    /// Its `PyThreadState`
    pub tstate: Address,
    /// Program counter
    pub pc: Address,
    /// Stack pointer
    pub sp: Address,
}

/// Addresses of the objects the default process is built from
#[derive(Debug, Clone, Default)]
pub struct Fixture
{
    pub globals: Address,
    pub builtins: Address,
    pub counter: Address,
    pub name: Address,
    pub items: Address,
    pub item_values: Vec<Address>,
    pub config: Address,
    pub obj: Address,
    pub blob: Address,
    pub pi: Address,
    pub big: Address,
    pub function: Address,
    pub mystery: Address,
    pub stray: Address,
    /// Thread 1's frames, innermost first
    pub frames: Vec<Address>,
    pub worker_frame: Address,
    pub tstates: Vec<Address>,
    pub runtime_ids: Vec<u64>,
    /// Exception pending on thread 1 before any injection
    pub exc_type: Address,
    pub exc_value: Address,
}

/// Contents of one frame object
pub struct FrameInit
{
    pub code: Address,
    pub back: Address,
    pub globals: Address,
    pub builtins: Address,
    pub locals: Address,
    pub lasti: i32,
    pub lineno: i32,
    pub fast: Vec<Address>,
}

/// State of the fake target
pub struct FakeProcess
{
    pub pid: ProcessId,
    regions: Vec<Region>,
    static_next: u64,
    heap_next: u64,
    symbols: Vec<Symbol>,
    pub images: Vec<PathBuf>,
    pub threads: Vec<FakeThread>,
    pub attached: bool,
    pub alive: bool,
    pub deny_permission: bool,
    /// Thread named in the last `pause_all_except`, while paused
    pub paused: Option<ThreadId>,
    pub attach_count: usize,
    pub detach_count: usize,
    pub resume_count: usize,
    pub liveness_checks: usize,
    /// Every `(address, len)` read, in order
    pub reads: Vec<(Address, usize)>,
    /// Name of every inferior function called, in order
    pub calls: Vec<String>,
    /// What `PyRun_SimpleString` returns for the wrapper script
    pub run_status: i32,
    pub main_module: Address,
    pub fixture: Fixture,
    imported: HashSet<String>,
    none: Address,
    true_object: Address,
    false_object: Address,
}

impl FakeProcess
{
    /// The default three-thread process
    pub fn new() -> Self
    {
        let mut process = Self {
            pid: ProcessId::from(PID),
            regions: vec![
                Region {
                    start: STATIC_BASE,
                    data: vec![0; STATIC_SIZE],
                },
                Region {
                    start: HEAP_BASE,
                    data: vec![0; HEAP_SIZE],
                },
                Region {
                    start: STACK_BASE,
                    data: vec![0; STACK_SIZE],
                },
            ],
            static_next: STATIC_BASE,
            heap_next: HEAP_BASE,
            symbols: Vec::new(),
            images: vec![
                PathBuf::from("/usr/bin/python3.10"),
                PathBuf::from("/usr/lib/x86_64-linux-gnu/libc.so.6"),
            ],
            threads: Vec::new(),
            attached: false,
            alive: true,
            deny_permission: false,
            paused: None,
            attach_count: 0,
            detach_count: 0,
            resume_count: 0,
            liveness_checks: 0,
            reads: Vec::new(),
            calls: Vec::new(),
            run_status: 0,
            main_module: Address::NULL,
            fixture: Fixture::default(),
            imported: HashSet::new(),
            none: Address::NULL,
            true_object: Address::NULL,
            false_object: Address::NULL,
        };
        process.build_runtime();
        process.build_program();
        process
    }

    // ---- memory -------------------------------------------------------

    fn region(&self, address: u64, len: usize) -> Option<&[u8]>
    {
        let end = address.checked_add(len as u64)?;
        let region = self.regions.iter().find(|region| region.covers(address, end))?;
        let offset = (address - region.start) as usize;
        Some(&region.data[offset..offset + len])
    }

    fn region_mut(&mut self, address: u64, len: usize) -> Option<&mut [u8]>
    {
        let end = address.checked_add(len as u64)?;
        let region = self.regions.iter_mut().find(|region| region.covers(address, end))?;
        let offset = (address - region.start) as usize;
        Some(&mut region.data[offset..offset + len])
    }

    /// Copy `len` bytes out, `None` if any byte is unmapped
    pub fn read(&self, address: Address, len: usize) -> Option<Vec<u8>>
    {
        self.region(address.value(), len).map(<[u8]>::to_vec)
    }

    /// Write bytes; panics on unmapped memory
    pub fn write(&mut self, address: Address, data: &[u8])
    {
        match self.region_mut(address.value(), data.len()) {
            Some(slot) => slot.copy_from_slice(data),
            None => panic!("fake write to unmapped {address}"),
        }
    }

    pub fn write_u64(&mut self, address: Address, value: u64)
    {
        self.write(address, &value.to_le_bytes());
    }

    pub fn write_ptr(&mut self, address: Address, value: Address)
    {
        self.write_u64(address, value.value());
    }

    pub fn write_i64(&mut self, address: Address, value: i64)
    {
        self.write(address, &value.to_le_bytes());
    }

    pub fn write_i32(&mut self, address: Address, value: i32)
    {
        self.write(address, &value.to_le_bytes());
    }

    pub fn read_u64(&self, address: Address) -> u64
    {
        LE::read_u64(&self.read(address, 8).expect("mapped u64"))
    }

    /// Hand the GIL to `tstate`, or release it with a null state
    pub fn set_gil_holder(&mut self, tstate: Address)
    {
        let slot = if self.symbols.iter().any(|symbol| symbol.name == "_PyThreadState_Current") {
            self.type_object("_PyThreadState_Current")
        } else {
            self.type_object("_PyRuntime") + GIL_HOLDER
        };
        self.write_ptr(slot, tstate);
    }

    /// Re-shape the runtime globals and thread states as a 2.7 build
    ///
    /// Only thread listing and the injection checks are meaningful
    /// afterwards; objects keep their 3.10 layout.
    pub fn as_python27(&mut self)
    {
        self.images[0] = PathBuf::from("/usr/bin/python2.7");
        for (symbol, name) in [
            ("PyInt_Type", "int"),
            ("PyString_Type", "str"),
            ("PyClass_Type", "classobj"),
            ("PyInstance_Type", "instance"),
        ] {
            let address = self.add_type(name, 0, 0);
            self.define(symbol, address, TYPE_OBJECT_SIZE as u64);
        }

        let interpreter = self.read_ptr(self.type_object("_PyRuntime") + 32);
        let head = self.alloc_static(8);
        self.write_ptr(head, interpreter);
        self.define("interp_head", head, 8);
        let current = self.alloc_static(8);
        self.define("_PyThreadState_Current", current, 8);

        // PyThreadState: next at 0, thread_id at 144
        let tstates = self.fixture.tstates.clone();
        for (index, &tstate) in tstates.iter().enumerate() {
            let next = tstates.get(index + 1).copied().unwrap_or(Address::NULL);
            self.write_ptr(tstate, next);
            self.write_u64(tstate + 144, self.fixture.runtime_ids[index]);
        }
    }

    pub fn read_ptr(&self, address: Address) -> Address
    {
        Address::new(self.read_u64(address))
    }

    pub fn read_i32(&self, address: Address) -> i32
    {
        LE::read_i32(&self.read(address, 4).expect("mapped i32"))
    }

    fn cstring(&self, address: Address) -> String
    {
        let mut bytes = Vec::new();
        let mut cursor = address;
        while let Some(byte) = self.read(cursor, 1) {
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
            cursor = cursor + 1;
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Zeroed heap allocation, 16-byte aligned
    pub fn alloc(&mut self, size: usize) -> Address
    {
        let address = self.heap_next;
        self.heap_next += (size.max(1) as u64 + 15) & !15;
        assert!(self.heap_next <= HEAP_BASE + HEAP_SIZE as u64, "fake heap exhausted");
        Address::new(address)
    }

    fn alloc_static(&mut self, size: usize) -> Address
    {
        let address = self.static_next;
        self.static_next += (size as u64 + 15) & !15;
        assert!(self.static_next <= STATIC_BASE + STATIC_SIZE as u64, "fake static area exhausted");
        Address::new(address)
    }

    fn static_cstring(&mut self, text: &str) -> Address
    {
        let address = self.alloc_static(text.len() + 1);
        self.write(address, text.as_bytes());
        address
    }

    fn object(&mut self, ob_type: Address, size: usize) -> Address
    {
        let address = self.alloc(size);
        self.write_i64(address, 1);
        self.write_ptr(address + 8, ob_type);
        address
    }

    // ---- symbols ------------------------------------------------------

    fn define(&mut self, name: &str, address: Address, size: u64)
    {
        self.symbols.push(Symbol {
            name: name.to_string(),
            address,
            size,
        });
    }

    /// A defined symbol; panics if missing
    pub fn symbol(&self, name: &str) -> Symbol
    {
        self.symbols
            .iter()
            .find(|symbol| symbol.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("fake symbol {name} not defined"))
    }

    /// Make a symbol unresolvable
    pub fn remove_symbol(&mut self, name: &str)
    {
        self.symbols.retain(|symbol| symbol.name != name);
    }

    /// Address of a built-in type object
    pub fn type_object(&self, symbol: &str) -> Address
    {
        self.symbol(symbol).address
    }

    fn function_at(&self, address: Address) -> Option<String>
    {
        self.symbols
            .iter()
            .find(|symbol| symbol.address == address && FUNCTIONS.contains(&symbol.name.as_str()))
            .map(|symbol| symbol.name.clone())
    }

    // ---- objects --------------------------------------------------------

    fn add_type(&mut self, name: &str, flags: u64, dictoffset: i64) -> Address
    {
        let address = self.alloc_static(TYPE_OBJECT_SIZE);
        let tp_name = self.static_cstring(name);
        self.write_i64(address, 1);
        self.write_ptr(address + 24, tp_name);
        self.write_u64(address + 168, flags);
        self.write_i64(address + 288, dictoffset);
        address
    }

    /// A user-defined class whose instances keep a `__dict__` at offset 16
    pub fn heap_type(&mut self, name: &str) -> Address
    {
        let address = self.add_type(name, HEAP_TYPE_FLAG, 16);
        let meta = self.type_object("PyType_Type");
        self.write_ptr(address + 8, meta);
        address
    }

    /// A built-in-style type the classifier doesn't know
    pub fn opaque_type(&mut self, name: &str) -> Address
    {
        let address = self.add_type(name, 0, 0);
        let meta = self.type_object("PyType_Type");
        self.write_ptr(address + 8, meta);
        address
    }

    pub fn none(&self) -> Address
    {
        self.none
    }

    pub fn bool(&self, value: bool) -> Address
    {
        if value {
            self.true_object
        } else {
            self.false_object
        }
    }

    /// ASCII compact `str`
    pub fn str(&mut self, text: &str) -> Address
    {
        assert!(text.is_ascii(), "fake strings are ASCII");
        let ob_type = self.type_object("PyUnicode_Type");
        let address = self.object(ob_type, 48 + text.len() + 1);
        self.write_i64(address + 16, text.len() as i64);
        self.write_i64(address + 24, -1);
        self.write(address + 32, &ASCII_STATE.to_le_bytes());
        self.write(address + 48, text.as_bytes());
        address
    }

    /// Text of a string made by [`str`](Self::str)
    pub fn str_text(&self, address: Address) -> String
    {
        let len = self.read_u64(address + 16) as usize;
        String::from_utf8_lossy(&self.read(address + 48, len).expect("mapped str")).into_owned()
    }

    /// `int` with 30-bit digits
    pub fn int(&mut self, value: i64) -> Address
    {
        let mut digits = Vec::new();
        let mut magnitude = value.unsigned_abs();
        while magnitude > 0 {
            digits.push((magnitude & 0x3fff_ffff) as u32);
            magnitude >>= 30;
        }
        let ob_type = self.type_object("PyLong_Type");
        let address = self.object(ob_type, 24 + 4 * digits.len().max(1));
        let size = digits.len() as i64;
        self.write_i64(address + 16, if value < 0 { -size } else { size });
        for (index, digit) in digits.iter().enumerate() {
            self.write(address + 24 + 4 * index as u64, &digit.to_le_bytes());
        }
        address
    }

    pub fn float(&mut self, value: f64) -> Address
    {
        let ob_type = self.type_object("PyFloat_Type");
        let address = self.object(ob_type, 24);
        self.write(address + 16, &value.to_le_bytes());
        address
    }

    pub fn bytes(&mut self, data: &[u8]) -> Address
    {
        let ob_type = self.type_object("PyBytes_Type");
        let address = self.object(ob_type, 32 + data.len() + 1);
        self.write_i64(address + 16, data.len() as i64);
        self.write_i64(address + 24, -1);
        self.write(address + 32, data);
        address
    }

    pub fn list(&mut self, items: &[Address]) -> Address
    {
        let array = if items.is_empty() {
            Address::NULL
        } else {
            self.alloc(8 * items.len())
        };
        for (index, item) in items.iter().enumerate() {
            self.write_ptr(array.element(index, 8), *item);
        }
        let ob_type = self.type_object("PyList_Type");
        let address = self.object(ob_type, 40);
        self.write_i64(address + 16, items.len() as i64);
        self.write_ptr(address + 24, array);
        self.write_i64(address + 32, items.len() as i64);
        address
    }

    pub fn tuple(&mut self, items: &[Address]) -> Address
    {
        let ob_type = self.type_object("PyTuple_Type");
        let address = self.object(ob_type, 24 + 8 * items.len());
        self.write_i64(address + 16, items.len() as i64);
        for (index, item) in items.iter().enumerate() {
            self.write_ptr((address + 24).element(index, 8), *item);
        }
        address
    }

    /// Combined-table dict with string keys
    pub fn dict(&mut self, entries: &[(&str, Address)]) -> Address
    {
        assert!(entries.len() <= DICT_SLOTS, "fake dicts hold at most {DICT_SLOTS} entries");
        let keys = self.alloc(40 + DICT_SLOTS + DICT_SLOTS * 24);
        self.write_i64(keys, 1);
        self.write_i64(keys + 8, DICT_SLOTS as i64);
        self.write(keys + 40, &[0xff; DICT_SLOTS]);

        let ob_type = self.type_object("PyDict_Type");
        let address = self.object(ob_type, 48);
        self.write_ptr(address + 32, keys);
        for (key, value) in entries {
            self.dict_insert(address, key, *value);
        }
        address
    }

    fn entry_table(&self, dict: Address) -> Address
    {
        self.read_ptr(dict + 32) + 40 + DICT_SLOTS as u64
    }

    fn dict_find(&self, dict: Address, key: &str) -> Option<Address>
    {
        let keys = self.read_ptr(dict + 32);
        let count = self.read_u64(keys + 32) as usize;
        let table = self.entry_table(dict);
        (0..count).map(|index| table.element(index, 24)).find(|entry| {
            let key_object = self.read_ptr(*entry + 8);
            let value = self.read_ptr(*entry + 16);
            !key_object.is_null() && !value.is_null() && self.str_text(key_object) == key
        })
    }

    /// Set `dict[key] = value`
    pub fn dict_insert(&mut self, dict: Address, key: &str, value: Address)
    {
        if let Some(entry) = self.dict_find(dict, key) {
            self.write_ptr(entry + 16, value);
            return;
        }
        let keys = self.read_ptr(dict + 32);
        let count = self.read_u64(keys + 32) as usize;
        assert!(count < DICT_SLOTS, "fake dict is full");

        let key_object = self.str(key);
        let entry = self.entry_table(dict).element(count, 24);
        self.write_i64(entry, 0x5eed + count as i64);
        self.write_ptr(entry + 8, key_object);
        self.write_ptr(entry + 16, value);
        self.write(keys + 40 + count as u64, &[count as u8]);
        self.write_i64(keys + 32, count as i64 + 1);
        let used = self.read_u64(dict + 16);
        self.write_u64(dict + 16, used + 1);
    }

    /// `del dict[key]`, leaving a deleted slot behind
    pub fn dict_remove(&mut self, dict: Address, key: &str)
    {
        if let Some(entry) = self.dict_find(dict, key) {
            self.write_ptr(entry + 16, Address::NULL);
            let used = self.read_u64(dict + 16);
            self.write_u64(dict + 16, used - 1);
        }
    }

    /// Whether `dict` has a live `key`
    pub fn dict_contains(&self, dict: Address, key: &str) -> bool
    {
        self.dict_find(dict, key).is_some()
    }

    /// Instance of a heap type with a `__dict__`
    pub fn instance(&mut self, ob_type: Address, attributes: &[(&str, Address)]) -> Address
    {
        let dict = self.dict(attributes);
        let address = self.object(ob_type, 24);
        self.write_ptr(address + 16, dict);
        address
    }

    pub fn code(&mut self, name: &str, filename: &str, firstlineno: i32, varnames: &[&str]) -> Address
    {
        let names: Vec<Address> = varnames.iter().map(|name| self.str(name)).collect();
        let varnames_tuple = self.tuple(&names);
        let filename = self.str(filename);
        let name = self.str(name);
        let table = self.bytes(&LINE_TABLE);

        let ob_type = self.type_object("PyCode_Type");
        let address = self.object(ob_type, 160);
        self.write_i32(address + 28, varnames.len() as i32);
        self.write_i32(address + 40, firstlineno);
        self.write_ptr(address + 72, varnames_tuple);
        self.write_ptr(address + 104, filename);
        self.write_ptr(address + 112, name);
        self.write_ptr(address + 120, table);
        address
    }

    pub fn frame(&mut self, init: FrameInit) -> Address
    {
        let ob_type = self.type_object("PyFrame_Type");
        let address = self.object(ob_type, 352 + 8 * init.fast.len().max(1));
        self.write_ptr(address + 24, init.back);
        self.write_ptr(address + 32, init.code);
        self.write_ptr(address + 40, init.builtins);
        self.write_ptr(address + 48, init.globals);
        self.write_ptr(address + 56, init.locals);
        self.write_i32(address + 96, init.lasti);
        self.write_i32(address + 100, init.lineno);
        for (index, value) in init.fast.iter().enumerate() {
            self.write_ptr((address + 352).element(index, 8), *value);
        }
        address
    }

    fn thread_state(&mut self, runtime_id: u64) -> Address
    {
        let address = self.alloc(200);
        self.write_u64(address + 176, runtime_id);
        address
    }

    // ---- the default process --------------------------------------------

    fn build_runtime(&mut self)
    {
        for (symbol, name) in BUILTIN_TYPES {
            let address = self.add_type(name, 0, 0);
            self.define(symbol, address, TYPE_OBJECT_SIZE as u64);
        }
        let meta = self.type_object("PyType_Type");
        for (symbol, _) in BUILTIN_TYPES {
            let address = self.type_object(symbol);
            self.write_ptr(address + 8, meta);
        }

        let none_type = self.opaque_type("NoneType");
        self.none = self.alloc_static(16);
        self.write_i64(self.none, 1);
        self.write_ptr(self.none + 8, none_type);
        self.define("_Py_NoneStruct", self.none, 16);

        let bool_type = self.type_object("PyBool_Type");
        for (symbol, value) in [("_Py_TrueStruct", 1i64), ("_Py_FalseStruct", 0)] {
            let address = self.alloc_static(32);
            self.write_i64(address, 1);
            self.write_ptr(address + 8, bool_type);
            self.write_i64(address + 16, value);
            self.write_i64(address + 24, value);
            self.define(symbol, address, 32);
        }
        self.true_object = self.type_object("_Py_TrueStruct");
        self.false_object = self.type_object("_Py_FalseStruct");

        let runtime = self.alloc_static(RUNTIME_SIZE);
        self.define("_PyRuntime", runtime, RUNTIME_SIZE as u64);

        for (index, name) in FUNCTIONS.iter().enumerate() {
            self.define(name, Address::new(CODE_BASE + 0x100 * index as u64), 0x80);
        }
    }

    fn build_program(&mut self)
    {
        let mut fixture = Fixture {
            counter: self.int(42),
            name: self.str("pyrite-inspector"),
            pi: self.float(3.5),
            blob: self.bytes(b"\x00ab"),
            big: self.int(-(1i64 << 40)),
            ..Fixture::default()
        };

        fixture.item_values = vec![self.int(1), self.int(2), self.int(3)];
        fixture.items = self.list(&fixture.item_values.clone());
        let debug = self.bool(true);
        fixture.config = self.dict(&[("debug", debug)]);

        let widget = self.heap_type("Widget");
        let size = self.int(3);
        let label = self.str("w");
        fixture.obj = self.instance(widget, &[("size", size), ("label", label)]);

        let function_type = self.type_object("PyFunction_Type");
        fixture.function = self.object(function_type, 64);
        let mystery_type = self.opaque_type("mystery");
        fixture.mystery = self.object(mystery_type, 32);
        // Type pointer into unmapped memory
        fixture.stray = self.object(Address::new(0xdead_0000), 32);

        let builtin_type = self.opaque_type("builtin_function_or_method");
        let len_builtin = self.object(builtin_type, 48);
        fixture.builtins = self.dict(&[("len", len_builtin)]);

        let main_name = self.str("__main__");
        let nothing = self.none();
        fixture.globals = self.dict(&[
            ("__name__", main_name),
            ("counter", fixture.counter),
            ("name", fixture.name),
            ("items", fixture.items),
            ("config", fixture.config),
            ("obj", fixture.obj),
            ("blob", fixture.blob),
            ("pi", fixture.pi),
            ("nothing", nothing),
            ("big", fixture.big),
            ("fn", fixture.function),
            ("mystery", fixture.mystery),
        ]);

        let module_type = self.type_object("PyModule_Type");
        self.main_module = self.object(module_type, 48);
        self.write_ptr(self.main_module + 16, fixture.globals);

        // Thread 1: <module> -> f -> g
        let module_code = self.code("<module>", "app.py", 1, &[]);
        let module_frame = self.frame(FrameInit {
            code: module_code,
            back: Address::NULL,
            globals: fixture.globals,
            builtins: fixture.builtins,
            locals: fixture.globals,
            lasti: 6,
            lineno: 5,
            fast: Vec::new(),
        });
        let f_code = self.code("f", "app.py", 20, &["a"]);
        let f_frame = self.frame(FrameInit {
            code: f_code,
            back: module_frame,
            globals: fixture.globals,
            builtins: fixture.builtins,
            locals: Address::NULL,
            lasti: 2,
            lineno: 22,
            fast: vec![fixture.items],
        });
        let g_code = self.code("g", "app.py", 30, &["x", "y", "z"]);
        let x = self.int(7);
        let y = self.str("hello");
        let g_frame = self.frame(FrameInit {
            code: g_code,
            back: f_frame,
            globals: fixture.globals,
            builtins: fixture.builtins,
            locals: Address::NULL,
            lasti: 0,
            lineno: 31,
            fast: vec![x, y, Address::NULL],
        });
        fixture.frames = vec![g_frame, f_frame, module_frame];

        // Thread 2: worker, with a locals dict; lasti past the line table
        let worker_code = self.code("worker", "worker.py", 40, &[]);
        let job = self.int(5);
        let worker_locals = self.dict(&[("job", job)]);
        fixture.worker_frame = self.frame(FrameInit {
            code: worker_code,
            back: Address::NULL,
            globals: fixture.globals,
            builtins: fixture.builtins,
            locals: worker_locals,
            lasti: 100,
            lineno: 77,
            fast: Vec::new(),
        });

        fixture.runtime_ids = vec![0x7f00_0000_1000, 0x7f00_0000_2000, 0x7f00_0000_3000];
        fixture.tstates = fixture
            .runtime_ids
            .clone()
            .into_iter()
            .map(|id| self.thread_state(id))
            .collect();
        let [t1, t2, t3] = [fixture.tstates[0], fixture.tstates[1], fixture.tstates[2]];
        self.write_ptr(t1 + 8, t2);
        self.write_ptr(t2 + 8, t3);
        self.write_ptr(t1 + 24, g_frame);
        self.write_ptr(t2 + 24, fixture.worker_frame);

        // Thread 1 is handling an exception and is three calls deep
        let error_type = self.heap_type("KeyError");
        fixture.exc_type = error_type;
        fixture.exc_value = self.instance(error_type, &[]);
        self.write_ptr(t1 + 88, fixture.exc_type);
        self.write_ptr(t1 + 96, fixture.exc_value);
        self.write_i32(t1 + 32, 3);
        self.write_i32(t2 + 32, 1);

        let interpreter = self.alloc(64);
        self.write_ptr(interpreter + 8, t1);
        let runtime = self.type_object("_PyRuntime");
        self.write_ptr(runtime + 32, interpreter);

        for (index, (&pointer, &tstate)) in fixture.runtime_ids.iter().zip(&fixture.tstates).enumerate() {
            self.threads.push(FakeThread {
                tid: ThreadId::from(1001 + index as u64),
                pointer,
                tstate,
                pc: Address::new(SAFE_PC),
                sp: Address::new(STACK_BASE + 0x1000 * index as u64 + 0x800),
            });
        }

        self.fixture = fixture;
    }

    // ---- simulated target code ------------------------------------------

    fn thread(&self, tid: ThreadId) -> BackendResult<&FakeThread>
    {
        self.threads
            .iter()
            .find(|thread| thread.tid == tid)
            .ok_or_else(|| BackendError::Control(format!("no thread {tid}")))
    }

    fn check(&self, handle: &ProcessHandle) -> BackendResult<()>
    {
        if self.attached && handle.pid() == self.pid {
            Ok(())
        } else {
            Err(BackendError::Control(format!("process {} is not attached", handle.pid())))
        }
    }

    fn call(&mut self, thread: ThreadId, name: &str, args: &[u64]) -> BackendResult<u64>
    {
        let arg = |index: usize| args.get(index).copied().unwrap_or(0);
        match name {
            "malloc" => Ok(self.alloc(arg(0) as usize).value()),
            "PyGILState_Ensure" => Ok(1),
            "PyErr_Clear" => {
                let tstate = self.thread(thread)?.tstate;
                for offset in [88, 96, 104] {
                    self.write_ptr(tstate + offset, Address::NULL);
                }
                Ok(0)
            }
            "PyImport_AddModule" => {
                let module = if self.cstring(Address::new(arg(0))) == "__main__" {
                    self.main_module
                } else {
                    Address::NULL
                };
                Ok(module.value())
            }
            "PyRun_SimpleString" => self.run_string(thread, Address::new(arg(0))),
            _ => Ok(0),
        }
    }

    fn run_string(&mut self, thread: ThreadId, script: Address) -> BackendResult<u64>
    {
        let script = self.cstring(script);
        let globals = self.fixture.globals;
        if script.starts_with("globals().pop(") {
            self.dict_remove(globals, RESULT_NAME);
            return Ok(0);
        }
        if self.run_status != 0 {
            return Ok(u64::from(self.run_status as u32));
        }

        let (Some(source), Some(filename)) = (hex_literal(&script, 0), hex_literal(&script, 1)) else {
            return Ok(u64::from(-1i32 as u32));
        };

        // The wrapper itself leaves an exception set and the depth raised
        let tstate = self.thread(thread)?.tstate;
        let depth = self.read_i32(tstate + 32);
        self.write_i32(tstate + 32, depth + 2);
        let junk = self.fixture.mystery;
        self.write_ptr(tstate + 88, junk);

        let pointer = self.thread(thread)?.pointer;
        let (stdout, failure) = self.exec(&source, pointer)?;
        let traceback = match failure {
            Some((line, message)) => format!(
                "Traceback (most recent call last):\n  File \"{filename}\", line {line}, in <module>\n{message}\n"
            ),
            None => String::new(),
        };

        let ok = self.bool(traceback.is_empty());
        let stdout = self.str(&stdout);
        let traceback = self.str(&traceback);
        let result = self.tuple(&[ok, stdout, traceback]);
        self.dict_insert(globals, RESULT_NAME, result);
        Ok(0)
    }

    /// Run the few statements the tests use; returns stdout and the line
    /// and message of a raised exception
    fn exec(&mut self, source: &str, pointer: u64) -> BackendResult<(String, Option<(usize, String)>)>
    {
        let mut stdout = String::new();
        for (index, line) in source.lines().enumerate() {
            let line = line.trim();
            let number = index + 1;

            if line == "while True: pass" {
                return Err(InvocationError::TimedOut.into());
            }
            if line.starts_with("os._exit") {
                self.alive = false;
                return Err(InvocationError::TargetExited.into());
            }
            if line == "print(threading.current_thread().ident)" {
                if !self.imported.contains("threading") {
                    return Ok((stdout, Some((number, "NameError: name 'threading' is not defined".to_string()))));
                }
                stdout.push_str(&format!("{pointer}\n"));
                continue;
            }
            if let Some(module) = line.strip_prefix("import ") {
                self.imported.insert(module.trim().to_string());
                continue;
            }
            if let Some(text) = line.strip_prefix("print(").and_then(|rest| rest.strip_suffix(')')) {
                stdout.push_str(text.trim_matches(|c| c == '\'' || c == '"'));
                stdout.push('\n');
                continue;
            }
            if let Some(exception) = line.strip_prefix("raise ") {
                let message = match exception.split_once('(') {
                    Some((name, rest)) => {
                        let text = rest.trim_end_matches(')').trim_matches(|c| c == '\'' || c == '"');
                        format!("{name}: {text}")
                    }
                    None => exception.to_string(),
                };
                return Ok((stdout, Some((number, message))));
            }
        }
        Ok((stdout, None))
    }
}

impl Default for FakeProcess
{
    fn default() -> Self
    {
        Self::new()
    }
}

/// The `index`-th `fromhex('...')` literal of a wrapper script, decoded
fn hex_literal(script: &str, index: usize) -> Option<String>
{
    let marker = "fromhex('";
    let mut rest = script;
    for _ in 0..index {
        rest = &rest[rest.find(marker)? + marker.len()..];
    }
    let start = rest.find(marker)? + marker.len();
    let end = start + rest[start..].find('\'')?;
    let hex = &rest[start..end];

    let bytes: Option<Vec<u8>> = (0..hex.len())
        .step_by(2)
        .map(|at| u8::from_str_radix(hex.get(at..at + 2)?, 16).ok())
        .collect();
    String::from_utf8(bytes?).ok()
}

/// [`ProcessControl`] over a shared [`FakeProcess`]
#[derive(Clone)]
pub struct FakeBackend
{
    process: Arc<Mutex<FakeProcess>>,
}

impl FakeBackend
{
    pub fn new(process: Arc<Mutex<FakeProcess>>) -> Self
    {
        Self { process }
    }

    fn lock(&self) -> MutexGuard<'_, FakeProcess>
    {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessControl for FakeBackend
{
    fn attach(&mut self, pid: ProcessId) -> BackendResult<ProcessHandle>
    {
        let mut process = self.lock();
        if pid != process.pid || !process.alive {
            return Err(BackendError::NotFound(pid));
        }
        if process.deny_permission {
            return Err(BackendError::PermissionDenied {
                pid,
                reason: "ptrace_scope forbids attaching".to_string(),
            });
        }
        process.attached = true;
        process.attach_count += 1;
        Ok(ProcessHandle::new(pid))
    }

    fn detach(&mut self, handle: &ProcessHandle) -> BackendResult<()>
    {
        let mut process = self.lock();
        process.check(handle)?;
        process.attached = false;
        process.paused = None;
        process.detach_count += 1;
        Ok(())
    }

    fn is_alive(&self, _handle: &ProcessHandle) -> bool
    {
        let mut process = self.lock();
        process.liveness_checks += 1;
        process.alive
    }

    fn list_os_threads(&self, handle: &ProcessHandle) -> BackendResult<Vec<ThreadId>>
    {
        let process = self.lock();
        process.check(handle)?;
        Ok(process.threads.iter().map(|thread| thread.tid).collect())
    }

    fn read_memory(&self, handle: &ProcessHandle, address: Address, len: usize) -> BackendResult<Vec<u8>>
    {
        let mut process = self.lock();
        process.check(handle)?;
        process.reads.push((address, len));
        process.read(address, len).ok_or_else(|| BackendError::Read {
            address,
            len,
            reason: "unmapped".to_string(),
        })
    }

    fn write_memory(&mut self, handle: &ProcessHandle, address: Address, data: &[u8]) -> BackendResult<()>
    {
        let mut process = self.lock();
        process.check(handle)?;
        match process.region_mut(address.value(), data.len()) {
            Some(slot) => {
                slot.copy_from_slice(data);
                Ok(())
            }
            None => Err(BackendError::Write {
                address,
                len: data.len(),
                reason: "unmapped".to_string(),
            }),
        }
    }

    fn resolve_symbol(&self, handle: &ProcessHandle, name: &str) -> BackendResult<Symbol>
    {
        let process = self.lock();
        process.check(handle)?;
        process
            .symbols
            .iter()
            .find(|symbol| symbol.name == name)
            .cloned()
            .ok_or_else(|| BackendError::Symbol(name.to_string()))
    }

    fn mapped_images(&self, handle: &ProcessHandle) -> BackendResult<Vec<PathBuf>>
    {
        let process = self.lock();
        process.check(handle)?;
        Ok(process.images.clone())
    }

    fn pause_all_except(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<()>
    {
        let mut process = self.lock();
        process.check(handle)?;
        process.thread(thread)?;
        process.paused = Some(thread);
        Ok(())
    }

    fn resume_all(&mut self, handle: &ProcessHandle) -> BackendResult<()>
    {
        let mut process = self.lock();
        process.check(handle)?;
        process.paused = None;
        process.resume_count += 1;
        Ok(())
    }

    fn thread_registers(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<ThreadRegisters>
    {
        let process = self.lock();
        process.check(handle)?;
        let thread = process.thread(thread)?;
        Ok(ThreadRegisters {
            pc: thread.pc,
            sp: thread.sp,
        })
    }

    fn thread_pointer(&mut self, handle: &ProcessHandle, thread: ThreadId) -> BackendResult<u64>
    {
        let process = self.lock();
        process.check(handle)?;
        Ok(process.thread(thread)?.pointer)
    }

    fn invoke_inferior_function(
        &mut self,
        handle: &ProcessHandle,
        thread: ThreadId,
        function: Address,
        args: &[u64],
        _timeout: Duration,
    ) -> BackendResult<u64>
    {
        let mut process = self.lock();
        process.check(handle)?;
        if process.paused != Some(thread) {
            return Err(InvocationError::Failed(format!("thread {thread} is not stopped")).into());
        }
        let Some(name) = process.function_at(function) else {
            return Err(InvocationError::Faulted { signal: 11 }.into());
        };
        process.calls.push(name.clone());
        process.call(thread, &name, args)
    }
}

/// A manager wired to a fake process, with the process kept reachable
pub struct Harness
{
    pub manager: SessionManager<FakeBackend>,
    pub process: Arc<Mutex<FakeProcess>>,
}

impl Harness
{
    /// Run `f` with the fake process locked
    ///
    /// Never call into the manager from inside `f`; the backend needs the
    /// same lock.
    pub fn with<T>(&self, f: impl FnOnce(&mut FakeProcess) -> T) -> T
    {
        let mut process = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut process)
    }

    /// Copy of the fixture addresses
    pub fn fixture(&self) -> Fixture
    {
        self.with(|process| process.fixture.clone())
    }

    pub fn pid(&self) -> ProcessId
    {
        ProcessId::from(PID)
    }

    /// Attach, panicking on failure
    pub fn attach(&self)
    {
        self.manager.attach(self.pid()).expect("attach to fake process");
    }
}

/// Config with small bounds suitable for tests
pub fn test_config() -> InspectorConfig
{
    InspectorConfig {
        inject_timeout: Duration::from_millis(50),
        max_frames: 64,
        max_threads: 16,
        ..InspectorConfig::default()
    }
}

/// Detached harness over the default process
pub fn harness_with(config: InspectorConfig) -> Harness
{
    let process = Arc::new(Mutex::new(FakeProcess::new()));
    Harness {
        manager: SessionManager::new(FakeBackend::new(Arc::clone(&process)), config),
        process,
    }
}

/// Harness attached to the default process
pub fn attached() -> Harness
{
    let harness = harness_with(test_config());
    harness.attach();
    harness
}

/// Harness attached with a custom config
pub fn attached_with(config: InspectorConfig) -> Harness
{
    let harness = harness_with(config);
    harness.attach();
    harness
}
