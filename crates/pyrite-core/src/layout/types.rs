//! Type tags and the per-session table of built-in type addresses.

use std::collections::HashMap;
use std::fmt;

use crate::types::Address;

/// Classification of a remote object by its type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag
{
    /// The `None` singleton
    None,
    /// `bool`
    Bool,
    /// 2.x machine-word `int`
    Int,
    /// Arbitrary-precision `int` (3.x) / `long` (2.x)
    Long,
    /// `float`
    Float,
    /// Text string
    Str,
    /// Byte string
    Bytes,
    /// `list`
    List,
    /// `tuple`
    Tuple,
    /// `dict`
    Dict,
    /// Code object
    Code,
    /// Frame object
    Frame,
    /// Python function
    Function,
    /// Module
    Module,
    /// Type object
    Type,
    /// 2.x classic class
    ClassicClass,
    /// 2.x classic instance
    ClassicInstance,
    /// Instance of a heap (user-defined) type
    Instance,
    /// A frame's fast-local slots presented as a mapping
    FastLocals,
}

impl TypeTag
{
    /// The name CPython reports for objects of this kind
    pub fn name(self) -> &'static str
    {
        match self {
            TypeTag::None => "NoneType",
            TypeTag::Bool => "bool",
            TypeTag::Int | TypeTag::Long => "int",
            TypeTag::Float => "float",
            TypeTag::Str => "str",
            TypeTag::Bytes => "bytes",
            TypeTag::List => "list",
            TypeTag::Tuple => "tuple",
            TypeTag::Dict => "dict",
            TypeTag::Code => "code",
            TypeTag::Frame => "frame",
            TypeTag::Function => "function",
            TypeTag::Module => "module",
            TypeTag::Type => "type",
            TypeTag::ClassicClass => "classobj",
            TypeTag::ClassicInstance => "instance",
            TypeTag::Instance => "object",
            TypeTag::FastLocals => "fast locals",
        }
    }
}

impl fmt::Display for TypeTag
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

/// Built-in type addresses for one attached process
///
/// Resolved once at attach time; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeTable
{
    by_address: HashMap<Address, TypeTag>,
    none: Address,
    true_object: Address,
}

impl TypeTable
{
    /// Build a table from resolved type-object addresses and singletons
    pub fn new(types: impl IntoIterator<Item = (Address, TypeTag)>, none: Address, true_object: Address) -> Self
    {
        Self {
            by_address: types.into_iter().collect(),
            none,
            true_object,
        }
    }

    /// Tag of the type object at `type_address`, if it's a known built-in
    pub fn tag(&self, type_address: Address) -> Option<TypeTag>
    {
        self.by_address.get(&type_address).copied()
    }

    /// Address of the `None` singleton
    pub fn none(&self) -> Address
    {
        self.none
    }

    /// Address of the `True` singleton
    pub fn true_object(&self) -> Address
    {
        self.true_object
    }

    /// Number of known types
    pub fn len(&self) -> usize
    {
        self.by_address.len()
    }

    /// Whether no types are known
    pub fn is_empty(&self) -> bool
    {
        self.by_address.is_empty()
    }
}
