//! # Remote Values
//!
//! What a remote address turns into once classified.
//!
//! ```text
//! RemoteValue
//! ├── Scalar   copied out in full (None, bool, int, float, str, bytes)
//! ├── Proxy    lazy handle: address + type tag + owning session
//! │            └── Shape: Sequence | Mapping | Instance
//! └── Opaque   descriptive text for anything not navigable
//! ```
//!
//! Proxies never hold element *values*, only element *addresses*.
//! Following one classifies exactly one more object, so cyclic object
//! graphs in the target can't make the controller loop.

pub mod classify;
pub mod text;

use std::fmt;

pub use classify::{Classifier, Limits};

use crate::layout::TypeTag;
use crate::types::{Address, SessionId};

/// A classified remote object
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue
{
    /// Fully materialised value
    Scalar(Scalar),
    /// Lazy handle to a container or instance
    Proxy(Proxy),
    /// Not further navigable; the text describes what it is
    Opaque(String),
}

impl RemoteValue
{
    /// The proxy, if this is one
    pub fn as_proxy(&self) -> Option<&Proxy>
    {
        match self {
            RemoteValue::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// The scalar, if this is one
    pub fn as_scalar(&self) -> Option<&Scalar>
    {
        match self {
            RemoteValue::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    /// Whether this is an opaque description
    pub fn is_opaque(&self) -> bool
    {
        matches!(self, RemoteValue::Opaque(_))
    }

    /// Text content of a `str` scalar
    pub fn as_str(&self) -> Option<&str>
    {
        match self {
            RemoteValue::Scalar(Scalar::Str { text, .. }) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteValue
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            RemoteValue::Scalar(scalar) => scalar.fmt(f),
            RemoteValue::Proxy(proxy) => proxy.fmt(f),
            RemoteValue::Opaque(description) => f.write_str(description),
        }
    }
}

/// A materialised value
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar
{
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// An integer that fits in 128 bits
    Int(i128),
    /// `float`
    Float(f64),
    /// Text, possibly cut at the configured byte bound
    Str
    {
        /// Decoded text
        text: String,
        /// Whether the remote string was longer than what was copied
        truncated: bool,
    },
    /// Raw bytes, possibly cut at the configured byte bound
    Bytes
    {
        /// Copied bytes
        data: Vec<u8>,
        /// Whether the remote object was longer than what was copied
        truncated: bool,
    },
}

impl fmt::Display for Scalar
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Scalar::None => f.write_str("None"),
            Scalar::Bool(true) => f.write_str("True"),
            Scalar::Bool(false) => f.write_str("False"),
            Scalar::Int(value) => write!(f, "{value}"),
            Scalar::Float(value) => {
                if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
                    write!(f, "{value:.1}")
                } else {
                    write!(f, "{value}")
                }
            }
            Scalar::Str { text, truncated } => {
                write!(f, "{}", text::quote_str(text))?;
                if *truncated {
                    f.write_str("...")?;
                }
                Ok(())
            }
            Scalar::Bytes { data, truncated } => {
                write!(f, "{}", text::quote_bytes(data))?;
                if *truncated {
                    f.write_str("...")?;
                }
                Ok(())
            }
        }
    }
}

/// Lazy handle to a remote container or instance
///
/// Only valid inside the session that produced it; every accessor checks
/// [`session`](Proxy::session) first.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy
{
    /// Address of the remote object
    pub address: Address,
    /// Classified type
    pub tag: TypeTag,
    /// Owning session
    pub session: SessionId,
    /// What was materialised at classification time
    pub shape: Shape,
}

impl Proxy
{
    /// Number of elements, entries or attributes
    pub fn len(&self) -> usize
    {
        match &self.shape {
            Shape::Sequence { len, .. } => *len,
            Shape::Mapping { entries, .. } => entries.len(),
            Shape::Instance { attributes, .. } => attributes.len(),
        }
    }

    /// Whether the container is empty
    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }
}

impl fmt::Display for Proxy
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match &self.shape {
            Shape::Sequence { len, .. } => {
                write!(f, "<{} of {len} items at remote {}>", self.tag, self.address)
            }
            Shape::Mapping { entries, truncated } => {
                let more = if *truncated { "+" } else { "" };
                write!(f, "<{} of {}{more} entries at remote {}>", self.tag, entries.len(), self.address)
            }
            Shape::Instance { type_name, .. } => {
                write!(f, "<proxy of {type_name} object at remote {}>", self.address)
            }
        }
    }
}

/// The materialised part of a proxy
#[derive(Debug, Clone, PartialEq)]
pub enum Shape
{
    /// `list` / `tuple`: size and the address of the item-pointer array
    Sequence
    {
        /// Number of items
        len: usize,
        /// First item pointer
        items: Address,
    },
    /// `dict` or a frame's fast locals: key/value addresses in table order
    Mapping
    {
        /// Live entries
        entries: Vec<MappingEntry>,
        /// Whether entries past the configured bound were left out
        truncated: bool,
    },
    /// Instance of a user-defined class: attribute names with value
    /// addresses
    Instance
    {
        /// Name of the instance's class
        type_name: String,
        /// Attributes from the instance dictionary
        attributes: Vec<MappingEntry>,
    },
}

/// One key/value pair of a mapping or instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry
{
    /// Key
    pub key: EntryKey,
    /// Address of the value object
    pub value: Address,
}

/// A mapping key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKey
{
    /// Name already known locally (attribute names, fast-local names)
    Name(String),
    /// Arbitrary key object, classified on access
    Remote(Address),
}

impl fmt::Display for EntryKey
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            EntryKey::Name(name) => f.write_str(name),
            EntryKey::Remote(address) => write!(f, "<key at remote {address}>"),
        }
    }
}
