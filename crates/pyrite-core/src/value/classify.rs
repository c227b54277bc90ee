//! # Remote Value Classifier & Proxy Builder
//!
//! Turns a remote address into a [`RemoteValue`].
//!
//! ## Algorithm
//!
//! 1. The `None` singleton is recognised by address.
//! 2. Otherwise the type pointer is read and looked up in the session's
//!    [`TypeTable`](crate::layout::TypeTable).
//! 3. Known types dispatch to a reader: scalars are copied, containers
//!    become proxies holding only sizes and element addresses.
//! 4. Unknown types with the heap-type flag are user-defined instances:
//!    their attribute names are copied, values stay addresses.
//! 5. Anything else becomes an opaque `<name at remote 0x...>` string.
//!
//! Every length read from the target is bounded by [`Limits`] before it is
//! used to size a read.

use byteorder::{ByteOrder, LE};
use pyrite_utils::InspectorConfig;
use tracing::trace;

use super::text::{combine_digits, decode_units};
use super::{EntryKey, MappingEntry, Proxy, RemoteValue, Scalar, Shape};
use crate::backend::ProcessControl;
use crate::error::{PyriteError, Result};
use crate::layout::descriptor::{DictLayout, SequenceLayout, TextLayout};
use crate::layout::{RuntimeLayout, TypeTag};
use crate::memory::{RemoteMemory, POINTER_SIZE};
use crate::types::{Address, SessionId};

/// Longest type name copied out of `tp_name`
const MAX_TYPE_NAME: usize = 256;

/// Largest dict table whose index array still fits a 47-bit address space
const MAX_DICT_SLOTS: usize = 1 << 44;

/// Safety bounds applied while walking the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits
{
    /// Frame-chain traversal cap
    pub max_frames: usize,
    /// Interpreter and thread-state chain cap
    pub max_threads: usize,
    /// Bytes copied out of one string or bytes object
    pub max_string_bytes: usize,
    /// Entries materialised from one mapping
    pub max_container_entries: usize,
}

impl From<&InspectorConfig> for Limits
{
    fn from(config: &InspectorConfig) -> Self
    {
        Self {
            max_frames: config.max_frames,
            max_threads: config.max_threads,
            max_string_bytes: config.max_string_bytes,
            max_container_entries: config.max_container_entries,
        }
    }
}

impl Default for Limits
{
    fn default() -> Self
    {
        Self::from(&InspectorConfig::default())
    }
}

/// Classifies addresses and follows proxies for one session
pub struct Classifier<'a, B: ProcessControl + ?Sized>
{
    memory: RemoteMemory<'a, B>,
    runtime: &'a RuntimeLayout,
    limits: Limits,
    session: SessionId,
}

impl<'a, B: ProcessControl + ?Sized> Classifier<'a, B>
{
    /// Create a classifier bound to one session's memory and layout
    pub fn new(memory: RemoteMemory<'a, B>, runtime: &'a RuntimeLayout, limits: Limits, session: SessionId) -> Self
    {
        Self {
            memory,
            runtime,
            limits,
            session,
        }
    }

    /// Memory reader
    pub fn memory(&self) -> RemoteMemory<'a, B>
    {
        self.memory
    }

    /// Resolved layout
    pub fn runtime(&self) -> &'a RuntimeLayout
    {
        self.runtime
    }

    /// Active limits
    pub fn limits(&self) -> &Limits
    {
        &self.limits
    }

    /// Session proxies are stamped with
    pub fn session(&self) -> SessionId
    {
        self.session
    }

    /// Classify the object at `address`
    ///
    /// Classifying the same unchanged address twice gives equal results.
    /// Proxies are never cached, so a second call reflects whatever the
    /// target holds at that moment.
    ///
    /// ## Errors
    ///
    /// - `RemoteRead`: the object header or a payload is unreadable
    /// - `Malformed`: a null pointer or an impossible size or state
    pub fn classify(&self, address: Address) -> Result<RemoteValue>
    {
        if address.is_null() {
            return Err(malformed(address, "null object pointer"));
        }

        let types = &self.runtime.types;
        if address == types.none() {
            return Ok(RemoteValue::Scalar(Scalar::None));
        }

        let layout = self.runtime.descriptor;
        let type_address = self.memory.read_ptr(address + layout.object.ob_type)?;
        let Some(tag) = types.tag(type_address) else {
            return self.classify_unknown(address, type_address);
        };
        trace!(%address, %tag, "classified");

        match tag {
            TypeTag::Bool => Ok(RemoteValue::Scalar(Scalar::Bool(address == types.true_object()))),
            TypeTag::Int => self.read_small_int(address),
            TypeTag::Long => self.read_long(address),
            TypeTag::Float => {
                let value = self.memory.read_f64(address + layout.float.value)?;
                Ok(RemoteValue::Scalar(Scalar::Float(value)))
            }
            TypeTag::Str => self.read_str(address).map(RemoteValue::Scalar),
            TypeTag::Bytes => self.read_bytes_object(address).map(RemoteValue::Scalar),
            TypeTag::List => self.sequence(address, tag, &layout.list),
            TypeTag::Tuple => self.sequence(address, tag, &layout.tuple),
            TypeTag::Dict => {
                let (entries, truncated) = self.dict_entries(address)?;
                Ok(self.proxy(address, tag, Shape::Mapping { entries, truncated }))
            }
            TypeTag::ClassicInstance => self.classic_instance(address),
            _ => Ok(RemoteValue::Opaque(format!("<{tag} at remote {address}>"))),
        }
    }

    /// Classify the `index`-th item of a sequence proxy
    ///
    /// Reads one item pointer and classifies what it points at. Returns
    /// `None` past the end or for proxies that aren't sequences.
    ///
    /// ## Errors
    ///
    /// - `StaleHandle`: the proxy is from another session
    /// - `RemoteRead` / `Malformed`: as for [`classify`](Self::classify)
    pub fn item(&self, proxy: &Proxy, index: usize) -> Result<Option<RemoteValue>>
    {
        self.check(proxy)?;
        let Shape::Sequence { len, items } = proxy.shape else {
            return Ok(None);
        };
        if index >= len {
            return Ok(None);
        }
        let pointer = self.memory.read_ptr(items.element(index, POINTER_SIZE))?;
        self.classify(pointer).map(Some)
    }

    /// Classify the key and value of the `index`-th entry of a mapping or
    /// instance proxy
    ///
    /// ## Errors
    ///
    /// - `StaleHandle`: the proxy is from another session
    /// - `RemoteRead` / `Malformed`: as for [`classify`](Self::classify)
    pub fn entry(&self, proxy: &Proxy, index: usize) -> Result<Option<(RemoteValue, RemoteValue)>>
    {
        self.check(proxy)?;
        match entries_of(proxy).and_then(|entries| entries.get(index)) {
            Some(entry) => Ok(Some((self.key_value(&entry.key)?, self.classify(entry.value)?))),
            None => Ok(None),
        }
    }

    /// Classify every entry of a mapping or instance proxy, one hop each
    ///
    /// ## Errors
    ///
    /// As for [`entry`](Self::entry).
    pub fn entries(&self, proxy: &Proxy) -> Result<Vec<(RemoteValue, RemoteValue)>>
    {
        self.check(proxy)?;
        entries_of(proxy)
            .unwrap_or_default()
            .iter()
            .map(|entry| Ok((self.key_value(&entry.key)?, self.classify(entry.value)?)))
            .collect()
    }

    /// Classify the keys of a mapping, or the attribute names of an
    /// instance
    ///
    /// ## Errors
    ///
    /// As for [`entry`](Self::entry).
    pub fn keys(&self, proxy: &Proxy) -> Result<Vec<RemoteValue>>
    {
        self.check(proxy)?;
        entries_of(proxy)
            .unwrap_or_default()
            .iter()
            .map(|entry| self.key_value(&entry.key))
            .collect()
    }

    /// Look up a string key in a mapping, or an attribute of an instance
    ///
    /// Remote keys are classified one at a time until one matches.
    ///
    /// ## Errors
    ///
    /// As for [`entry`](Self::entry).
    pub fn get(&self, proxy: &Proxy, key: &str) -> Result<Option<RemoteValue>>
    {
        self.check(proxy)?;
        for entry in entries_of(proxy).unwrap_or_default() {
            let matches = match &entry.key {
                EntryKey::Name(name) => name == key,
                EntryKey::Remote(address) => self.read_name(*address)?.as_deref() == Some(key),
            };
            if matches {
                return self.classify(entry.value).map(Some);
            }
        }
        Ok(None)
    }

    /// Text of a `str` (or 2.x byte string) object, `None` for any other
    /// type
    ///
    /// ## Errors
    ///
    /// As for [`classify`](Self::classify).
    pub fn read_name(&self, address: Address) -> Result<Option<String>>
    {
        match self.classify(address)? {
            RemoteValue::Scalar(Scalar::Str { text, .. }) => Ok(Some(text)),
            RemoteValue::Scalar(Scalar::Bytes { data, .. }) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            _ => Ok(None),
        }
    }

    /// Item addresses of a tuple, bounded by the container limit
    ///
    /// ## Errors
    ///
    /// `Malformed` if `address` is not a tuple.
    pub fn tuple_items(&self, address: Address) -> Result<Vec<Address>>
    {
        self.expect_tag(address, TypeTag::Tuple)?;
        let layout = &self.runtime.descriptor.tuple;
        let len = self.size_at(address, layout.size)?;
        let count = len.min(self.limits.max_container_entries);
        if count == 0 {
            return Ok(Vec::new());
        }
        self.memory.read_ptrs(address + layout.items, count)
    }

    /// Entries of a dictionary with keys that are strings replaced by their
    /// text
    ///
    /// ## Errors
    ///
    /// `Malformed` if `address` is not a dict.
    pub fn named_entries(&self, address: Address) -> Result<(Vec<MappingEntry>, bool)>
    {
        self.expect_tag(address, TypeTag::Dict)?;
        let (entries, truncated) = self.dict_entries(address)?;
        let mut named = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = match entry.key {
                EntryKey::Remote(key) => match self.read_name(key)? {
                    Some(name) => EntryKey::Name(name),
                    None => EntryKey::Remote(key),
                },
                name @ EntryKey::Name(_) => name,
            };
            named.push(MappingEntry { key, value: entry.value });
        }
        Ok((named, truncated))
    }

    /// Stamp a proxy with this session
    pub fn proxy(&self, address: Address, tag: TypeTag, shape: Shape) -> RemoteValue
    {
        RemoteValue::Proxy(Proxy {
            address,
            tag,
            session: self.session,
            shape,
        })
    }

    fn check(&self, proxy: &Proxy) -> Result<()>
    {
        if proxy.session == self.session {
            Ok(())
        } else {
            Err(PyriteError::StaleHandle)
        }
    }

    fn key_value(&self, key: &EntryKey) -> Result<RemoteValue>
    {
        match key {
            EntryKey::Name(name) => Ok(RemoteValue::Scalar(Scalar::Str {
                text: name.clone(),
                truncated: false,
            })),
            EntryKey::Remote(address) => self.classify(*address),
        }
    }

    fn expect_tag(&self, address: Address, expected: TypeTag) -> Result<()>
    {
        let type_address = self
            .memory
            .read_ptr(address + self.runtime.descriptor.object.ob_type)?;
        if self.runtime.types.tag(type_address) == Some(expected) {
            Ok(())
        } else {
            Err(malformed(address, format!("expected a {expected} object")))
        }
    }

    fn size_at(&self, address: Address, offset: u64) -> Result<usize>
    {
        let size = self.memory.read_i64(address + offset)?;
        usize::try_from(size).map_err(|_| malformed(address, format!("negative size {size}")))
    }

    fn classify_unknown(&self, address: Address, type_address: Address) -> Result<RemoteValue>
    {
        let layout = &self.runtime.descriptor.type_object;
        let flags = self.memory.read_u64(type_address + layout.flags);
        let name = self.type_name(type_address);

        match (flags, name) {
            (Ok(flags), Ok(name)) if flags & layout.heap_type_flag != 0 => self.instance(address, type_address, name),
            (_, Ok(name)) => Ok(RemoteValue::Opaque(format!("<{name} at remote {address}>"))),
            (_, Err(err)) => {
                trace!(%address, %type_address, error = %err, "type object unreadable");
                Ok(RemoteValue::Opaque(format!(
                    "<object of unknown type {type_address} at remote {address}>"
                )))
            }
        }
    }

    fn type_name(&self, type_address: Address) -> Result<String>
    {
        let layout = &self.runtime.descriptor.type_object;
        let name_ptr = self.memory.read_ptr(type_address + layout.name)?;
        if name_ptr.is_null() {
            return Err(malformed(type_address, "type without a name"));
        }
        Ok(self.memory.read_cstring(name_ptr, MAX_TYPE_NAME)?.0)
    }

    fn instance(&self, address: Address, type_address: Address, type_name: String) -> Result<RemoteValue>
    {
        let layout = &self.runtime.descriptor.type_object;
        let dictoffset = self.memory.read_i64(type_address + layout.dictoffset)?;

        // Negative offsets count from the end of variable-sized objects
        let attributes = match u64::try_from(dictoffset) {
            Ok(offset) if offset > 0 => {
                let dict = self.memory.read_ptr(address + offset)?;
                if dict.is_null() {
                    Vec::new()
                } else {
                    self.named_entries(dict)?.0
                }
            }
            _ => Vec::new(),
        };

        Ok(self.proxy(address, TypeTag::Instance, Shape::Instance { type_name, attributes }))
    }

    fn classic_instance(&self, address: Address) -> Result<RemoteValue>
    {
        let Some(classic) = self.runtime.descriptor.classic else {
            return Err(malformed(address, "classic instance on a build without classic classes"));
        };

        let class = self.memory.read_ptr(address + classic.in_class)?;
        let name = self.memory.read_ptr(class + classic.cl_name)?;
        let type_name = self.read_name(name)?.unwrap_or_else(|| "instance".to_string());

        let dict = self.memory.read_ptr(address + classic.in_dict)?;
        let attributes = if dict.is_null() {
            Vec::new()
        } else {
            self.named_entries(dict)?.0
        };

        Ok(self.proxy(address, TypeTag::ClassicInstance, Shape::Instance { type_name, attributes }))
    }

    fn read_small_int(&self, address: Address) -> Result<RemoteValue>
    {
        let Some(layout) = self.runtime.descriptor.small_int else {
            return Err(malformed(address, "machine int on a build without one"));
        };
        let value = self.memory.read_i64(address + layout.value)?;
        Ok(RemoteValue::Scalar(Scalar::Int(i128::from(value))))
    }

    fn read_long(&self, address: Address) -> Result<RemoteValue>
    {
        let descriptor = self.runtime.descriptor;
        let layout = &descriptor.long;
        let size = self.memory.read_i64(address + descriptor.object.ob_size)?;
        let count = usize::try_from(size.unsigned_abs()).unwrap_or(usize::MAX);
        if count == 0 {
            return Ok(RemoteValue::Scalar(Scalar::Int(0)));
        }

        let max_digits = (127 / layout.digit_bits + 1) as usize;
        if count > max_digits {
            return Ok(RemoteValue::Opaque(format!("<int of {count} digits at remote {address}>")));
        }

        let digit_size = layout.digit_size as usize;
        let digits = self.memory.read_bytes(address + layout.digits, count * digit_size)?;
        Ok(match combine_digits(&digits, digit_size, layout.digit_bits, size < 0) {
            Some(value) => RemoteValue::Scalar(Scalar::Int(value)),
            None => RemoteValue::Opaque(format!("<int of {count} digits at remote {address}>")),
        })
    }

    fn read_str(&self, address: Address) -> Result<Scalar>
    {
        match self.runtime.descriptor.text {
            TextLayout::Compact {
                length,
                state,
                ascii_data,
                compact_data,
                data_pointer,
            } => {
                let len = self.size_at(address, length)?;
                let state = self.memory.read_u32(address + state)?;
                let kind = (state >> 2) & 0x7;
                let compact = state & (1 << 5) != 0;
                let ascii = state & (1 << 6) != 0;
                let ready = state & (1 << 7) != 0;

                if !ready {
                    return Err(malformed(address, "string is not in canonical form"));
                }
                let width = match kind {
                    1 | 2 | 4 => kind as usize,
                    other => return Err(malformed(address, format!("unknown string kind {other}"))),
                };
                let data = match (compact, ascii) {
                    (true, true) => address + ascii_data,
                    (true, false) => address + compact_data,
                    (false, _) => self.memory.read_ptr(address + data_pointer)?,
                };
                self.read_units(data, len, width)
            }
            TextLayout::Wide {
                length,
                data_pointer,
                unit_size,
            } => {
                let len = self.size_at(address, length)?;
                let data = self.memory.read_ptr(address + data_pointer)?;
                self.read_units(data, len, unit_size as usize)
            }
        }
    }

    fn read_units(&self, data: Address, len: usize, width: usize) -> Result<Scalar>
    {
        let units = len.min(self.limits.max_string_bytes / width);
        let bytes = if units == 0 {
            Vec::new()
        } else {
            self.memory.read_bytes(data, units * width)?
        };
        Ok(Scalar::Str {
            text: decode_units(&bytes, width),
            truncated: units < len,
        })
    }

    /// Contents of a byte string object and whether they were cut at the
    /// string limit
    ///
    /// ## Errors
    ///
    /// `Malformed` if `address` is not a byte string.
    pub fn raw_bytes(&self, address: Address) -> Result<(Vec<u8>, bool)>
    {
        self.expect_tag(address, TypeTag::Bytes)?;
        let layout = &self.runtime.descriptor.bytes;
        let size = self.size_at(address, layout.size)?;
        let count = size.min(self.limits.max_string_bytes);
        let data = if count == 0 {
            Vec::new()
        } else {
            self.memory.read_bytes(address + layout.data, count)?
        };
        Ok((data, count < size))
    }

    fn read_bytes_object(&self, address: Address) -> Result<Scalar>
    {
        let (data, truncated) = self.raw_bytes(address)?;

        // 2.x `str` is the byte string type; show it as text when it is text
        if self.runtime.build.is_python2() {
            return Ok(match String::from_utf8(data) {
                Ok(text) => Scalar::Str { text, truncated },
                Err(err) => Scalar::Bytes {
                    data: err.into_bytes(),
                    truncated,
                },
            });
        }
        Ok(Scalar::Bytes { data, truncated })
    }

    fn sequence(&self, address: Address, tag: TypeTag, layout: &SequenceLayout) -> Result<RemoteValue>
    {
        let len = self.size_at(address, layout.size)?;
        let items = if layout.indirect {
            self.memory.read_ptr(address + layout.items)?
        } else {
            address + layout.items
        };
        if len > 0 && items.is_null() {
            return Err(malformed(address, "non-empty sequence without items"));
        }
        Ok(self.proxy(address, tag, Shape::Sequence { len, items }))
    }

    fn dict_entries(&self, address: Address) -> Result<(Vec<MappingEntry>, bool)>
    {
        let cap = self.limits.max_container_entries;

        match self.runtime.descriptor.dict {
            DictLayout::Compact {
                keys,
                values,
                keys_size,
                keys_nentries,
                keys_indices,
                entry_size,
                ..
            } => {
                let keys = self.memory.read_ptr(address + keys)?;
                let values = self.memory.read_ptr(address + values)?;
                let size = self.size_at(keys, keys_size)?;
                let nentries = self.size_at(keys, keys_nentries)?;
                if !size.is_power_of_two() || size > MAX_DICT_SLOTS || nentries > size {
                    return Err(malformed(address, format!("dict keys of size {size} with {nentries} entries")));
                }

                let count = nentries.min(cap);
                if count == 0 {
                    return Ok((Vec::new(), false));
                }
                let table = (size as u64)
                    .checked_mul(index_width(size))
                    .and_then(|indices| indices.checked_add(keys_indices))
                    .and_then(|offset| keys.checked_add(offset))
                    .ok_or_else(|| malformed(address, format!("dict index table of size {size} overflows")))?;
                let length = count
                    .checked_mul(entry_size as usize)
                    .ok_or_else(|| malformed(address, format!("dict entry table of {count} entries overflows")))?;
                let raw = self.memory.read_bytes(table, length)?;
                let split = if values.is_null() {
                    None
                } else {
                    Some(self.memory.read_ptrs(values, count)?)
                };

                let entries = raw
                    .chunks_exact(entry_size as usize)
                    .enumerate()
                    .filter_map(|(index, slot)| {
                        let key = Address::new(LE::read_u64(&slot[8..16]));
                        let value = match &split {
                            Some(values) => values[index],
                            None => Address::new(LE::read_u64(&slot[16..24])),
                        };
                        live_entry(key, value)
                    })
                    .collect();
                Ok((entries, nentries > cap))
            }
            DictLayout::Open {
                mask,
                table,
                entry_size,
                ..
            } => {
                let mask = self.size_at(address, mask)?;
                let slots = mask
                    .checked_add(1)
                    .filter(|slots| slots.is_power_of_two())
                    .ok_or_else(|| malformed(address, format!("dict mask {mask:#x}")))?;
                let table = self.memory.read_ptr(address + table)?;

                let count = slots.min(cap);
                let length = count
                    .checked_mul(entry_size as usize)
                    .ok_or_else(|| malformed(address, format!("dict table of {count} slots overflows")))?;
                let raw = self.memory.read_bytes(table, length)?;
                let entries = raw
                    .chunks_exact(entry_size as usize)
                    .filter_map(|slot| {
                        live_entry(
                            Address::new(LE::read_u64(&slot[8..16])),
                            Address::new(LE::read_u64(&slot[16..24])),
                        )
                    })
                    .collect();
                Ok((entries, slots > cap))
            }
        }
    }
}

fn entries_of(proxy: &Proxy) -> Option<&[MappingEntry]>
{
    match &proxy.shape {
        Shape::Mapping { entries, .. } => Some(entries),
        Shape::Instance { attributes, .. } => Some(attributes),
        Shape::Sequence { .. } => None,
    }
}

fn live_entry(key: Address, value: Address) -> Option<MappingEntry>
{
    // Deleted slots keep a dummy key but a null value
    (!key.is_null() && !value.is_null()).then(|| MappingEntry {
        key: EntryKey::Remote(key),
        value,
    })
}

/// Width of one `dk_indices` slot for a table of `size` buckets
fn index_width(size: usize) -> u64
{
    match size {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xffff_ffff => 4,
        _ => 8,
    }
}

fn malformed(address: Address, reason: impl Into<String>) -> PyriteError
{
    PyriteError::Malformed {
        address,
        reason: reason.into(),
    }
}
