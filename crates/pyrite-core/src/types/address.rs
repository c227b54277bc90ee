//! Remote address type.

use std::fmt;
use std::ops::Add;

/// Address in the target's address space
///
/// A newtype over `u64` so that remote addresses are never confused with
/// sizes, offsets or values read out of the target.
///
/// Displayed the way CPython prints object ids in reprs (`0x7f3a...`,
/// no padding).
///
/// ## Example
///
/// ```rust
/// use pyrite_core::types::Address;
///
/// let object = Address::new(0x7f00_1000);
/// let ob_type = object + 8; // field offset
/// assert_eq!(ob_type.value(), 0x7f00_1008);
/// assert_eq!(object.to_string(), "0x7f001000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address
    pub const NULL: Self = Address(0);

    /// Create a new address from a `u64` value
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Whether this is the null pointer
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Add an offset, returning `None` on overflow
    ///
    /// ```rust
    /// use pyrite_core::types::Address;
    ///
    /// assert_eq!(Address::new(0x1000).checked_add(0x10), Some(Address::new(0x1010)));
    /// assert_eq!(Address::new(u64::MAX).checked_add(1), None);
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Address of the `index`-th element of an array of `stride`-byte items
    /// starting here
    pub fn element(self, index: usize, stride: u64) -> Self
    {
        Address(self.0.wrapping_add((index as u64).wrapping_mul(stride)))
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}
