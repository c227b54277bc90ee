//! Decoding and quoting of remote text.

use std::fmt::Write as _;

use byteorder::{ByteOrder, LE};

/// Decode fixed-width code units (1, 2 or 4 bytes) into a `String`
///
/// Width 1 is Latin-1, width 2 is UCS-2 and width 4 is UCS-4, matching
/// the three PEP 393 kinds. Lone surrogates and out-of-range code points
/// become U+FFFD.
pub fn decode_units(data: &[u8], width: usize) -> String
{
    match width {
        1 => data.iter().copied().map(char::from).collect(),
        2 => data
            .chunks_exact(2)
            .map(|unit| char::from_u32(u32::from(LE::read_u16(unit))).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect(),
        _ => data
            .chunks_exact(4)
            .map(|unit| char::from_u32(LE::read_u32(unit)).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect(),
    }
}

/// Combine little-endian long digits into a signed value
///
/// `digits` holds `digit_size`-byte digits of `bits` payload bits each.
/// Returns `None` if the value doesn't fit in an `i128`.
pub fn combine_digits(digits: &[u8], digit_size: usize, bits: u32, negative: bool) -> Option<i128>
{
    let mut value: u128 = 0;
    for (index, digit) in digits.chunks_exact(digit_size).enumerate() {
        let digit = match digit_size {
            2 => u128::from(LE::read_u16(digit)),
            _ => u128::from(LE::read_u32(digit)),
        };
        if digit == 0 {
            continue;
        }
        let shift = bits.checked_mul(u32::try_from(index).ok()?)?;
        if shift >= 127 || digit.leading_zeros() < shift + 1 {
            return None;
        }
        value |= digit << shift;
    }
    let value = i128::try_from(value).ok()?;
    Some(if negative { -value } else { value })
}

/// Render text the way `repr(str)` would
pub fn quote_str(text: &str) -> String
{
    let quote = if text.contains('\'') && !text.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Render bytes the way `repr(bytes)` would
pub fn quote_bytes(data: &[u8]) -> String
{
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &byte in data {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(char::from(byte)),
            _ => {
                let _ = write!(out, "\\x{byte:02x}");
            }
        }
    }
    out.push('\'');
    out
}
