//! Bytecode offset to source line mapping.
//!
//! Both encodings are sequences of `(offset delta, line delta)` byte pairs
//! starting from the code object's first line.

use crate::layout::descriptor::LineEncoding;

/// Line delta marking a range that has no source line (3.10 linetable)
const NO_LINE: i8 = -128;

/// Source line executing at byte offset `offset` of a code object
///
/// `offset` is `f_lasti` already scaled to bytes. A negative offset means
/// the frame hasn't started yet and maps to `firstlineno`. Returns `None`
/// when the offset falls in a range without a line or past the end of a
/// linetable; callers fall back to the frame's own `f_lineno`.
pub fn line_for_offset(encoding: LineEncoding, table: &[u8], firstlineno: i64, offset: i64) -> Option<i64>
{
    match encoding {
        LineEncoding::Lnotab { signed } => Some(lnotab_line(table, signed, firstlineno, offset)),
        LineEncoding::LineTable => {
            if offset < 0 {
                return Some(firstlineno);
            }
            linetable_line(table, firstlineno, offset)
        }
    }
}

fn lnotab_line(table: &[u8], signed: bool, firstlineno: i64, offset: i64) -> i64
{
    let mut address = 0i64;
    let mut line = firstlineno;

    for pair in table.chunks_exact(2) {
        address += i64::from(pair[0]);
        if address > offset {
            break;
        }
        line += if signed {
            i64::from(pair[1] as i8)
        } else {
            i64::from(pair[1])
        };
    }
    line
}

fn linetable_line(table: &[u8], firstlineno: i64, offset: i64) -> Option<i64>
{
    let mut line = firstlineno;
    let mut end = 0i64;

    for pair in table.chunks_exact(2) {
        let start = end;
        end += i64::from(pair[0]);

        let delta = pair[1] as i8;
        let current = if delta == NO_LINE {
            None
        } else {
            line += i64::from(delta);
            Some(line)
        };

        if (start..end).contains(&offset) {
            return current;
        }
    }
    None
}
