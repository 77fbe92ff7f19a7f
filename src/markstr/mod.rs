//! Mark-delimited string algorithms (spec §4.2 — component B). These are
//! the hottest code paths in the interpreter: locate, extract, replace,
//! insert, delete, template match, and the multi-value fold that drives a
//! scalar opcode once per parallel element of one or more dynamic arrays.
//!
//! All operations here work on contiguous byte slices rather than directly
//! on a [`crate::descriptor::StringChunks`] chain; callers materialize a
//! chain with `to_contiguous()` (or keep it contiguous already, which is
//! the common case for chunks under [`crate::descriptor::MAX_CHUNK_SIZE`])
//! and rebuild one from the result with `StringChunks::from_bytes`. The
//! state machines below are where the real engineering is; chunk
//! management is orthogonal.

pub mod convert;
pub mod locate;
pub mod mvfun;
pub mod rdi;
pub mod template;

pub use crate::descriptor::{is_mark, mark_rank, FIELD_MARK, SUBVALUE_MARK, TEXT_MARK, VALUE_MARK};

/// 1-origin (field, value, subvalue) coordinate into a dynamic array.
/// A component of zero means "not addressed at this depth" (field-only,
/// or field+value addressing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coord {
    pub field: i32,
    pub value: i32,
    pub subvalue: i32,
}

impl Coord {
    pub fn field(field: i32) -> Self {
        Coord { field, value: 0, subvalue: 0 }
    }

    pub fn field_value(field: i32, value: i32) -> Self {
        Coord { field, value, subvalue: 0 }
    }

    pub fn full(field: i32, value: i32, subvalue: i32) -> Self {
        Coord { field, value, subvalue }
    }

    /// The depth (1 = field, 2 = value, 3 = subvalue) this coordinate
    /// addresses, based on which components are nonzero.
    pub fn depth(&self) -> u8 {
        if self.subvalue != 0 {
            3
        } else if self.value != 0 {
            2
        } else {
            1
        }
    }
}

/// Splits `s` into the top-level segments delimited by `mark`, the way
/// `FIELD`/`COUNT` walk one level of the array.
pub fn split_level(s: &[u8], mark: u8) -> Vec<&[u8]> {
    if s.is_empty() {
        return vec![];
    }
    s.split(|&b| b == mark).collect()
}

/// `COUNT`: number of occurrences of `needle` in `s` (non-overlapping),
/// used for both the plain string COUNT and as the basis of DCOUNT.
pub fn count_occurrences(s: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut n = 0;
    let mut i = 0;
    while i + needle.len() <= s.len() {
        if &s[i..i + needle.len()] == needle {
            n += 1;
            i += needle.len();
        } else {
            i += 1;
        }
    }
    n
}

/// `DCOUNT`: number of delimiter-separated fields `s` splits into on
/// `delim`, i.e. `count_occurrences(s, delim) + 1` for non-empty `s`, 0
/// for empty `s` (an empty dynamic array has no fields).
pub fn dcount(s: &[u8], delim: u8) -> usize {
    if s.is_empty() {
        return 0;
    }
    count_occurrences(s, &[delim]) + 1
}

/// `INDEX`: 1-origin byte offset of the `occurrence`-th match of `needle`
/// in `s`, or 0 if not found.
pub fn index_of(s: &[u8], needle: &[u8], occurrence: usize) -> usize {
    if needle.is_empty() || occurrence == 0 {
        return 0;
    }
    let mut seen = 0;
    let mut i = 0;
    while i + needle.len() <= s.len() {
        if &s[i..i + needle.len()] == needle {
            seen += 1;
            if seen == occurrence {
                return i + 1;
            }
            i += needle.len();
        } else {
            i += 1;
        }
    }
    0
}
