//! The descriptor & string-chunk runtime (spec §3.1, §3.2, §4.1 — component A).
//!
//! A [`Descriptor`] is the tagged value every opcode operates on. Reference
//! counting is expressed with `Rc`, per spec §9's design note that `Addr`
//! becomes a frame-local index rather than a raw pointer and that owning
//! variants should use normal Rust ownership instead of a hand-rolled
//! counter; the one place an explicit counter still matters is the string
//! chunk chain, where copy-on-write must check `Rc::strong_count` before
//! mutating in place (§4.1 "Reference-counted copying").

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::InterpError;

/// Maximum payload carried by one chunk before a new chunk is started.
/// Mirrors the "maximum chunk payload is a fixed constant" rule of §3.2.
pub const MAX_CHUNK_SIZE: usize = 8192;

/// The four mark-delimiter bytes (§4.2), ordered `Field > Value > Subvalue
/// > Text`. Using the literal legacy byte values keeps on-disk data and
/// interpreter strings bit-compatible with existing DH files.
pub const FIELD_MARK: u8 = 0xFE;
pub const VALUE_MARK: u8 = 0xFD;
pub const SUBVALUE_MARK: u8 = 0xFC;
pub const TEXT_MARK: u8 = 0xFB;

/// True for any of the four reserved delimiter bytes.
#[inline]
pub fn is_mark(b: u8) -> bool {
    b >= TEXT_MARK
}

/// Relative precedence of a mark byte; higher means "separates at a
/// coarser granularity". Used by the multi-value fold (§4.2) to pick the
/// minimum (lowest precedence) ending mark across parallel inputs.
#[inline]
pub fn mark_rank(b: u8) -> u8 {
    match b {
        FIELD_MARK => 4,
        VALUE_MARK => 3,
        SUBVALUE_MARK => 2,
        TEXT_MARK => 1,
        _ => 0,
    }
}

/// A positional hint accelerating repeated access at the same or a later
/// field (§3.2): "(field_number, byte_offset) pair".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionHint {
    pub field: u32,
    pub offset: usize,
}

/// Chunk + offset remove-pointer set by the dynamic-extract state machine
/// (§3.2, §4.2 `rdi`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovePointer {
    pub chunk: usize,
    pub offset: usize,
}

/// The head of a reference-counted chain of string chunks (§3.2).
///
/// Represented as `Vec<Vec<u8>>` rather than a literal singly-linked list
/// of heap nodes: this is the same "chunked string" semantics (bounded
/// payload per node, total length cached at the head) with better
/// locality, and is the natural Rust expression per §9's note that a COW
/// discipline survives the translation from C pointer-chasing.
#[derive(Debug, Default)]
pub struct StringChunks {
    chunks: Vec<Vec<u8>>,
    total_len: usize,
    hint: Option<PositionHint>,
    remove_ptr: Option<RemovePointer>,
}

impl StringChunks {
    /// Allocate an empty string (null chain, per §3.2).
    pub fn empty() -> Rc<RefCell<StringChunks>> {
        Rc::new(RefCell::new(StringChunks::default()))
    }

    /// Allocate a string holding `bytes`, split into chunks of at most
    /// [`MAX_CHUNK_SIZE`].
    pub fn from_bytes(bytes: &[u8]) -> Rc<RefCell<StringChunks>> {
        let mut s = StringChunks::default();
        s.set_bytes(bytes);
        Rc::new(RefCell::new(s))
    }

    fn set_bytes(&mut self, bytes: &[u8]) {
        self.chunks.clear();
        self.total_len = bytes.len();
        self.hint = None;
        self.remove_ptr = None;
        if bytes.is_empty() {
            return;
        }
        for part in bytes.chunks(MAX_CHUNK_SIZE) {
            self.chunks.push(part.to_vec());
        }
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub fn hint(&self) -> Option<PositionHint> {
        self.hint
    }

    pub fn set_hint(&mut self, hint: PositionHint) {
        self.hint = Some(hint);
    }

    pub fn remove_pointer(&self) -> Option<RemovePointer> {
        self.remove_ptr
    }

    pub fn set_remove_pointer(&mut self, rp: Option<RemovePointer>) {
        self.remove_ptr = rp;
    }

    /// Materialize the whole chain as one contiguous buffer.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len);
        for c in &self.chunks {
            out.extend_from_slice(c);
        }
        debug_assert_eq!(out.len(), self.total_len, "chunk sum must equal head total_len");
        out
    }

    /// Append bytes, starting a new chunk once the tail chunk is full.
    /// This is the mutate-in-place path; callers must have already
    /// ensured unique ownership (copy-on-write, see [`cow`]).
    pub fn append(&mut self, bytes: &[u8]) {
        self.total_len += bytes.len();
        let mut remaining = bytes;
        if let Some(tail) = self.chunks.last_mut() {
            let space = MAX_CHUNK_SIZE.saturating_sub(tail.len());
            if space > 0 {
                let take = space.min(remaining.len());
                tail.extend_from_slice(&remaining[..take]);
                remaining = &remaining[take..];
            }
        }
        for part in remaining.chunks(MAX_CHUNK_SIZE) {
            self.chunks.push(part.to_vec());
        }
    }

    pub(crate) fn chunk_lengths(&self) -> Vec<usize> {
        self.chunks.iter().map(Vec::len).collect()
    }
}

impl Clone for StringChunks {
    /// `clone a chain as a single contiguous chunk` (§4.1 contract):
    /// produces a fresh, unshared copy.
    fn clone(&self) -> Self {
        StringChunks {
            chunks: self.chunks.clone(),
            total_len: self.total_len,
            hint: self.hint,
            remove_ptr: self.remove_ptr,
        }
    }
}

/// Copy-on-write helper: mutate `rc` in place if uniquely held, else clone
/// first. This is the Rust expression of §4.1's "copy-on-write is
/// triggered whenever mutation is required and reference count exceeds 1".
pub fn cow(rc: &mut Rc<RefCell<StringChunks>>) -> &mut Rc<RefCell<StringChunks>> {
    if Rc::strong_count(rc) > 1 {
        let cloned = rc.borrow().clone();
        *rc = Rc::new(RefCell::new(cloned));
    }
    rc
}

bitflags::bitflags! {
    /// Independent flag bits carried by a descriptor (§3.1).
    #[derive(Default)]
    pub struct DescriptorFlags: u8 {
        /// Pending change: value has been written but not yet committed
        /// back through its owning context.
        const PENDING_CHANGE = 0b0001;
        /// `DF_REUSE`: operand's value should be reused across successive
        /// iterations of a multi-value fold (§4.1, §4.2).
        const REUSE = 0b0010;
        /// `DF_REMOVE`: descriptor has an active remove-pointer state.
        const HAS_REMOVE_POINTER = 0b0100;
    }
}

/// The universal tagged value (§3.1). `Addr` is expressed as a frame-local
/// index per §9 rather than a raw pointer, so dereferencing never outlives
/// a stack frame.
#[derive(Debug, Clone)]
pub enum Descriptor {
    Unassigned,
    /// Index into the current call frame's local variable array.
    Addr(usize),
    Integer(i32),
    Float(f64),
    String(Rc<RefCell<StringChunks>>),
    /// A select-list: same representation as `String`, distinguished by tag.
    SelList(Rc<RefCell<StringChunks>>),
    Subr {
        object_ref: u32,
        name: Rc<RefCell<StringChunks>>,
    },
    FileRef(Rc<RefCell<crate::dh::file::FileVar>>),
    /// Not reference counted per §4.1 ("copying ... except for PMatrix and
    /// object-code descriptors").
    PMatrix(Rc<PartitionedMatrix>),
    Array(Rc<RefCell<ArrayHeader>>),
    Common(Rc<RefCell<ArrayHeader>>, bool),
    LocalVars(Rc<RefCell<Vec<ArrayHeader>>>),
    Persistent(Rc<RefCell<ArrayHeader>>),
    /// Object-code descriptors are not refcounted (§4.1); held by raw name.
    ObjCd,
    ObjCdX {
        name: String,
    },
}

#[derive(Debug, Default)]
pub struct ArrayHeader {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<Descriptor>,
}

#[derive(Debug, Default)]
pub struct PartitionedMatrix {
    pub rows: usize,
    pub cols: usize,
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor::Unassigned
    }
}

impl Descriptor {
    /// Dereference an `Addr` chain to the underlying value. Idempotent:
    /// a non-`Addr` descriptor dereferences to itself (§3.1 invariant).
    pub fn deref<'a>(&'a self, frame: &'a [Descriptor]) -> &'a Descriptor {
        let mut cur = self;
        loop {
            match cur {
                Descriptor::Addr(i) => cur = &frame[*i],
                other => return other,
            }
        }
    }

    pub fn as_string(&self) -> Option<Rc<RefCell<StringChunks>>> {
        match self {
            Descriptor::String(s) | Descriptor::SelList(s) => Some(Rc::clone(s)),
            _ => None,
        }
    }
}

/// Precision/coercion configuration consulted by numeric<->string
/// coercion (§4.1). Sourced from the per-process `PCfg` (§6), not
/// hardcoded.
#[derive(Debug, Clone, Copy)]
pub struct NumConfig {
    /// INTPREC: decimal places used when converting float->int rounding
    /// and when formatting.
    pub intprec: u8,
    /// FLTDIFF: tolerance for float equality comparisons.
    pub fltdiff: f64,
    /// Whether non-numeric coercion raises instead of warning.
    pub nonnumeric_is_error: bool,
}

impl Default for NumConfig {
    fn default() -> Self {
        NumConfig {
            intprec: 13,
            fltdiff: 2.91e-11,
            nonnumeric_is_error: false,
        }
    }
}

/// Numeric value after string-to-number coercion; either branch may
/// result from promotion on overflow (§4.1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i32),
    Float(f64),
}

/// Hand-rolled numeric scanner (§4.1, §9 open question). Accepts an
/// optional leading sign, a decimal point, and leading/trailing (but not
/// embedded) spaces; a second sign anywhere is rejected. Returns `None`
/// if the text is not numeric, in which case the caller applies the
/// warn/error policy from [`NumConfig::nonnumeric_is_error`].
pub fn k_str_to_num(s: &str) -> Option<Num> {
    let trimmed = s.trim_matches(' ');
    if trimmed.is_empty() {
        return None;
    }
    // Reject embedded spaces (spaces that remain after outer trim).
    if trimmed.contains(' ') {
        return None;
    }
    let mut chars = trimmed.chars().peekable();
    let mut sign = 1i64;
    let mut saw_sign = false;
    if let Some(&c) = chars.peek() {
        if c == '+' || c == '-' {
            if c == '-' {
                sign = -1;
            }
            saw_sign = true;
            chars.next();
        }
    }
    let rest: String = chars.collect();
    if rest.is_empty() {
        return None;
    }
    // Reject a second sign anywhere in the remainder.
    if rest.chars().any(|c| c == '+' || c == '-') {
        return None;
    }
    let mut int_part = String::new();
    let mut frac_part = String::new();
    let mut seen_dot = false;
    for c in rest.chars() {
        if c == '.' {
            if seen_dot {
                return None;
            }
            seen_dot = true;
        } else if c.is_ascii_digit() {
            if seen_dot {
                frac_part.push(c);
            } else {
                int_part.push(c);
            }
        } else {
            return None;
        }
    }
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let _ = saw_sign;
    if !seen_dot {
        match int_part.parse::<i64>() {
            Ok(v) => {
                let signed = v * sign;
                if let Ok(i) = i32::try_from(signed) {
                    return Some(Num::Int(i));
                }
                return Some(Num::Float(signed as f64));
            }
            Err(_) => {
                // Overflowed i64 parsing; promote straight to float.
                let text = format!("{}{}.{}", if sign < 0 { "-" } else { "" }, int_part, frac_part);
                return text.parse::<f64>().ok().map(Num::Float);
            }
        }
    }
    let text = format!(
        "{}{}.{}",
        if sign < 0 { "-" } else { "" },
        if int_part.is_empty() { "0" } else { int_part.as_str() },
        if frac_part.is_empty() { "0" } else { frac_part.as_str() }
    );
    text.parse::<f64>().ok().map(Num::Float)
}

/// `k_is_num`: tests without mutation.
pub fn k_is_num(s: &str) -> bool {
    k_str_to_num(s).is_some()
}

/// Numeric-to-string coercion: precision from `cfg`, trailing zeros and a
/// trailing decimal point stripped (§4.1).
pub fn num_to_str(n: Num, cfg: &NumConfig) -> String {
    match n {
        Num::Int(i) => i.to_string(),
        Num::Float(f) => {
            let mut s = format!("{:.*}", cfg.intprec as usize, f);
            if s.contains('.') {
                while s.ends_with('0') {
                    s.pop();
                }
                if s.ends_with('.') {
                    s.pop();
                }
            }
            s
        }
    }
}

/// i32 addition with overflow detection by operand-sign equality combined
/// with result-sign flip (§4.1); promotes to float on overflow.
pub fn add_i32(a: i32, b: i32) -> Num {
    match a.checked_add(b) {
        Some(v) => Num::Int(v),
        None => Num::Float(a as f64 + b as f64),
    }
}

/// i32 multiplication with overflow detection via a reverse-division
/// check (§4.1); promotes to float on overflow.
pub fn mul_i32(a: i32, b: i32) -> Num {
    if a == 0 || b == 0 {
        return Num::Int(0);
    }
    match a.checked_mul(b) {
        Some(v) if v / b == a => Num::Int(v),
        _ => Num::Float(a as f64 * b as f64),
    }
}

/// i32 subtraction/decrement (`op_dec`). `i32::MIN` is the documented
/// pivot the source notes as "itself a changed constant" (§9 open
/// question); we resolve it by checking for `MIN` before negating so the
/// underflow promotes to float exactly like addition overflow does.
pub fn sub_i32(a: i32, b: i32) -> Num {
    match a.checked_sub(b) {
        Some(v) => Num::Int(v),
        None => Num::Float(a as f64 - b as f64),
    }
}

/// Float-to-int conversion rounding away from zero by `0.5 * 10^-intprec`
/// (§4.1).
pub fn float_to_int_round(f: f64, intprec: u8) -> i64 {
    let bias = 0.5 * 10f64.powi(-(intprec as i32));
    if f >= 0.0 {
        (f + bias).floor() as i64
    } else {
        (f - bias).ceil() as i64
    }
}

/// Mixed string/numeric comparison (§4.1): first attempt numeric parse on
/// the string operand; if both succeed, compare numerically within
/// `fltdiff` tolerance; otherwise compare as bytes with an optional
/// case-insensitivity flag.
pub fn compare_mixed(a: &str, b: &str, cfg: &NumConfig, nocase: bool) -> std::cmp::Ordering {
    if let (Some(na), Some(nb)) = (k_str_to_num(a), k_str_to_num(b)) {
        let fa = match na {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        };
        let fb = match nb {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        };
        if (fa - fb).abs() <= cfg.fltdiff {
            return std::cmp::Ordering::Equal;
        }
        return fa.partial_cmp(&fb).unwrap_or(std::cmp::Ordering::Equal);
    }
    if nocase {
        a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
    } else {
        a.as_bytes().cmp(b.as_bytes())
    }
}

/// Rounds out the error surface expected by callers that combine
/// coercion with the warn/raise policy.
pub fn coerce_or_warn(s: &str, cfg: &NumConfig) -> Result<Num, InterpError> {
    match k_str_to_num(s) {
        Some(n) => Ok(n),
        None => {
            if cfg.nonnumeric_is_error {
                Err(InterpError::NonNumeric { value: s.to_string() })
            } else {
                Ok(Num::Int(0))
            }
        }
    }
}
