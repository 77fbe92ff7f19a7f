//! Positional locator (`find_item`) and `LOCATE` (spec §4.2).

use crate::descriptor::PositionHint;
use std::cmp::Ordering;

use super::Coord;

/// Result of a positional lookup: either the byte span `[start, end)` of
/// the found item, or the offset at which an append/insert would begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    Found { start: usize, end: usize },
    NotFound { append_at: usize },
}

impl FindResult {
    pub fn is_found(&self) -> bool {
        matches!(self, FindResult::Found { .. })
    }
}

/// Byte spans of the top-level segments of `range` within `s`, split on
/// `mark`.
fn spans(s: &[u8], range: (usize, usize), mark: u8) -> Vec<(usize, usize)> {
    let (lo, hi) = range;
    let slice = &s[lo..hi];
    let mut out = Vec::new();
    let mut start = 0usize;
    for (i, &b) in slice.iter().enumerate() {
        if b == mark {
            out.push((lo + start, lo + i));
            start = i + 1;
        }
    }
    out.push((lo + start, hi));
    out
}

/// The positional locator (§4.2 `find_item`). Given 1-origin `(field,
/// value, subvalue)` coordinates (zero meaning "whole range at this
/// depth"), returns the span of the addressed item, or the position one
/// past the last byte of the nearest enclosing item if the coordinate
/// doesn't exist (used by `rdi` to position an insert/append).
///
/// Position `(1, 1, 1)` on an empty string is a special case: the whole
/// (empty) string is treated as found at `[0, 0)`.
pub fn find_item(s: &[u8], coord: Coord) -> FindResult {
    if s.is_empty() {
        let addresses_first = coord.field <= 1 && coord.value <= 1 && coord.subvalue <= 1;
        if addresses_first {
            return FindResult::Found { start: 0, end: 0 };
        }
        return FindResult::NotFound { append_at: 0 };
    }

    if coord.field < 1 {
        return FindResult::NotFound { append_at: s.len() };
    }

    let field_spans = spans(s, (0, s.len()), super::FIELD_MARK);
    let fi = (coord.field - 1) as usize;
    if fi >= field_spans.len() {
        return FindResult::NotFound { append_at: s.len() };
    }
    let (fs, fe) = field_spans[fi];
    if coord.value == 0 {
        return FindResult::Found { start: fs, end: fe };
    }
    if coord.value < 1 {
        return FindResult::NotFound { append_at: fe };
    }

    let value_spans = spans(s, (fs, fe), super::VALUE_MARK);
    let vi = (coord.value - 1) as usize;
    if vi >= value_spans.len() {
        return FindResult::NotFound { append_at: fe };
    }
    let (vs, ve) = value_spans[vi];
    if coord.subvalue == 0 {
        return FindResult::Found { start: vs, end: ve };
    }
    if coord.subvalue < 1 {
        return FindResult::NotFound { append_at: ve };
    }

    let sub_spans = spans(s, (vs, ve), super::SUBVALUE_MARK);
    let si = (coord.subvalue - 1) as usize;
    if si >= sub_spans.len() {
        return FindResult::NotFound { append_at: ve };
    }
    let (ss, se) = sub_spans[si];
    FindResult::Found { start: ss, end: se }
}

/// Hint-accelerated variant: if `hint.field <= coord.field`, the field
/// scan starts counting from the hinted field at the hinted byte offset
/// instead of from the start of the string, then the returned hint is
/// updated to the field actually found. Mirrors §4.2's "uses and updates
/// the head chunk's hint if the request is at or beyond the hinted
/// field".
pub fn find_item_hinted(
    s: &[u8],
    coord: Coord,
    hint: Option<PositionHint>,
) -> (FindResult, Option<PositionHint>) {
    let usable_hint = hint.filter(|h| (h.field as i32) >= 1 && (h.field as i32) <= coord.field && h.offset <= s.len());

    let (window_start, base_field) = match usable_hint {
        Some(h) => (h.offset, h.field as i32),
        None => (0, 1),
    };

    let field_spans = spans(s, (window_start, s.len()), super::FIELD_MARK);
    let target_idx = coord.field - base_field;
    if target_idx < 0 || target_idx as usize >= field_spans.len() {
        return (find_item(s, coord), hint);
    }
    let (fs, fe) = field_spans[target_idx as usize];
    let new_hint = Some(PositionHint { field: coord.field.max(1) as u32, offset: fs });

    if coord.value == 0 {
        return (FindResult::Found { start: fs, end: fe }, new_hint);
    }
    if coord.value < 1 {
        return (FindResult::NotFound { append_at: fe }, new_hint);
    }
    let value_spans = spans(s, (fs, fe), super::VALUE_MARK);
    let vi = (coord.value - 1) as usize;
    if vi >= value_spans.len() {
        return (FindResult::NotFound { append_at: fe }, new_hint);
    }
    let (vs, ve) = value_spans[vi];
    if coord.subvalue == 0 {
        return (FindResult::Found { start: vs, end: ve }, new_hint);
    }
    if coord.subvalue < 1 {
        return (FindResult::NotFound { append_at: ve }, new_hint);
    }
    let sub_spans = spans(s, (vs, ve), super::SUBVALUE_MARK);
    let si = (coord.subvalue - 1) as usize;
    if si >= sub_spans.len() {
        return (FindResult::NotFound { append_at: ve }, new_hint);
    }
    let (ss, se) = sub_spans[si];
    (FindResult::Found { start: ss, end: se }, new_hint)
}

/// `LOCATE` ordering codes (§4.2): ascending/descending, left/right
/// justified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering4 {
    /// `AL`
    AscLeft,
    /// `AR`
    AscRight,
    /// `DL`
    DescLeft,
    /// `DR`
    DescRight,
}

/// Outcome of [`locate`]: either the 1-origin position of a match, or the
/// 1-origin position at which inserting `needle` would preserve order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocateResult {
    pub position: usize,
    pub found: bool,
}

/// `LOCATE`: ordered or unordered search within a chosen depth of the
/// dynamic array (§4.2). `items` are the already-split elements at the
/// target depth. Right-justified ordering compares numerically when both
/// operands parse as numbers; otherwise pads the shorter with leading
/// spaces. Returns the match position, or the position preserving order
/// on a miss (meaningful only when `ordering` is `Some`).
pub fn locate(
    items: &[&[u8]],
    needle: &[u8],
    ordering: Option<Ordering4>,
    nocase: bool,
    cfg: &crate::descriptor::NumConfig,
) -> LocateResult {
    match ordering {
        None => {
            for (i, item) in items.iter().enumerate() {
                if bytes_eq(item, needle, nocase) {
                    return LocateResult { position: i + 1, found: true };
                }
            }
            LocateResult { position: items.len() + 1, found: false }
        }
        Some(ord) => locate_ordered(items, needle, ord, nocase, cfg),
    }
}

fn bytes_eq(a: &[u8], b: &[u8], nocase: bool) -> bool {
    if !nocase {
        return a == b;
    }
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

fn locate_ordered(
    items: &[&[u8]],
    needle: &[u8],
    ord: Ordering4,
    nocase: bool,
    cfg: &crate::descriptor::NumConfig,
) -> LocateResult {
    let descending = matches!(ord, Ordering4::DescLeft | Ordering4::DescRight);
    let right_just = matches!(ord, Ordering4::AscRight | Ordering4::DescRight);

    for (i, item) in items.iter().enumerate() {
        let c = compare_item(needle, item, right_just, nocase, cfg);
        let hit = if descending { c != Ordering::Less } else { c != Ordering::Greater };
        if c == Ordering::Equal {
            return LocateResult { position: i + 1, found: true };
        }
        if hit {
            return LocateResult { position: i + 1, found: false };
        }
    }
    LocateResult { position: items.len() + 1, found: false }
}

fn compare_item(needle: &[u8], item: &[u8], right_just: bool, nocase: bool, cfg: &crate::descriptor::NumConfig) -> Ordering {
    if right_just {
        let ns = String::from_utf8_lossy(needle);
        let is = String::from_utf8_lossy(item);
        if let (Some(_), Some(_)) = (
            crate::descriptor::k_str_to_num(&ns),
            crate::descriptor::k_str_to_num(&is),
        ) {
            return crate::descriptor::compare_mixed(&ns, &is, cfg, nocase);
        }
        let width = needle.len().max(item.len());
        let pad = |s: &[u8]| -> Vec<u8> {
            let mut v = vec![b' '; width.saturating_sub(s.len())];
            v.extend_from_slice(s);
            v
        };
        return cmp_bytes(&pad(needle), &pad(item), nocase);
    }
    cmp_bytes(needle, item, nocase)
}

fn cmp_bytes(a: &[u8], b: &[u8], nocase: bool) -> Ordering {
    if nocase {
        let la: Vec<u8> = a.iter().map(u8::to_ascii_lowercase).collect();
        let lb: Vec<u8> = b.iter().map(u8::to_ascii_lowercase).collect();
        la.cmp(&lb)
    } else {
        a.cmp(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markstr::{FIELD_MARK, VALUE_MARK};

    #[test]
    fn find_item_field_value() {
        let s = [b"a".as_ref(), &[FIELD_MARK], b"b1", &[VALUE_MARK], b"b2"].concat();
        let r = find_item(&s, Coord::field(2));
        assert_eq!(r, FindResult::Found { start: 2, end: s.len() });
        let r2 = find_item(&s, Coord::field_value(2, 2));
        assert_eq!(r2, FindResult::Found { start: 6, end: 8 });
    }

    #[test]
    fn find_item_empty_special_case() {
        assert_eq!(find_item(b"", Coord::full(1, 1, 1)), FindResult::Found { start: 0, end: 0 });
        assert_eq!(find_item(b"", Coord::field(2)), FindResult::NotFound { append_at: 0 });
    }

    #[test]
    fn locate_ascending_right_numeric() {
        let items: Vec<&[u8]> = vec![b"1", b"5", b"9"];
        let cfg = crate::descriptor::NumConfig::default();
        let r = locate(&items, b"5", Some(Ordering4::AscRight), false, &cfg);
        assert!(r.found);
        assert_eq!(r.position, 2);
        let r2 = locate(&items, b"7", Some(Ordering4::AscRight), false, &cfg);
        assert!(!r2.found);
        assert_eq!(r2.position, 3);
    }
}
