//! Template match (spec §4.2 `match_template`, `MATCHFIELD`).
//!
//! A template is composed of literal runs (bare or quoted), `nA`/`nN`/`nX`
//! counted character classes, `n-mX` ranges, a `~` complement prefix, the
//! `...` alias for `0X`, and `VALUE_MARK`-delimited alternations (the
//! whole template retried branch by branch). `n=0` means "zero or more,
//! greedy with backtracking": try the maximal match first, then shrink
//! until the remainder matches the rest of the template.

use super::VALUE_MARK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Alpha,
    Numeric,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateElem {
    Literal(Vec<u8>),
    Class { min: usize, max: usize, class: CharClass, complement: bool },
}

fn is_special(c: u8) -> bool {
    c == b'\'' || c == b'"' || c == b'~' || c.is_ascii_digit() || c == b'A' || c == b'N' || c == b'X' || c == b'.'
}

fn parse_count_class(tpl: &[u8], i: &mut usize) -> TemplateElem {
    let mut complement = false;
    if *i < tpl.len() && tpl[*i] == b'~' {
        complement = true;
        *i += 1;
    }
    let start = *i;
    while *i < tpl.len() && tpl[*i].is_ascii_digit() {
        *i += 1;
    }
    let n1: Option<usize> = if *i > start {
        std::str::from_utf8(&tpl[start..*i]).ok().and_then(|s| s.parse().ok())
    } else {
        None
    };
    let mut n2: Option<usize> = None;
    if *i < tpl.len() && tpl[*i] == b'-' {
        *i += 1;
        let start2 = *i;
        while *i < tpl.len() && tpl[*i].is_ascii_digit() {
            *i += 1;
        }
        n2 = std::str::from_utf8(&tpl[start2..*i]).ok().and_then(|s| s.parse().ok());
    }
    let class_ch = if *i < tpl.len() { tpl[*i] } else { b'X' };
    if *i < tpl.len() {
        *i += 1;
    }
    let class = match class_ch {
        b'A' => CharClass::Alpha,
        b'N' => CharClass::Numeric,
        _ => CharClass::Any,
    };
    let (min, max) = match (n1, n2) {
        (Some(0), None) => (0, usize::MAX),
        (Some(a), None) => (a, a),
        (Some(a), Some(b)) => (a, b),
        (None, _) => (1, 1),
    };
    TemplateElem::Class { min, max, class, complement }
}

fn parse_branch(tpl: &[u8]) -> Vec<TemplateElem> {
    let mut elems = Vec::new();
    let mut i = 0;
    while i < tpl.len() {
        let c = tpl[i];
        if c == b'\'' || c == b'"' {
            let quote = c;
            let start = i + 1;
            let mut j = start;
            while j < tpl.len() && tpl[j] != quote {
                j += 1;
            }
            elems.push(TemplateElem::Literal(tpl[start..j].to_vec()));
            i = (j + 1).min(tpl.len());
        } else if tpl[i..].starts_with(b"...") {
            elems.push(TemplateElem::Class { min: 0, max: usize::MAX, class: CharClass::Any, complement: false });
            i += 3;
        } else if c == b'~' || c.is_ascii_digit() || c == b'A' || c == b'N' || c == b'X' {
            elems.push(parse_count_class(tpl, &mut i));
        } else {
            let start = i;
            while i < tpl.len() && !is_special(tpl[i]) {
                i += 1;
            }
            if i == start {
                i += 1;
            }
            elems.push(TemplateElem::Literal(tpl[start..i].to_vec()));
        }
    }
    elems
}

fn matches_class(c: u8, class: CharClass, complement: bool) -> bool {
    let base = match class {
        CharClass::Alpha => c.is_ascii_alphabetic(),
        CharClass::Numeric => c.is_ascii_digit(),
        CharClass::Any => true,
    };
    if complement {
        !base
    } else {
        base
    }
}

fn match_from(elems: &[TemplateElem], ei: usize, s: &[u8], si: usize, caps: &mut Vec<(usize, usize)>) -> bool {
    if ei == elems.len() {
        return si == s.len();
    }
    match &elems[ei] {
        TemplateElem::Literal(lit) => {
            if s[si..].starts_with(lit.as_slice()) {
                caps.push((si, si + lit.len()));
                if match_from(elems, ei + 1, s, si + lit.len(), caps) {
                    return true;
                }
                caps.pop();
            }
            false
        }
        TemplateElem::Class { min, max, class, complement } => {
            let mut count = 0usize;
            while si + count < s.len() && count < *max && matches_class(s[si + count], *class, *complement) {
                count += 1;
            }
            if count < *min {
                return false;
            }
            let mut try_count = count;
            loop {
                caps.push((si, si + try_count));
                if match_from(elems, ei + 1, s, si + try_count, caps) {
                    return true;
                }
                caps.pop();
                if try_count == *min {
                    break;
                }
                try_count -= 1;
            }
            false
        }
    }
}

/// Matches `s` against `template`, trying each `VALUE_MARK`-delimited
/// alternative in order. Returns the per-component capture spans of the
/// first branch that matches the whole string.
pub fn match_template(s: &[u8], template: &[u8]) -> Option<Vec<(usize, usize)>> {
    for branch in template.split(|&b| b == VALUE_MARK) {
        let elems = parse_branch(branch);
        let mut caps = Vec::with_capacity(elems.len());
        if match_from(&elems, 0, s, 0, &mut caps) {
            return Some(caps);
        }
    }
    None
}

/// `MATCHFIELD(src, template, k)`: the k-th (1-origin) captured component
/// of the first matching branch.
pub fn matchfield<'a>(s: &'a [u8], template: &[u8], k: usize) -> Option<&'a [u8]> {
    let caps = match_template(s, template)?;
    let (a, b) = *caps.get(k.checked_sub(1)?)?;
    Some(&s[a..b])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_template() {
        let t = b"3N'-'2N'-'4N";
        assert!(match_template(b"25-12-2024", t).is_some());
        assert!(match_template(b"2024-12-25", t).is_none());
        assert!(match_template(b"25-12-202X", t).is_none());
    }

    #[test]
    fn greedy_zero_or_more() {
        let t = b"0N'kg'";
        assert!(match_template(b"12kg", t).is_some());
        assert!(match_template(b"kg", t).is_some());
        assert!(match_template(b"12kg ", t).is_none());
    }

    #[test]
    fn matchfield_returns_component() {
        let t = b"3N'-'2N'-'4N";
        assert_eq!(matchfield(b"25-12-2024", t, 1), Some(b"25".as_ref()));
        assert_eq!(matchfield(b"25-12-2024", t, 3), Some(b"2024".as_ref()));
    }
}
