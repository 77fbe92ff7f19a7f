//! Multi-value fold (spec §4.2): `MVD`, `MVDD`, `MVDS`, `MVDSS`,
//! `MVDSSS`, `IFS` all drive a scalar opcode once per parallel element
//! across one or more mark-partitioned dynamic arrays. The scalar opcode
//! itself lives in the (external) opcode dispatch table; this module
//! provides the generic fold it runs inside of.

use super::mark_rank;

/// Extracts the next element from `data` starting at `*pos`, up to the
/// next mark byte. Returns `(element_bytes, ending_mark)`, where
/// `ending_mark` is `None` if the element ran to the end of `data`
/// without a trailing mark. Returns `None` once the final element has
/// already been consumed.
fn next_elem(data: &[u8], pos: &mut usize) -> Option<(Vec<u8>, Option<u8>)> {
    if *pos > data.len() {
        return None;
    }
    let start = *pos;
    let mut i = start;
    while i < data.len() && !super::is_mark(data[i]) {
        i += 1;
    }
    let elem = data[start..i].to_vec();
    let end_mark = if i < data.len() { Some(data[i]) } else { None };
    *pos = if i < data.len() { i + 1 } else { data.len() + 1 };
    Some((elem, end_mark))
}

/// Drives `op` once per parallel element across `inputs`. `reuse[i]`
/// controls what happens once input `i` runs out of elements while
/// others continue: `true` repeats its last extracted value (`DF_REUSE`),
/// `false` substitutes an empty default. The delimiter emitted between
/// cycles is the minimum (lowest-precedence) ending mark among the
/// inputs that produced an element this cycle.
pub fn mv_fold<F>(inputs: &[&[u8]], reuse: &[bool], mut op: F) -> Vec<u8>
where
    F: FnMut(&[Vec<u8>]) -> Vec<u8>,
{
    let mut positions = vec![0usize; inputs.len()];
    let mut last_values: Vec<Vec<u8>> = vec![Vec::new(); inputs.len()];
    let mut out = Vec::new();
    let mut first = true;

    loop {
        let mut values = Vec::with_capacity(inputs.len());
        let mut any_active = false;
        let mut min_mark: Option<u8> = None;

        for (idx, data) in inputs.iter().enumerate() {
            match next_elem(data, &mut positions[idx]) {
                Some((elem, end_mark)) => {
                    any_active = true;
                    last_values[idx] = elem.clone();
                    values.push(elem);
                    if let Some(m) = end_mark {
                        min_mark = Some(match min_mark {
                            Some(cur) if mark_rank(cur) <= mark_rank(m) => cur,
                            _ => m,
                        });
                    }
                }
                None => {
                    if reuse.get(idx).copied().unwrap_or(false) {
                        values.push(last_values[idx].clone());
                    } else {
                        values.push(Vec::new());
                    }
                }
            }
        }

        if !any_active {
            break;
        }

        let result = op(&values);
        if !first {
            out.push(min_mark.unwrap_or(super::VALUE_MARK));
        }
        out.extend_from_slice(&result);
        first = false;

        if min_mark.is_none() {
            break;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_scalar(a: &[u8], b: &[u8]) -> Vec<u8> {
        let av: i64 = std::str::from_utf8(a).unwrap().parse().unwrap_or(0);
        let bv: i64 = std::str::from_utf8(b).unwrap().parse().unwrap_or(0);
        (av + bv).to_string().into_bytes()
    }

    #[test]
    fn mv_add_with_reuse() {
        let a = b"1\xFD2\xFD3".to_vec();
        let b = b"10".to_vec();
        let result = mv_fold(&[&a, &b], &[false, true], |vals| add_scalar(&vals[0], &vals[1]));
        assert_eq!(result, b"11\xFD12\xFD13".to_vec());
    }

    #[test]
    fn mv_add_without_reuse_defaults_to_empty_then_zero() {
        let a = b"1\xFD2\xFD3".to_vec();
        let b = b"10".to_vec();
        let result = mv_fold(&[&a, &b], &[false, false], |vals| add_scalar(&vals[0], &vals[1]));
        assert_eq!(result, b"11\xFD2\xFD3".to_vec());
    }
}
