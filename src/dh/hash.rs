//! Linear hash group function and split/merge load policy (spec §3.3,
//! §4.4).
//!
//! The DH engine is a split-on-overload linear hash: the group an id
//! maps to depends on the *current* modulus, not a fixed table size, so
//! the file can grow one group at a time instead of rehashing
//! everything at once. `dh_hash_group` folds in `mod_value` (the current
//! split pointer within the modulus' doubling) to pick between a group
//! and its split sibling.

use super::header::DhParams;

/// FNV-1a, case-folded when `nocase` is set. Matches the AK collation
/// requirement that nocase files hash/compare ids case-insensitively
/// throughout the engine (§4.4 open question resolution, DESIGN.md).
fn hash_id(id: &[u8], nocase: bool) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in id {
        let byte = if nocase { b.to_ascii_uppercase() } else { b };
        h ^= byte as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01B3);
    }
    h
}

/// `dh_hash_group(id, id_len)` (spec §4.4): maps `id` to a group number
/// modulo the current linear-hash modulus, consulting `min_modulus` and
/// `mod_value` to pick between a group and the split sibling it produced
/// when the modulus last grew past it.
pub fn hash_group(id: &[u8], params: &DhParams, nocase: bool) -> u32 {
    let h = hash_id(id, nocase);
    let min = params.min_modulus.max(1) as u64;
    let modulus = params.modulus.max(1) as u64;
    let group = h % min;
    if group < params.mod_value as u64 {
        (h % modulus.max(min * 2)) as u32
    } else {
        group as u32
    }
}

/// Load percentage of a group given its used/free bytes, used to decide
/// whether to split (`split_load`) or merge back (`merge_load`, §4.4).
pub fn load_percent(used_bytes: u32, capacity: u32) -> u8 {
    if capacity == 0 {
        return 0;
    }
    ((used_bytes as u64 * 100) / capacity as u64).min(100) as u8
}

/// Advances the split pointer (`mod_value`) and, once it wraps, doubles
/// `min_modulus` and resets it — the standard linear-hash "grow by one
/// group" step (§4.4 "pushing modulus toward 2*min_modulus").
pub fn advance_split(params: &mut DhParams) {
    params.modulus += 1;
    params.mod_value += 1;
    if params.mod_value >= params.min_modulus {
        params.min_modulus *= 2;
        params.mod_value = 0;
    }
}

/// Reverses one split step when a group's load has dropped below
/// `merge_load` and its sibling can be folded back in.
pub fn retreat_merge(params: &mut DhParams) {
    if params.modulus > 1 {
        params.modulus -= 1;
    }
    if params.mod_value == 0 && params.min_modulus > 1 {
        params.min_modulus /= 2;
        params.mod_value = params.min_modulus.saturating_sub(1);
    } else if params.mod_value > 0 {
        params.mod_value -= 1;
    }
}

/// `true` once a group's load crosses `split_load`%.
pub fn should_split(used_bytes: u32, capacity: u32, params: &DhParams) -> bool {
    load_percent(used_bytes, capacity) >= params.split_load
}

/// `true` once a group's load has dropped below `merge_load`%.
pub fn should_merge(used_bytes: u32, capacity: u32, params: &DhParams) -> bool {
    load_percent(used_bytes, capacity) < params.merge_load
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_group_is_deterministic() {
        let params = DhParams { modulus: 4, min_modulus: 4, mod_value: 0, ..DhParams::default() };
        let g1 = hash_group(b"CUSTOMER1", &params, false);
        let g2 = hash_group(b"CUSTOMER1", &params, false);
        assert_eq!(g1, g2);
    }

    #[test]
    fn nocase_hash_ignores_case() {
        let params = DhParams { modulus: 4, min_modulus: 4, ..DhParams::default() };
        assert_eq!(hash_group(b"abc", &params, true), hash_group(b"ABC", &params, true));
    }

    #[test]
    fn advance_split_grows_modulus() {
        let mut params = DhParams { modulus: 1, min_modulus: 1, mod_value: 0, ..DhParams::default() };
        advance_split(&mut params);
        assert_eq!(params.modulus, 2);
    }

    #[test]
    fn split_and_merge_thresholds() {
        let params = DhParams { split_load: 80, merge_load: 50, ..DhParams::default() };
        assert!(should_split(900, 1000, &params));
        assert!(!should_split(500, 1000, &params));
        assert!(should_merge(100, 1000, &params));
        assert!(!should_merge(600, 1000, &params));
    }
}
