//! `DH_HEADER`, the primary subfile's leading block (spec §3.3).

use bitflags::bitflags;

use crate::error::{DhError, HeaderCorruptSnafu, VersionUnsupportedSnafu};

pub const DH_MAGIC: u32 = 0x4448_4649; // "DHFI"
pub const DH_VERSION: u16 = 1;
pub const MAX_AK: u8 = 32;
pub const AK_BASE_SUBFILE: usize = 2;
pub const HEADER_BLOCK_SIZE: usize = 2048;

bitflags! {
    /// `DH_HEADER.flags` (spec §3.3).
    #[derive(Default)]
    pub struct DhFlags: u16 {
        const TRUSTED = 0x0001;
        const NOCASE  = 0x0002;
        const AK      = 0x0004;
    }
}

/// Linear-hash tuning parameters (spec §3.3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhParams {
    /// Current hash modulus (number of primary groups).
    pub modulus: u32,
    /// Floor the modulus can shrink back to on merge.
    pub min_modulus: u32,
    /// Records whose data exceeds this many bytes are stored out-of-line
    /// via the big-record chain (§3.3).
    pub big_rec_size: u32,
    /// Percentage load at which a group splits.
    pub split_load: u8,
    /// Percentage load at which sibling groups merge back.
    pub merge_load: u8,
    /// Bytes currently occupied across all groups, tracked incrementally
    /// to avoid a full-file scan when deciding to split/merge.
    pub load_bytes: u64,
    /// The next-group boundary within the current doubling of the
    /// modulus ("mod_value" in the original — the split pointer).
    pub mod_value: u32,
    pub longest_id: u16,
    /// Head of the free-block chain in the overflow subfile, or 0.
    pub free_chain: u32,
}

impl Default for DhParams {
    fn default() -> Self {
        DhParams {
            modulus: 1,
            min_modulus: 1,
            big_rec_size: 1500,
            split_load: 80,
            merge_load: 50,
            load_bytes: 0,
            mod_value: 0,
            longest_id: 0,
            free_chain: 0,
        }
    }
}

/// Primary subfile header (spec §3.3). `group_size` is in units of 1 KiB
/// blocks (1..8), matching `GRPSIZE`'s config range (§6).
#[derive(Debug, Clone)]
pub struct DhHeader {
    pub magic: u32,
    pub version: u16,
    pub group_size: u8,
    /// Bitmask of present AK indices (bit *i* => subfile `~{i+2}`).
    pub ak_map: u32,
    pub params: DhParams,
    pub record_count: u64,
    pub flags: DhFlags,
    pub creation_timestamp: u64,
    pub trigger_name: Option<String>,
    pub trigger_modes: u8,
    pub akpath: Option<String>,
    pub stats_reads: u64,
    pub stats_writes: u64,
}

impl DhHeader {
    pub fn new(group_size: u8, nocase: bool) -> DhHeader {
        let mut flags = DhFlags::empty();
        if nocase {
            flags |= DhFlags::NOCASE;
        }
        DhHeader {
            magic: DH_MAGIC,
            version: DH_VERSION,
            group_size: group_size.clamp(1, 8),
            ak_map: 0,
            params: DhParams::default(),
            record_count: 0,
            flags,
            creation_timestamp: 0,
            trigger_name: None,
            trigger_modes: 0,
            akpath: None,
            stats_reads: 0,
            stats_writes: 0,
        }
    }

    pub fn group_block_bytes(&self) -> usize {
        self.group_size as usize * 1024
    }

    pub fn is_nocase(&self) -> bool {
        self.flags.contains(DhFlags::NOCASE)
    }

    pub fn is_trusted(&self) -> bool {
        self.flags.contains(DhFlags::TRUSTED)
    }

    /// Count of AK indices present, by popcount of `ak_map` (§4.4 open).
    pub fn ak_count(&self) -> u32 {
        self.ak_map.count_ones()
    }

    pub fn has_ak(&self, index: u8) -> bool {
        index < MAX_AK && (self.ak_map & (1 << index)) != 0
    }

    pub fn set_ak(&mut self, index: u8, present: bool) {
        if index >= MAX_AK {
            return;
        }
        if present {
            self.ak_map |= 1 << index;
        } else {
            self.ak_map &= !(1 << index);
        }
    }

    /// Packs the header into a fixed-size little-endian block
    /// (DESIGN.md: hand-packed bytes instead of a zero-copy archive
    /// framework, so the on-disk layout stays exact and auditable).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_BLOCK_SIZE);
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.group_size);
        buf.extend_from_slice(&self.ak_map.to_le_bytes());
        buf.extend_from_slice(&self.params.modulus.to_le_bytes());
        buf.extend_from_slice(&self.params.min_modulus.to_le_bytes());
        buf.extend_from_slice(&self.params.big_rec_size.to_le_bytes());
        buf.push(self.params.split_load);
        buf.push(self.params.merge_load);
        buf.extend_from_slice(&self.params.load_bytes.to_le_bytes());
        buf.extend_from_slice(&self.params.mod_value.to_le_bytes());
        buf.extend_from_slice(&self.params.longest_id.to_le_bytes());
        buf.extend_from_slice(&self.params.free_chain.to_le_bytes());
        buf.extend_from_slice(&self.record_count.to_le_bytes());
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        buf.extend_from_slice(&self.creation_timestamp.to_le_bytes());
        buf.push(self.trigger_modes);
        buf.extend_from_slice(&self.stats_reads.to_le_bytes());
        buf.extend_from_slice(&self.stats_writes.to_le_bytes());
        buf.resize(HEADER_BLOCK_SIZE, 0);
        buf
    }

    /// Validates magic and version against the maximum this build
    /// supports (spec §4.4 "validate header magic + version").
    pub fn validate(&self, max_version: u16) -> Result<(), DhError> {
        if self.magic != DH_MAGIC {
            return HeaderCorruptSnafu { reason: "bad magic".to_string() }.fail();
        }
        if self.version > max_version {
            return VersionUnsupportedSnafu { found: self.version, max: max_version }.fail();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ak_map_popcount_tracks_set_bits() {
        let mut h = DhHeader::new(2, false);
        h.set_ak(0, true);
        h.set_ak(3, true);
        assert_eq!(h.ak_count(), 2);
        assert!(h.has_ak(0));
        assert!(!h.has_ak(1));
    }

    #[test]
    fn validate_rejects_future_version() {
        let mut h = DhHeader::new(1, false);
        h.version = 99;
        assert!(matches!(h.validate(DH_VERSION), Err(DhError::VersionUnsupported { .. })));
    }
}
