//! `DH_BLOCK` group blocks and the packed record sequence inside them
//! (spec §3.3).

use bitflags::bitflags;

use crate::error::{DhError, HeaderCorruptSnafu};

bitflags! {
    /// Per-record flags (spec §3.3).
    #[derive(Default)]
    pub struct RecordFlags: u8 {
        /// Record's data lives in the big-record chain; the inline data
        /// slot holds only the chain's starting block number.
        const BIG_REC = 0x01;
    }
}

/// One packed record as stored inside a group block (spec §3.3): a
/// header (`next`, `id_len`, `flags`) immediately followed by the id
/// bytes, then either inline data bytes or (if `BIG_REC`) the 4-byte
/// starting block number of the big-record chain.
#[derive(Debug, Clone)]
pub struct PackedRecord {
    pub id: Vec<u8>,
    pub flags: RecordFlags,
    /// Inline data, or empty if `BIG_REC` is set (see `big_rec_start`).
    pub inline_data: Vec<u8>,
    pub big_rec_start: u32,
}

impl PackedRecord {
    pub fn is_big(&self) -> bool {
        self.flags.contains(RecordFlags::BIG_REC)
    }

    /// Header + id + payload size this record occupies in its block.
    pub fn packed_len(&self) -> usize {
        const HEADER_LEN: usize = 2 + 2 + 1; // next(u16) + id_len(u16) + flags(u8)
        HEADER_LEN + self.id.len() + if self.is_big() { 4 } else { self.inline_data.len() }
    }

    fn write_to(&self, out: &mut Vec<u8>, next_offset: u16) {
        out.extend_from_slice(&next_offset.to_le_bytes());
        out.extend_from_slice(&(self.id.len() as u16).to_le_bytes());
        out.push(self.flags.bits());
        out.extend_from_slice(&self.id);
        if self.is_big() {
            out.extend_from_slice(&self.big_rec_start.to_le_bytes());
        } else {
            out.extend_from_slice(&self.inline_data);
        }
    }
}

/// A group block: `used_bytes`, an overflow link, and the packed records
/// (spec §3.3). `capacity` is `group_size * 1024` from the file header.
#[derive(Debug, Clone)]
pub struct DhBlock {
    pub used_bytes: u32,
    pub next_overflow: u32,
    pub records: Vec<PackedRecord>,
    pub capacity: u32,
}

const BLOCK_HEADER_LEN: u32 = 4 + 4; // used_bytes(u32) + next_overflow(u32)

impl DhBlock {
    pub fn empty(capacity: u32) -> DhBlock {
        DhBlock { used_bytes: BLOCK_HEADER_LEN, next_overflow: 0, records: Vec::new(), capacity }
    }

    pub fn free_bytes(&self) -> u32 {
        self.capacity.saturating_sub(self.used_bytes)
    }

    /// Appends `record` if it fits; returns `false` if the block has no
    /// room (caller then allocates/follows an overflow block, §4.4).
    pub fn push(&mut self, record: PackedRecord) -> bool {
        let len = record.packed_len() as u32;
        if len > self.free_bytes() {
            return false;
        }
        self.used_bytes += len;
        self.records.push(record);
        true
    }

    pub fn remove_id(&mut self, id: &[u8], nocase: bool) -> Option<PackedRecord> {
        let pos = self
            .records
            .iter()
            .position(|r| ids_equal(&r.id, id, nocase))?;
        let removed = self.records.remove(pos);
        self.used_bytes -= removed.packed_len() as u32;
        Some(removed)
    }

    pub fn find(&self, id: &[u8], nocase: bool) -> Option<&PackedRecord> {
        self.records.iter().find(|r| ids_equal(&r.id, id, nocase))
    }

    /// Serializes the block (header + packed records walked by `next`
    /// offset, spec §3.3's invariant that walking `next` from the block
    /// header reaches exactly `used_bytes`).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.capacity as usize);
        out.extend_from_slice(&self.used_bytes.to_le_bytes());
        out.extend_from_slice(&self.next_overflow.to_le_bytes());
        let mut offset = BLOCK_HEADER_LEN;
        for (i, rec) in self.records.iter().enumerate() {
            let len = rec.packed_len() as u32;
            let next = if i + 1 < self.records.len() { (offset + len) as u16 } else { 0 };
            rec.write_to(&mut out, next);
            offset += len;
        }
        out.resize(self.capacity as usize, 0);
        out
    }

    /// Validates `used_bytes` is within `[header, capacity]`, the
    /// invariant §3.3 calls out explicitly as a fatal corruption check.
    pub fn validate(&self) -> Result<(), DhError> {
        if self.used_bytes < BLOCK_HEADER_LEN || self.used_bytes > self.capacity {
            return HeaderCorruptSnafu {
                reason: format!("used_bytes {} out of range [{}, {}]", self.used_bytes, BLOCK_HEADER_LEN, self.capacity),
            }
            .fail();
        }
        Ok(())
    }
}

fn ids_equal(a: &[u8], b: &[u8], nocase: bool) -> bool {
    if nocase {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &[u8], data: &[u8]) -> PackedRecord {
        PackedRecord { id: id.to_vec(), flags: RecordFlags::empty(), inline_data: data.to_vec(), big_rec_start: 0 }
    }

    #[test]
    fn push_and_find_round_trip() {
        let mut block = DhBlock::empty(512);
        assert!(block.push(rec(b"CUST1", b"hello")));
        let found = block.find(b"cust1", true).unwrap();
        assert_eq!(found.inline_data, b"hello");
        assert!(block.find(b"cust1", false).is_none());
    }

    #[test]
    fn push_fails_when_block_full() {
        let mut block = DhBlock::empty(20);
        assert!(block.push(rec(b"A", &[0u8; 5])));
        assert!(!block.push(rec(b"B", &[0u8; 100])));
    }

    #[test]
    fn remove_frees_used_bytes() {
        let mut block = DhBlock::empty(512);
        block.push(rec(b"A", b"xx"));
        let before = block.used_bytes;
        block.remove_id(b"A", false).unwrap();
        assert!(block.used_bytes < before);
    }

    #[test]
    fn validate_rejects_out_of_range_used_bytes() {
        let mut block = DhBlock::empty(512);
        block.used_bytes = 10_000;
        assert!(block.validate().is_err());
    }
}
