//! Alternate-key (AK) index subfiles (spec §3.3, §4.4).
//!
//! Each present AK subfile holds a header cross-checked against the
//! primary's `creation_timestamp`, the I-type (indexing expression)
//! source, and a B-tree of `(key, record-id)` pairs. The B-tree itself
//! is kept as an in-process `BTreeMap`; spec §3.3 only requires ordered
//! key lookup and range scan, both of which `BTreeMap` gives directly,
//! so there is no need for the original's on-disk node chain format.

use std::collections::BTreeMap;

use crate::error::{AkCrossCheckFailedSnafu, AkHeaderCorruptSnafu, DhError};

/// An AK subfile's header (spec §3.3): I-type source, its evaluation
/// flags, and the timestamp that must match the primary's.
#[derive(Debug, Clone)]
pub struct AkHeader {
    pub index: u8,
    pub name: String,
    /// The I-type source text (possibly chased through a node chain in
    /// the original when it overflows a fixed inline length; this crate
    /// keeps it as one `String` since there is no fixed-block inline
    /// limit to honor without a real on-disk AK format).
    pub itype_source: String,
    pub flags: AkFlags,
    pub data_creation_timestamp: u64,
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct AkFlags: u8 {
        const UNIQUE = 0x01;
        const NOCASE = 0x02;
        const DESCENDING = 0x04;
    }
}

impl AkHeader {
    /// Validates the AK header's timestamp against the primary's
    /// `creation_timestamp` (spec §4.4 "validate its header's
    /// data_creation_timestamp matches the primary's").
    pub fn cross_check(&self, primary_creation_timestamp: u64) -> Result<(), DhError> {
        if self.name.is_empty() {
            return AkHeaderCorruptSnafu { reason: "empty AK name".to_string() }.fail();
        }
        if self.data_creation_timestamp != primary_creation_timestamp {
            return AkCrossCheckFailedSnafu { index: self.index }.fail();
        }
        Ok(())
    }
}

/// One AK subfile: its header plus the ordered `(key, record-id)` pairs
/// (spec §3.3). Keys support duplicates unless `AkFlags::UNIQUE` is set.
#[derive(Debug, Clone)]
pub struct AkSubfile {
    pub header: AkHeader,
    entries: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
}

impl AkSubfile {
    pub fn new(header: AkHeader) -> AkSubfile {
        AkSubfile { header, entries: BTreeMap::new() }
    }

    fn normalize(&self, key: &[u8]) -> Vec<u8> {
        if self.header.flags.contains(AkFlags::NOCASE) {
            key.to_ascii_uppercase()
        } else {
            key.to_vec()
        }
    }

    /// Inserts `(key, record_id)`; rejected with `Ok(false)` instead of
    /// inserted if the AK is unique and the key already maps to a
    /// different record (the caller surfaces this as a write failure).
    pub fn insert(&mut self, key: &[u8], record_id: &[u8]) -> bool {
        let key = self.normalize(key);
        let bucket = self.entries.entry(key).or_default();
        if self.header.flags.contains(AkFlags::UNIQUE) && !bucket.is_empty() && !bucket.contains(&record_id.to_vec()) {
            return false;
        }
        if !bucket.iter().any(|id| id == record_id) {
            bucket.push(record_id.to_vec());
        }
        true
    }

    pub fn remove(&mut self, key: &[u8], record_id: &[u8]) {
        let key = self.normalize(key);
        if let Some(bucket) = self.entries.get_mut(&key) {
            bucket.retain(|id| id != record_id);
            if bucket.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    pub fn lookup(&self, key: &[u8]) -> &[Vec<u8>] {
        let key = self.normalize(key);
        self.entries.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ordered scan of all keys, honoring `AkFlags::DESCENDING`.
    pub fn scan(&self) -> Box<dyn Iterator<Item = (&Vec<u8>, &Vec<Vec<u8>>)> + '_> {
        if self.header.flags.contains(AkFlags::DESCENDING) {
            Box::new(self.entries.iter().rev())
        } else {
            Box::new(self.entries.iter())
        }
    }

    /// Serializes the header and every `(key, record-ids)` entry to the
    /// AK subfile's on-disk form (spec §3.3: AK subfiles are physical
    /// files `~2..~33`, not a purely in-memory structure).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.header.index);
        out.push(self.header.flags.bits());
        out.extend_from_slice(&self.header.data_creation_timestamp.to_le_bytes());
        write_lp_string(&mut out, &self.header.name);
        write_lp_string(&mut out, &self.header.itype_source);
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (key, ids) in &self.entries {
            write_lp_bytes(&mut out, key);
            out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
            for id in ids {
                write_lp_bytes(&mut out, id);
            }
        }
        out
    }

    /// Inverse of [`AkSubfile::to_bytes`], read back by `dh_open` (spec
    /// §4.4) so a reopened file's AK index survives across processes.
    pub fn from_bytes(buf: &[u8]) -> Result<AkSubfile, DhError> {
        let corrupt = |reason: &str| AkHeaderCorruptSnafu { reason: reason.to_string() }.fail();
        if buf.len() < 10 {
            return corrupt("AK subfile truncated");
        }
        let mut pos = 0usize;
        let index = buf[pos];
        pos += 1;
        let flags = AkFlags::from_bits_truncate(buf[pos]);
        pos += 1;
        let data_creation_timestamp = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let (name, pos) = read_lp_string(buf, pos)?;
        let (itype_source, pos) = read_lp_string(buf, pos)?;
        if pos + 4 > buf.len() {
            return corrupt("AK subfile truncated before entry count");
        }
        let count = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        let mut pos = pos + 4;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let (key, next) = read_lp_bytes(buf, pos)?;
            pos = next;
            if pos + 4 > buf.len() {
                return corrupt("AK subfile truncated mid-entry");
            }
            let id_count = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let mut ids = Vec::with_capacity(id_count as usize);
            for _ in 0..id_count {
                let (id, next) = read_lp_bytes(buf, pos)?;
                pos = next;
                ids.push(id);
            }
            entries.insert(key, ids);
        }
        Ok(AkSubfile { header: AkHeader { index, name, itype_source, flags, data_creation_timestamp }, entries })
    }
}

fn write_lp_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_lp_string(out: &mut Vec<u8>, s: &str) {
    write_lp_bytes(out, s.as_bytes());
}

fn read_lp_bytes(buf: &[u8], pos: usize) -> Result<(Vec<u8>, usize), DhError> {
    if pos + 4 > buf.len() {
        return AkHeaderCorruptSnafu { reason: "AK subfile truncated before length prefix".to_string() }.fail();
    }
    let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
    let start = pos + 4;
    if start + len > buf.len() {
        return AkHeaderCorruptSnafu { reason: "AK subfile truncated before payload".to_string() }.fail();
    }
    Ok((buf[start..start + len].to_vec(), start + len))
}

fn read_lp_string(buf: &[u8], pos: usize) -> Result<(String, usize), DhError> {
    let (bytes, next) = read_lp_bytes(buf, pos)?;
    let s = String::from_utf8(bytes).map_err(|_| AkHeaderCorruptSnafu { reason: "AK subfile name/itype not valid utf-8".to_string() }.build())?;
    Ok((s, next))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> AkHeader {
        AkHeader {
            index: 0,
            name: "BY_NAME".to_string(),
            itype_source: "NAME".to_string(),
            flags: AkFlags::empty(),
            data_creation_timestamp: 1000,
        }
    }

    #[test]
    fn cross_check_rejects_mismatched_timestamp() {
        let h = header();
        assert!(h.cross_check(1000).is_ok());
        assert!(matches!(h.cross_check(999), Err(DhError::AkCrossCheckFailed { .. })));
    }

    #[test]
    fn unique_ak_rejects_second_record_for_same_key() {
        let mut ak = AkSubfile::new(AkHeader { flags: AkFlags::UNIQUE, ..header() });
        assert!(ak.insert(b"smith", b"REC1"));
        assert!(!ak.insert(b"smith", b"REC2"));
        assert!(ak.insert(b"smith", b"REC1"));
    }

    #[test]
    fn nocase_ak_folds_key_case() {
        let mut ak = AkSubfile::new(AkHeader { flags: AkFlags::NOCASE, ..header() });
        ak.insert(b"Smith", b"REC1");
        assert_eq!(ak.lookup(b"SMITH"), &[b"REC1".to_vec()]);
    }

    #[test]
    fn to_bytes_from_bytes_round_trips_entries() {
        let mut ak = AkSubfile::new(header());
        ak.insert(b"smith", b"REC1");
        ak.insert(b"smith", b"REC2");
        ak.insert(b"jones", b"REC3");
        let bytes = ak.to_bytes();
        let restored = AkSubfile::from_bytes(&bytes).unwrap();
        assert_eq!(restored.lookup(b"smith"), &[b"REC1".to_vec(), b"REC2".to_vec()]);
        assert_eq!(restored.lookup(b"jones"), &[b"REC3".to_vec()]);
        assert_eq!(restored.header.name, "BY_NAME");
        assert_eq!(restored.header.data_creation_timestamp, 1000);
    }
}
