//! External disk-merge sort (spec §4.10): an in-memory collector that
//! spills to `sortworkdir` once it outgrows `sortmem`, then a k-way
//! merge of the spill files down to one, read back by the extract phase.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::error::{SortError, TooManyKeysSnafu};

pub const MAX_SORT_KEYS: usize = 16;

bitflags! {
    /// Per-key-column flags (spec §4.10).
    #[derive(Default)]
    pub struct KeyFlags: u8 {
        const RIGHT_JUSTIFIED = 0x01;
        const DESCENDING = 0x02;
        const UNIQUE = 0x04;
        /// This key column is also the record's data payload (a "sort
        /// by the field you're listing" shortcut some BASIC callers
        /// use instead of supplying data and keys separately).
        const HAS_DATA_PAYLOAD = 0x08;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeySpec {
    pub flags: KeyFlags,
}

/// One record moving through the sort: its data payload plus up to
/// [`MAX_SORT_KEYS`] key column values.
#[derive(Debug, Clone)]
pub struct SortRecord {
    pub data: Vec<u8>,
    pub keys: Vec<Vec<u8>>,
}

impl SortRecord {
    fn approx_size(&self) -> usize {
        self.data.len() + self.keys.iter().map(Vec::len).sum::<usize>() + 16
    }
}

/// `true` if both operands parse as numbers (spec §4.10's numeric-vs-
/// padded-byte comparison rule); mirrors `k_is_num` from the descriptor
/// runtime (§4.1) at the byte level rather than pulling in a full
/// `Descriptor`.
fn parses_as_number(s: &[u8]) -> bool {
    let trimmed = std::str::from_utf8(s).ok().map(str::trim).unwrap_or("");
    !trimmed.is_empty() && trimmed.parse::<f64>().is_ok()
}

/// Compares two key values per spec §4.10. Right-justified columns
/// compare numerically when both operands parse as numbers, otherwise
/// left-pad the shorter with spaces and compare byte for byte; a
/// left-justified column always compares as plain bytes, mirroring
/// `right_just`'s gating of the same rule in `markstr::locate`.
fn compare_key_values(a: &[u8], b: &[u8], right_justified: bool) -> Ordering {
    if !right_justified {
        return a.cmp(b);
    }
    if parses_as_number(a) && parses_as_number(b) {
        let av: f64 = std::str::from_utf8(a).unwrap().trim().parse().unwrap_or(0.0);
        let bv: f64 = std::str::from_utf8(b).unwrap().trim().parse().unwrap_or(0.0);
        return av.partial_cmp(&bv).unwrap_or(Ordering::Equal);
    }
    let width = a.len().max(b.len());
    let mut pa = vec![b' '; width - a.len()];
    pa.extend_from_slice(a);
    let mut pb = vec![b' '; width - b.len()];
    pb.extend_from_slice(b);
    pa.cmp(&pb)
}

fn compare_records(a: &SortRecord, b: &SortRecord, specs: &[KeySpec]) -> Ordering {
    for (i, spec) in specs.iter().enumerate() {
        let av = a.keys.get(i).map(Vec::as_slice).unwrap_or(&[]);
        let bv = b.keys.get(i).map(Vec::as_slice).unwrap_or(&[]);
        let mut ord = compare_key_values(av, bv, spec.flags.contains(KeyFlags::RIGHT_JUSTIFIED));
        if spec.flags.contains(KeyFlags::DESCENDING) {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Drops records whose leading `UNIQUE` key columns repeat a value
/// already seen, keeping the first record for each distinct key tuple
/// (spec §4.10: "Key comparison respects ... UNIQUE columns"; this
/// crate's interpretation mirrors SQL `DISTINCT ON`/Pick's `BY-DSND`
/// dedup — first-in-sort-order wins since callers rely on a stable,
/// deterministic pick among duplicates).
fn suppress_unique_duplicates(records: &mut Vec<SortRecord>, specs: &[KeySpec]) {
    let unique_cols: Vec<usize> = specs.iter().enumerate().filter(|(_, s)| s.flags.contains(KeyFlags::UNIQUE)).map(|(i, _)| i).collect();
    if unique_cols.is_empty() {
        return;
    }
    let mut seen = std::collections::HashSet::new();
    records.retain(|rec| {
        let key: Vec<Vec<u8>> = unique_cols.iter().map(|&i| rec.keys.get(i).cloned().unwrap_or_default()).collect();
        seen.insert(key)
    });
}

fn pad_even(len: usize) -> usize {
    len + (len % 2)
}

/// Serializes one record: length-prefixed data, then each key
/// length-prefixed and null-terminated, the whole thing 2-byte aligned
/// (spec §4.10).
fn write_record(w: &mut impl Write, rec: &SortRecord) -> std::io::Result<()> {
    w.write_all(&(rec.data.len() as u32).to_le_bytes())?;
    w.write_all(&rec.data)?;
    if rec.data.len() % 2 == 1 {
        w.write_all(&[0u8])?;
    }
    w.write_all(&(rec.keys.len() as u16).to_le_bytes())?;
    for key in &rec.keys {
        let len = key.len() as u32 + 1; // +1 for the null terminator
        w.write_all(&len.to_le_bytes())?;
        w.write_all(key)?;
        w.write_all(&[0u8])?;
        if pad_even(len as usize) != len as usize {
            w.write_all(&[0u8])?;
        }
    }
    Ok(())
}

fn read_record(r: &mut impl Read) -> std::io::Result<Option<SortRecord>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let data_len = u32::from_le_bytes(len_buf) as usize;
    let mut data = vec![0u8; data_len];
    r.read_exact(&mut data)?;
    if data_len % 2 == 1 {
        let mut pad = [0u8; 1];
        r.read_exact(&mut pad)?;
    }
    let mut key_count_buf = [0u8; 2];
    r.read_exact(&mut key_count_buf)?;
    let key_count = u16::from_le_bytes(key_count_buf);
    let mut keys = Vec::with_capacity(key_count as usize);
    for _ in 0..key_count {
        r.read_exact(&mut len_buf)?;
        let klen = u32::from_le_bytes(len_buf) as usize;
        let mut kbuf = vec![0u8; klen];
        r.read_exact(&mut kbuf)?;
        kbuf.pop(); // drop the null terminator
        if pad_even(klen) != klen {
            let mut pad = [0u8; 1];
            r.read_exact(&mut pad)?;
        }
        keys.push(kbuf);
    }
    Ok(Some(SortRecord { data, keys }))
}

/// Collect + spill + merge + extract pipeline (spec §4.10), scoped to
/// one process's sort work files `~QMS{pid}.{n}`.
pub struct ExternalSort {
    specs: Vec<KeySpec>,
    workdir: PathBuf,
    pid: u32,
    sortmem: u64,
    buffer: Vec<SortRecord>,
    buffered_bytes: u64,
    spill_files: Vec<PathBuf>,
    spill_counter: u32,
    sortmrg: usize,
}

impl ExternalSort {
    pub fn new(specs: Vec<KeySpec>, workdir: impl AsRef<Path>, pid: u32, sortmem: u64, sortmrg: usize) -> Result<ExternalSort, SortError> {
        if specs.len() > MAX_SORT_KEYS {
            return TooManyKeysSnafu { count: specs.len() }.fail();
        }
        Ok(ExternalSort {
            specs,
            workdir: workdir.as_ref().to_path_buf(),
            pid,
            sortmem: sortmem.max(1),
            buffer: Vec::new(),
            buffered_bytes: 0,
            spill_files: Vec::new(),
            spill_counter: 0,
            sortmrg: sortmrg.max(2),
        })
    }

    fn spill_path(&self, n: u32) -> PathBuf {
        self.workdir.join(format!("~QMS{}.{}", self.pid, n))
    }

    /// Collect phase: inserts `record`, flushing to a spill file once
    /// the buffered size exceeds `sortmem`.
    pub fn push(&mut self, record: SortRecord) -> Result<(), SortError> {
        self.buffered_bytes += record.approx_size() as u64;
        self.buffer.push(record);
        if self.buffered_bytes > self.sortmem {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SortError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort_by(|a, b| compare_records(a, b, &self.specs));
        suppress_unique_duplicates(&mut self.buffer, &self.specs);
        let path = self.spill_path(self.spill_counter);
        self.spill_counter += 1;
        let file = File::create(&path).map_err(|e| SortError::Io { reason: e.to_string() })?;
        let mut w = BufWriter::new(file);
        for rec in self.buffer.drain(..) {
            write_record(&mut w, &rec).map_err(|e| SortError::Io { reason: e.to_string() })?;
        }
        w.flush().map_err(|e| SortError::Io { reason: e.to_string() })?;
        self.spill_files.push(path);
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Merge phase: repeatedly k-way merges up to `sortmrg` files at a
    /// time until one remains, then returns a reader over the final
    /// sorted stream (spec §4.10). If nothing was ever spilled, sorts
    /// and returns the in-memory buffer directly.
    pub fn finish(mut self) -> Result<SortedStream, SortError> {
        if self.spill_files.is_empty() {
            self.buffer.sort_by(|a, b| compare_records(a, b, &self.specs));
            suppress_unique_duplicates(&mut self.buffer, &self.specs);
            return Ok(SortedStream::Memory { records: self.buffer.into_iter(), pid: self.pid, workdir: self.workdir });
        }
        self.flush()?;

        while self.spill_files.len() > 1 {
            let mut next_round = Vec::new();
            for batch in self.spill_files.chunks(self.sortmrg) {
                let merged_path = self.spill_path(self.spill_counter);
                self.spill_counter += 1;
                self.merge_batch(batch, &merged_path)?;
                next_round.push(merged_path);
            }
            for old in &self.spill_files {
                if !next_round.contains(old) {
                    let _ = fs::remove_file(old);
                }
            }
            self.spill_files = next_round;
        }

        let final_path = self.spill_files[0].clone();
        let file = File::open(&final_path).map_err(|e| SortError::Io { reason: e.to_string() })?;
        Ok(SortedStream::File { reader: BufReader::new(file), pid: self.pid, workdir: self.workdir })
    }

    fn merge_batch(&self, inputs: &[PathBuf], output: &Path) -> Result<(), SortError> {
        struct HeapItem {
            record: SortRecord,
            source: usize,
        }

        let mut readers: Vec<BufReader<File>> = inputs
            .iter()
            .map(|p| File::open(p).map(BufReader::new).map_err(|e| SortError::Io { reason: e.to_string() }))
            .collect::<Result<_, _>>()?;

        let out_file = File::create(output).map_err(|e| SortError::Io { reason: e.to_string() })?;
        let mut w = BufWriter::new(out_file);

        // BinaryHeap is a max-heap; wrap comparisons so the heap pops the
        // record that should come *next* in the merged output.
        struct Ranked<'a>(HeapItem, &'a [KeySpec]);
        impl<'a> PartialEq for Ranked<'a> {
            fn eq(&self, other: &Self) -> bool {
                compare_records(&self.0.record, &other.0.record, self.1) == Ordering::Equal
            }
        }
        impl<'a> Eq for Ranked<'a> {}
        impl<'a> PartialOrd for Ranked<'a> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        impl<'a> Ord for Ranked<'a> {
            fn cmp(&self, other: &Self) -> Ordering {
                // Reversed: BinaryHeap pops the greatest, we want the least.
                compare_records(&other.0.record, &self.0.record, self.1)
            }
        }

        let mut heap: BinaryHeap<Ranked> = BinaryHeap::new();
        for (i, reader) in readers.iter_mut().enumerate() {
            if let Some(rec) = read_record(reader).map_err(|e| SortError::Io { reason: e.to_string() })? {
                heap.push(Ranked(HeapItem { record: rec, source: i }, &self.specs));
            }
        }

        while let Some(Ranked(item, _)) = heap.pop() {
            write_record(&mut w, &item.record).map_err(|e| SortError::Io { reason: e.to_string() })?;
            if let Some(next) = read_record(&mut readers[item.source]).map_err(|e| SortError::Io { reason: e.to_string() })? {
                heap.push(Ranked(HeapItem { record: next, source: item.source }, &self.specs));
            }
        }
        w.flush().map_err(|e| SortError::Io { reason: e.to_string() })?;
        Ok(())
    }
}

/// Extract phase: the final sorted stream, read sequentially by the
/// consumer (spec §4.10).
pub enum SortedStream {
    Memory { records: std::vec::IntoIter<SortRecord>, pid: u32, workdir: PathBuf },
    File { reader: BufReader<File>, pid: u32, workdir: PathBuf },
}

impl Iterator for SortedStream {
    type Item = SortRecord;

    fn next(&mut self) -> Option<SortRecord> {
        match self {
            SortedStream::Memory { records, .. } => records.next(),
            SortedStream::File { reader, .. } => read_record(reader).ok().flatten(),
        }
    }
}

impl SortedStream {
    /// Cleanup: deletes every `~QMS{pid}.*` file left in `sortworkdir`
    /// (spec §4.10).
    pub fn cleanup(&self) {
        let (pid, workdir) = match self {
            SortedStream::Memory { pid, workdir, .. } => (*pid, workdir),
            SortedStream::File { pid, workdir, .. } => (*pid, workdir),
        };
        if let Ok(entries) = fs::read_dir(workdir) {
            let prefix = format!("~QMS{pid}.");
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with(&prefix) {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_dir::TempDir;

    fn rec(key: &str, data: &str) -> SortRecord {
        SortRecord { data: data.as_bytes().to_vec(), keys: vec![key.as_bytes().to_vec()] }
    }

    #[test]
    fn in_memory_sort_orders_numeric_keys_numerically_when_right_justified() {
        let dir = TempDir::new().unwrap();
        let mut sorter = ExternalSort::new(vec![KeySpec { flags: KeyFlags::RIGHT_JUSTIFIED }], dir.path(), 1, 1_000_000, 4).unwrap();
        sorter.push(rec("10", "ten")).unwrap();
        sorter.push(rec("2", "two")).unwrap();
        sorter.push(rec("33", "thirty-three")).unwrap();
        let out: Vec<_> = sorter.finish().unwrap().collect();
        assert_eq!(out.iter().map(|r| r.data.clone()).collect::<Vec<_>>(), vec![b"two".to_vec(), b"ten".to_vec(), b"thirty-three".to_vec()]);
    }

    #[test]
    fn left_justified_key_sorts_as_plain_bytes_not_numerically() {
        let dir = TempDir::new().unwrap();
        let mut sorter = ExternalSort::new(vec![KeySpec { flags: KeyFlags::empty() }], dir.path(), 1, 1_000_000, 4).unwrap();
        sorter.push(rec("10", "ten")).unwrap();
        sorter.push(rec("2", "two")).unwrap();
        sorter.push(rec("33", "thirty-three")).unwrap();
        let out: Vec<_> = sorter.finish().unwrap().collect();
        // Plain byte order: "10" < "2" < "33".
        assert_eq!(out.iter().map(|r| r.data.clone()).collect::<Vec<_>>(), vec![b"ten".to_vec(), b"two".to_vec(), b"thirty-three".to_vec()]);
    }

    #[test]
    fn unique_key_suppresses_later_duplicate() {
        let dir = TempDir::new().unwrap();
        let mut sorter = ExternalSort::new(vec![KeySpec { flags: KeyFlags::UNIQUE }], dir.path(), 1, 1_000_000, 4).unwrap();
        sorter.push(rec("A", "first")).unwrap();
        sorter.push(rec("A", "second")).unwrap();
        sorter.push(rec("B", "third")).unwrap();
        let out: Vec<_> = sorter.finish().unwrap().collect();
        assert_eq!(out.iter().map(|r| r.data.clone()).collect::<Vec<_>>(), vec![b"first".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn spill_and_merge_round_trips_sorted_order() {
        let dir = TempDir::new().unwrap();
        let mut sorter = ExternalSort::new(vec![KeySpec { flags: KeyFlags::empty() }], dir.path(), 42, 40, 2).unwrap();
        for i in (0..20).rev() {
            sorter.push(rec(&format!("{i:03}"), &format!("rec{i}"))).unwrap();
        }
        let stream = sorter.finish().unwrap();
        let out: Vec<_> = stream.collect();
        let datas: Vec<String> = out.iter().map(|r| String::from_utf8(r.data.clone()).unwrap()).collect();
        let expected: Vec<String> = (0..20).map(|i| format!("rec{i}")).collect();
        assert_eq!(datas, expected);
    }

    #[test]
    fn cleanup_removes_spill_files() {
        let dir = TempDir::new().unwrap();
        let mut sorter = ExternalSort::new(vec![KeySpec { flags: KeyFlags::empty() }], dir.path(), 7, 10, 2).unwrap();
        for i in 0..10 {
            sorter.push(rec(&format!("{i}"), "x")).unwrap();
        }
        let stream = sorter.finish().unwrap();
        stream.cleanup();
        let remaining: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn too_many_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let specs = vec![KeySpec { flags: KeyFlags::empty() }; MAX_SORT_KEYS + 1];
        assert!(matches!(ExternalSort::new(specs, dir.path(), 1, 1024, 4), Err(SortError::TooManyKeys { .. })));
    }
}
