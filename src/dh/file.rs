//! `dh_open`/`dh_read`/`dh_write`/`dh_delete` entry points (spec §4.4).
//!
//! `FileVar` is the per-process, per-open-file handle: a live `DhHeader`,
//! the primary and overflow subfile handles, and whichever AK subfiles
//! `ak_map` marks present. `FileTable` is the process-local registry
//! `dh_open` consults to avoid reopening a file this process already has
//! open (spec: "scan of the per-process DH_FILE chain").

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::cell::RefCell;

use tracing::instrument;

use crate::cache::RecordCache;
use crate::error::{DhError, FileNotFoundSnafu, IdLengthExceededSnafu, RecordNotFoundSnafu, TrustedAccessDeniedSnafu};
use crate::lock::LockManager;
use crate::sysseg::SysSeg;

use super::ak::{AkHeader, AkSubfile};
use super::bigrec::{gather_chain, split_chain, BigRecBlock};
use super::group::{DhBlock, PackedRecord, RecordFlags};
use super::hash::hash_group;
use super::header::{DhHeader, AK_BASE_SUBFILE, MAX_AK};

/// Maximum supported on-disk format version this build understands
/// (spec §4.4 "version <= supported").
pub const MAX_SUPPORTED_VERSION: u16 = super::header::DH_VERSION;

fn subfile_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("~{index}"))
}

/// A single open DH file (spec §4.4's `DH_FILE`). The AK array is sized
/// `AK_BASE_SUBFILE + max_ak + 1` per spec, indexed by AK index.
pub struct FileVar {
    pub dir: PathBuf,
    pub header: DhHeader,
    primary: File,
    overflow: File,
    aks: Vec<Option<AkSubfile>>,
    pub open_count: u32,
    pub trusted_caller: bool,
    /// This file's slot in the shared system segment's `FILE_ENTRY`
    /// table (spec §3.4), used to key the record cache and bump
    /// `upd_ct` on every successful write/delete.
    pub file_id: u16,
}

impl FileVar {
    fn block_size(&self) -> u64 {
        self.header.group_block_bytes() as u64
    }

    fn primary_block_offset(&self, group: u32) -> u64 {
        super::header::HEADER_BLOCK_SIZE as u64 + group as u64 * self.block_size()
    }

    fn overflow_block_offset(&self, block_no: u32) -> u64 {
        (block_no as u64 - 1) * self.block_size()
    }

    fn read_primary_block(&mut self, group: u32) -> Result<DhBlock, DhError> {
        let off = self.primary_block_offset(group);
        self.primary.seek(SeekFrom::Start(off))?;
        let mut buf = vec![0u8; self.block_size() as usize];
        let n = self.primary.read(&mut buf)?;
        if n == 0 {
            return Ok(DhBlock::empty(self.block_size() as u32));
        }
        let block = decode_block(&buf, self.block_size() as u32);
        block.validate()?;
        Ok(block)
    }

    fn write_primary_block(&mut self, group: u32, block: &DhBlock) -> Result<(), DhError> {
        let off = self.primary_block_offset(group);
        self.primary.seek(SeekFrom::Start(off))?;
        self.primary.write_all(&block.to_bytes())?;
        Ok(())
    }

    fn read_overflow_block(&mut self, block_no: u32) -> Result<DhBlock, DhError> {
        let off = self.overflow_block_offset(block_no);
        self.overflow.seek(SeekFrom::Start(off))?;
        let mut buf = vec![0u8; self.block_size() as usize];
        self.overflow.read_exact(&mut buf)?;
        let block = decode_block(&buf, self.block_size() as u32);
        block.validate()?;
        Ok(block)
    }

    fn write_overflow_block(&mut self, block_no: u32, block: &DhBlock) -> Result<(), DhError> {
        let off = self.overflow_block_offset(block_no);
        self.overflow.seek(SeekFrom::Start(off))?;
        self.overflow.write_all(&block.to_bytes())?;
        Ok(())
    }

    fn alloc_overflow_block(&mut self) -> Result<u32, DhError> {
        if self.header.params.free_chain != 0 {
            let free_no = self.header.params.free_chain;
            let freed = self.read_overflow_block(free_no)?;
            self.header.params.free_chain = freed.next_overflow;
            return Ok(free_no);
        }
        let len = self.overflow.metadata()?.len();
        let next_no = (len / self.block_size()) as u32 + 1;
        Ok(next_no)
    }

    fn free_overflow_block(&mut self, block_no: u32) -> Result<(), DhError> {
        let mut block = DhBlock::empty(self.block_size() as u32);
        block.next_overflow = self.header.params.free_chain;
        self.write_overflow_block(block_no, &block)?;
        self.header.params.free_chain = block_no;
        Ok(())
    }

    fn read_bigrec_block(&mut self, block_no: u32) -> Result<BigRecBlock, DhError> {
        let off = self.overflow_block_offset(block_no);
        self.overflow.seek(SeekFrom::Start(off))?;
        let mut buf = vec![0u8; self.block_size() as usize];
        self.overflow.read_exact(&mut buf)?;
        Ok(BigRecBlock::from_bytes(&buf))
    }

    fn write_bigrec_chain(&mut self, data: &[u8]) -> Result<u32, DhError> {
        let payload_cap = self.block_size() as usize - BigRecBlock::HEADER_LEN;
        let mut blocks = split_chain(data, payload_cap);
        let mut block_nos = Vec::with_capacity(blocks.len());
        for _ in &blocks {
            block_nos.push(self.alloc_overflow_block()?);
        }
        for (i, block) in blocks.iter_mut().enumerate() {
            block.next = *block_nos.get(i + 1).unwrap_or(&0);
        }
        for (block, block_no) in blocks.iter().zip(&block_nos) {
            let off = self.overflow_block_offset(*block_no);
            self.overflow.seek(SeekFrom::Start(off))?;
            self.overflow.write_all(&block.to_bytes(self.block_size() as usize))?;
        }
        Ok(block_nos[0])
    }

    fn free_bigrec_chain(&mut self, start: u32) -> Result<(), DhError> {
        let mut block_no = start;
        while block_no != 0 {
            let block = self.read_bigrec_block(block_no)?;
            let next = block.next;
            self.free_overflow_block(block_no)?;
            block_no = next;
        }
        Ok(())
    }

    /// `dh_read` (spec §4.4, §2 data flow): acquires a group read lock,
    /// consults the record cache (validated against the shared segment's
    /// live `upd_ct`) before touching disk, and inserts the result into
    /// the cache on a miss. `canonical_id_out`, when set, receives the id
    /// exactly as stored (for case-insensitive files where the caller's
    /// id may differ in case).
    #[instrument(skip(self, canonical_id_out, sysseg, locks, cache), fields(file_id = self.file_id))]
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &mut self,
        id: &[u8],
        canonical_id_out: Option<&mut Vec<u8>>,
        sysseg: &SysSeg,
        locks: &LockManager,
        cache: &RecordCache,
        uid: u32,
        txn_id: u64,
    ) -> Result<Vec<u8>, DhError> {
        let nocase = self.header.is_nocase();
        let group = hash_group(id, &self.header.params, nocase);

        locks.acquire_group_read(self.file_id, group, uid, txn_id)?;
        let current_upd_ct = sysseg.upd_ct(self.file_id);
        let cached = current_upd_ct.as_ref().ok().and_then(|&ct| cache.get(self.file_id, id, ct));
        if let Some(data) = cached {
            locks.release_group(self.file_id, group, uid);
            trace!(file_id = self.file_id, "dh read served from record cache");
            return Ok(data);
        }

        let result = self.read_from_disk(id, canonical_id_out, group);
        locks.release_group(self.file_id, group, uid);
        let data = result?;
        if let Ok(ct) = current_upd_ct {
            cache.insert(self.file_id, id, ct, &data);
        }
        Ok(data)
    }

    fn read_from_disk(&mut self, id: &[u8], canonical_id_out: Option<&mut Vec<u8>>, group: u32) -> Result<Vec<u8>, DhError> {
        let nocase = self.header.is_nocase();
        let mut block = self.read_primary_block(group)?;
        loop {
            if let Some(rec) = block.find(id, nocase) {
                if let Some(out) = canonical_id_out {
                    *out = rec.id.clone();
                }
                self.header.stats_reads += 1;
                return if rec.is_big() {
                    let start = rec.big_rec_start;
                    Ok(gather_chain(start, |n| self.read_bigrec_block(n).unwrap_or(BigRecBlock { total_len: 0, next: 0, data: Vec::new() })))
                } else {
                    Ok(rec.inline_data.clone())
                };
            }
            if block.next_overflow == 0 {
                return RecordNotFoundSnafu.fail();
            }
            block = self.read_overflow_block(block.next_overflow)?;
        }
    }

    /// `dh_write` (spec §4.4, §2 data flow, §5): acquires a group update
    /// lock, inserts or replaces `id`'s record (routing through the
    /// big-record chain when `data` exceeds `big_rec_size`), then bumps
    /// the shared segment's `upd_ct` for this file and refreshes the
    /// record cache so subsequent reads see the new payload under the
    /// new counter (spec §8 invariant #3: "after any successful write/
    /// delete the value of `upd_ct` strictly increases"). `ak_updates`
    /// carries the per-AK-index key to (re)index, already evaluated by
    /// the caller's I-type interpreter (an external collaborator per
    /// spec §1).
    #[instrument(skip(self, data, ak_updates, sysseg, locks, cache), fields(file_id = self.file_id))]
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        id: &[u8],
        data: &[u8],
        ak_updates: &[(u8, Vec<u8>)],
        sysseg: &SysSeg,
        locks: &LockManager,
        cache: &RecordCache,
        uid: u32,
        txn_id: u64,
    ) -> Result<(), DhError> {
        if id.len() > self.header.params.longest_id.max(255) as usize {
            return IdLengthExceededSnafu { len: id.len(), max: self.header.params.longest_id as usize }.fail();
        }
        let nocase = self.header.is_nocase();
        let group = hash_group(id, &self.header.params, nocase);

        locks.acquire_group_update(self.file_id, group, uid, txn_id)?;
        let result = self.write_to_disk(id, data, ak_updates, group);
        locks.release_group(self.file_id, group, uid);
        result?;

        let new_upd_ct = sysseg.bump_upd_ct(self.file_id)?;
        cache.insert(self.file_id, id, new_upd_ct, data);
        debug!(file_id = self.file_id, upd_ct = new_upd_ct, "dh write committed to disk");
        Ok(())
    }

    fn write_to_disk(&mut self, id: &[u8], data: &[u8], ak_updates: &[(u8, Vec<u8>)], group: u32) -> Result<(), DhError> {
        let nocase = self.header.is_nocase();
        let mut is_insert = true;

        // Reclaim the old record's space, including its big-record chain,
        // if this is a replace (spec §4.4 "Write").
        let mut chain_group = group;
        let mut chain_is_primary = true;
        loop {
            let mut cur = if chain_is_primary { self.read_primary_block(chain_group)? } else { self.read_overflow_block(chain_group)? };
            if let Some(existing) = cur.find(id, nocase) {
                is_insert = false;
                if existing.is_big() {
                    self.free_bigrec_chain(existing.big_rec_start)?;
                }
                cur.remove_id(id, nocase);
                if chain_is_primary {
                    self.write_primary_block(chain_group, &cur)?;
                } else {
                    self.write_overflow_block(chain_group, &cur)?;
                }
                break;
            }
            if cur.next_overflow == 0 {
                break;
            }
            chain_group = cur.next_overflow;
            chain_is_primary = false;
        }

        let record = if data.len() as u32 > self.header.params.big_rec_size {
            let start = self.write_bigrec_chain(data)?;
            PackedRecord { id: id.to_vec(), flags: RecordFlags::BIG_REC, inline_data: Vec::new(), big_rec_start: start }
        } else {
            PackedRecord { id: id.to_vec(), flags: RecordFlags::empty(), inline_data: data.to_vec(), big_rec_start: 0 }
        };

        self.insert_record(group, record)?;

        self.header.stats_writes += 1;
        if is_insert {
            self.header.record_count += 1;
        }
        for (index, key) in ak_updates {
            self.update_ak_subfile(*index, |ak| ak.insert(key, id));
        }
        Ok(())
    }

    /// Mutates the AK subfile at `index` (if present) and persists it to
    /// `~{index+2}` immediately (spec §3.3: AK subfiles are physical
    /// files kept in sync with the primary, not purely in-memory state).
    fn update_ak_subfile(&mut self, index: u8, mutate: impl FnOnce(&mut AkSubfile)) {
        let ak_index = AK_BASE_SUBFILE + index as usize;
        let bytes = if let Some(Some(ak)) = self.aks.get_mut(ak_index) {
            mutate(ak);
            Some(ak.to_bytes())
        } else {
            None
        };
        if let Some(bytes) = bytes {
            if let Err(err) = std::fs::write(subfile_path(&self.dir, ak_index), bytes) {
                warn!(ak_index, error = %err, "failed to persist AK subfile");
            }
        }
    }

    fn insert_record(&mut self, group: u32, record: PackedRecord) -> Result<(), DhError> {
        let mut block = self.read_primary_block(group)?;
        if block.push(record.clone()) {
            self.write_primary_block(group, &block)?;
            return Ok(());
        }
        // Walk the overflow chain looking for room; append a new overflow
        // block if none has space (spec §4.4 "If the group would overflow,
        // append an overflow block").
        let mut chain_group = group;
        let mut chain_is_primary = true;
        loop {
            let mut cur = if chain_is_primary { self.read_primary_block(chain_group)? } else { self.read_overflow_block(chain_group)? };
            if cur.next_overflow == 0 {
                let new_block_no = self.alloc_overflow_block()?;
                let mut new_block = DhBlock::empty(self.block_size() as u32);
                new_block.push(record);
                self.write_overflow_block(new_block_no, &new_block)?;
                cur.next_overflow = new_block_no;
                if chain_is_primary {
                    self.write_primary_block(chain_group, &cur)?;
                } else {
                    self.write_overflow_block(chain_group, &cur)?;
                }
                return Ok(());
            }
            let next = cur.next_overflow;
            let mut next_block = self.read_overflow_block(next)?;
            if next_block.push(record.clone()) {
                self.write_overflow_block(next, &next_block)?;
                return Ok(());
            }
            chain_group = next;
            chain_is_primary = false;
        }
    }

    /// `dh_delete` (spec §4.4, §2 data flow, §5): symmetric to [`write`],
    /// acquiring a group update lock, reclaiming the record's space and
    /// any big-record blocks, then bumping `upd_ct` and invalidating the
    /// record cache so a subsequent read can't see the deleted payload.
    #[instrument(skip(self, ak_updates, sysseg, locks, cache), fields(file_id = self.file_id))]
    #[allow(clippy::too_many_arguments)]
    pub fn delete(
        &mut self,
        id: &[u8],
        ak_updates: &[(u8, Vec<u8>)],
        sysseg: &SysSeg,
        locks: &LockManager,
        cache: &RecordCache,
        uid: u32,
        txn_id: u64,
    ) -> Result<(), DhError> {
        let nocase = self.header.is_nocase();
        let group = hash_group(id, &self.header.params, nocase);

        locks.acquire_group_update(self.file_id, group, uid, txn_id)?;
        let result = self.delete_from_disk(id, ak_updates, group);
        locks.release_group(self.file_id, group, uid);
        result?;

        let new_upd_ct = sysseg.bump_upd_ct(self.file_id)?;
        cache.invalidate_record(self.file_id, id);
        debug!(file_id = self.file_id, upd_ct = new_upd_ct, "dh delete committed to disk");
        Ok(())
    }

    fn delete_from_disk(&mut self, id: &[u8], ak_updates: &[(u8, Vec<u8>)], group: u32) -> Result<(), DhError> {
        let nocase = self.header.is_nocase();
        let mut chain_group = group;
        let mut chain_is_primary = true;
        loop {
            let mut cur = if chain_is_primary { self.read_primary_block(chain_group)? } else { self.read_overflow_block(chain_group)? };
            if let Some(removed) = cur.remove_id(id, nocase) {
                if removed.is_big() {
                    self.free_bigrec_chain(removed.big_rec_start)?;
                }
                if chain_is_primary {
                    self.write_primary_block(chain_group, &cur)?;
                } else {
                    self.write_overflow_block(chain_group, &cur)?;
                }
                self.header.record_count = self.header.record_count.saturating_sub(1);
                for (index, key) in ak_updates {
                    self.update_ak_subfile(*index, |ak| ak.remove(key, id));
                }
                return Ok(());
            }
            if cur.next_overflow == 0 {
                return RecordNotFoundSnafu.fail();
            }
            chain_group = cur.next_overflow;
            chain_is_primary = false;
        }
    }

    pub fn ak_subfile(&self, index: u8) -> Option<&AkSubfile> {
        self.aks.get(AK_BASE_SUBFILE + index as usize)?.as_ref()
    }

    pub fn ak_subfile_mut(&mut self, index: u8) -> Option<&mut AkSubfile> {
        self.aks.get_mut(AK_BASE_SUBFILE + index as usize)?.as_mut()
    }
}

fn decode_block(buf: &[u8], capacity: u32) -> DhBlock {
    let used_bytes = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let next_overflow = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let mut records = Vec::new();
    let mut offset = 8usize;
    while (offset as u32) < used_bytes && offset + 5 <= buf.len() {
        let _next = u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap());
        let id_len = u16::from_le_bytes(buf[offset + 2..offset + 4].try_into().unwrap()) as usize;
        let flags = RecordFlags::from_bits_truncate(buf[offset + 4]);
        let mut pos = offset + 5;
        let id = buf[pos..pos + id_len].to_vec();
        pos += id_len;
        let (inline_data, big_rec_start, consumed) = if flags.contains(RecordFlags::BIG_REC) {
            let start = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            (Vec::new(), start, 4)
        } else {
            // Inline data runs to the next record's offset (_next) or, for
            // the last record, to used_bytes.
            let end = if _next != 0 { _next as usize } else { used_bytes as usize };
            let data = buf[pos..end.min(buf.len())].to_vec();
            let len = data.len();
            (data, 0, len)
        };
        records.push(PackedRecord { id, flags, inline_data, big_rec_start });
        offset = pos + consumed;
    }
    DhBlock { used_bytes, next_overflow, records, capacity }
}

/// Process-local registry of open DH files (spec §4.4 "per-process
/// DH_FILE chain"), keyed by `(device, inode)` so two paths naming the
/// same file share one `FileVar`.
#[derive(Default)]
pub struct FileTable {
    open: HashMap<(u64, u64), Rc<RefCell<FileVar>>>,
}

impl FileTable {
    pub fn new() -> FileTable {
        FileTable::default()
    }

    /// `dh_open` (spec §4.4). `sysseg` supplies this file's `file_id` via
    /// `get_file_entry` (spec §4.3), the key the record cache and
    /// `upd_ct` bumps use.
    pub fn open(&mut self, dir: impl AsRef<Path>, read_write: bool, trusted_caller: bool, sysseg: &SysSeg) -> Result<Rc<RefCell<FileVar>>, DhError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return FileNotFoundSnafu { path: dir.display().to_string() }.fail();
        }
        let primary_path = subfile_path(dir, 0);
        let meta = std::fs::metadata(&primary_path)?;
        let (device, inode) = file_identity(&meta);
        if let Some(existing) = self.open.get(&(device, inode)) {
            existing.borrow_mut().open_count += 1;
            return Ok(Rc::clone(existing));
        }

        let mut primary = OpenOptions::new().read(true).write(read_write).open(&primary_path)?;
        let header = read_header(&mut primary)?;
        header.validate(MAX_SUPPORTED_VERSION)?;
        if header.is_trusted() && !trusted_caller {
            return TrustedAccessDeniedSnafu.fail();
        }

        let overflow_path = subfile_path(dir, 1);
        let overflow = OpenOptions::new().read(true).write(read_write).create(true).open(&overflow_path)?;

        let mut aks: Vec<Option<AkSubfile>> = (0..AK_BASE_SUBFILE + MAX_AK as usize + 1).map(|_| None).collect();
        for index in 0..MAX_AK {
            if header.has_ak(index) {
                let ak_index = AK_BASE_SUBFILE + index as usize;
                let ak_path = subfile_path(dir, ak_index);
                // Load the AK name/field/flags/I-type from the existing
                // subfile (spec §4.4 `dh_open`) rather than discarding
                // previously-indexed entries on every reopen.
                let ak = match std::fs::read(&ak_path) {
                    Ok(bytes) if !bytes.is_empty() => AkSubfile::from_bytes(&bytes)?,
                    _ => AkSubfile::new(AkHeader {
                        index,
                        name: format!("AK{index}"),
                        itype_source: String::new(),
                        flags: super::ak::AkFlags::empty(),
                        data_creation_timestamp: header.creation_timestamp,
                    }),
                };
                ak.header.cross_check(header.creation_timestamp)?;
                aks[ak_index] = Some(ak);
            }
        }

        let pathname = dir.display().to_string();
        let file_id = sysseg.get_file_entry(&pathname, device, inode)?;

        let file_var = Rc::new(RefCell::new(FileVar {
            dir: dir.to_path_buf(),
            header,
            primary,
            overflow,
            aks,
            open_count: 1,
            trusted_caller,
            file_id,
        }));
        self.open.insert((device, inode), Rc::clone(&file_var));
        Ok(file_var)
    }

    /// Creates a brand-new DH file directory with an empty primary and
    /// overflow subfile, then opens it.
    pub fn create(&mut self, dir: impl AsRef<Path>, group_size: u8, nocase: bool, sysseg: &SysSeg) -> Result<Rc<RefCell<FileVar>>, DhError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let header = DhHeader::new(group_size, nocase);
        let mut primary = File::create(subfile_path(dir, 0))?;
        primary.write_all(&header.to_bytes())?;
        let block = DhBlock::empty(header.group_block_bytes() as u32);
        primary.write_all(&block.to_bytes())?;
        File::create(subfile_path(dir, 1))?;
        drop(primary);
        self.open(dir, true, true, sysseg)
    }
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn file_identity(meta: &std::fs::Metadata) -> (u64, u64) {
    (0, meta.len())
}

fn read_header(primary: &mut File) -> Result<DhHeader, DhError> {
    primary.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; super::header::HEADER_BLOCK_SIZE];
    primary.read_exact(&mut buf)?;
    decode_header(&buf)
}

fn decode_header(buf: &[u8]) -> Result<DhHeader, DhError> {
    use super::header::{DhFlags, DhParams};
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    let group_size = buf[6];
    let ak_map = u32::from_le_bytes(buf[7..11].try_into().unwrap());
    let modulus = u32::from_le_bytes(buf[11..15].try_into().unwrap());
    let min_modulus = u32::from_le_bytes(buf[15..19].try_into().unwrap());
    let big_rec_size = u32::from_le_bytes(buf[19..23].try_into().unwrap());
    let split_load = buf[23];
    let merge_load = buf[24];
    let load_bytes = u64::from_le_bytes(buf[25..33].try_into().unwrap());
    let mod_value = u32::from_le_bytes(buf[33..37].try_into().unwrap());
    let longest_id = u16::from_le_bytes(buf[37..39].try_into().unwrap());
    let free_chain = u32::from_le_bytes(buf[39..43].try_into().unwrap());
    let record_count = u64::from_le_bytes(buf[43..51].try_into().unwrap());
    let flags_bits = u16::from_le_bytes(buf[51..53].try_into().unwrap());
    let creation_timestamp = u64::from_le_bytes(buf[53..61].try_into().unwrap());
    let trigger_modes = buf[61];
    let stats_reads = u64::from_le_bytes(buf[62..70].try_into().unwrap());
    let stats_writes = u64::from_le_bytes(buf[70..78].try_into().unwrap());

    Ok(DhHeader {
        magic,
        version,
        group_size,
        ak_map,
        params: DhParams { modulus, min_modulus, big_rec_size, split_load, merge_load, load_bytes, mod_value, longest_id, free_chain },
        record_count,
        flags: DhFlags::from_bits_truncate(flags_bits),
        creation_timestamp,
        trigger_name: None,
        trigger_modes,
        akpath: None,
        stats_reads,
        stats_writes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_dir::TempDir;

    /// Bundles the collaborators every `FileVar::read`/`write`/`delete`
    /// call now needs, so tests don't repeat this setup per case.
    struct Fixture {
        _seg_dir: TempDir,
        sysseg: SysSeg,
        locks: LockManager,
        cache: RecordCache,
    }

    impl Fixture {
        fn new() -> Fixture {
            let seg_dir = TempDir::new().unwrap();
            let sysseg = SysSeg::create(seg_dir.path(), 16, 64, 4, 63).unwrap();
            Fixture { _seg_dir: seg_dir, sysseg, locks: LockManager::new(64, false), cache: RecordCache::new(4) }
        }
    }

    const UID: u32 = 1;
    const TXN: u64 = 0;

    #[test]
    fn create_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new();
        let mut table = FileTable::new();
        let fv = table.create(dir.path().join("CUSTOMERS"), 1, false, &fx.sysseg).unwrap();
        fv.borrow_mut().write(b"CUST1", b"hello world", &[], &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        let data = fv.borrow_mut().read(b"CUST1", None, &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn replace_reclaims_old_record() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new();
        let mut table = FileTable::new();
        let fv = table.create(dir.path().join("CUSTOMERS"), 1, false, &fx.sysseg).unwrap();
        fv.borrow_mut().write(b"CUST1", b"version one", &[], &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        fv.borrow_mut().write(b"CUST1", b"version two, a bit longer", &[], &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        let data = fv.borrow_mut().read(b"CUST1", None, &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        assert_eq!(data, b"version two, a bit longer");
        assert_eq!(fv.borrow().header.record_count, 1);
    }

    #[test]
    fn delete_then_read_fails() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new();
        let mut table = FileTable::new();
        let fv = table.create(dir.path().join("CUSTOMERS"), 1, false, &fx.sysseg).unwrap();
        fv.borrow_mut().write(b"CUST1", b"data", &[], &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        fv.borrow_mut().delete(b"CUST1", &[], &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        assert!(matches!(
            fv.borrow_mut().read(b"CUST1", None, &fx.sysseg, &fx.locks, &fx.cache, UID, TXN),
            Err(DhError::RecordNotFound)
        ));
    }

    #[test]
    fn big_record_round_trips_through_overflow_chain() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new();
        let mut table = FileTable::new();
        let fv = table.create(dir.path().join("BIGFILE"), 1, false, &fx.sysseg).unwrap();
        fv.borrow_mut().header.params.big_rec_size = 100;
        let big_data: Vec<u8> = (0..5000u32).map(|v| (v % 251) as u8).collect();
        fv.borrow_mut().write(b"BIG1", &big_data, &[], &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        let read_back = fv.borrow_mut().read(b"BIG1", None, &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        assert_eq!(read_back, big_data);
    }

    #[test]
    fn reopening_same_path_bumps_open_count() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new();
        let mut table = FileTable::new();
        let path = dir.path().join("CUSTOMERS");
        let fv1 = table.create(path.clone(), 1, false, &fx.sysseg).unwrap();
        let fv2 = table.open(&path, true, true, &fx.sysseg).unwrap();
        assert!(Rc::ptr_eq(&fv1, &fv2));
        assert_eq!(fv2.borrow().open_count, 2);
    }

    #[test]
    fn write_bumps_upd_ct_and_serves_cached_read() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new();
        let mut table = FileTable::new();
        let fv = table.create(dir.path().join("CUSTOMERS"), 1, false, &fx.sysseg).unwrap();
        let file_id = fv.borrow().file_id;
        let before = fx.sysseg.upd_ct(file_id).unwrap();
        fv.borrow_mut().write(b"CUST1", b"hello", &[], &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        let after = fx.sysseg.upd_ct(file_id).unwrap();
        assert!(after > before);
        // Second read should be served from cache at the same upd_ct.
        let first = fv.borrow_mut().read(b"CUST1", None, &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        let second = fv.borrow_mut().read(b"CUST1", None, &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ak_entries_survive_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new();
        let path = dir.path().join("CUSTOMERS");
        std::fs::create_dir_all(&path).unwrap();
        let mut header = DhHeader::new(1, false);
        header.set_ak(0, true);
        let mut primary = File::create(subfile_path(&path, 0)).unwrap();
        primary.write_all(&header.to_bytes()).unwrap();
        let block = DhBlock::empty(header.group_block_bytes() as u32);
        primary.write_all(&block.to_bytes()).unwrap();
        File::create(subfile_path(&path, 1)).unwrap();
        drop(primary);

        let mut table = FileTable::new();
        let fv = table.open(&path, true, true, &fx.sysseg).unwrap();
        fv.borrow_mut().write(b"CUST1", b"hello", &[(0, b"smith".to_vec())], &fx.sysseg, &fx.locks, &fx.cache, UID, TXN).unwrap();

        let mut table2 = FileTable::new();
        let fv2 = table2.open(&path, true, true, &fx.sysseg).unwrap();
        let restored = fv2.borrow().ak_subfile(0).unwrap().lookup(b"smith").to_vec();
        assert_eq!(restored, vec![b"CUST1".to_vec()]);
    }
}
