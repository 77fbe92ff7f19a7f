//! Object-code cache (spec §4.9): an LRU of loaded, compiled programs
//! keyed by name, evicted by a memory budget and an item-count cap
//! rather than pure recency, plus an optional hot-spot time monitor.

use std::collections::HashMap;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::DhError;

bitflags! {
    /// `OBJECT_HEADER.flags` (`original_source/gplsrc/header.h`).
    #[derive(Default)]
    pub struct HeaderFlags: u16 {
        const IS_CPROC       = 0x0001;
        const INTERNAL       = 0x0002;
        const DEBUG          = 0x0004;
        const IS_DEBUGGER    = 0x0008;
        const NOCASE         = 0x0010;
        const IS_FUNCTION    = 0x0020;
        const VAR_ARGS       = 0x0040;
        const RECURSIVE      = 0x0080;
        const ITYPE          = 0x0100;
        const ALLOW_BREAK    = 0x0200;
        const IS_TRUSTED     = 0x0400;
        const NETFILES       = 0x0800;
        const CASE_SENSITIVE = 0x1000;
        const QMCALL_ALLOWED = 0x2000;
        const CTYPE          = 0x4000;
        const IS_CLASS       = 0x8000;
    }
}

pub const HDR_MAGIC: u8 = 0x64;
pub const HDR_MAGIC_INVERSE: u8 = 0x65;

/// `OBJECT_HEADER` (`header.h`): the compiled program's fixed leading
/// block.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub magic: u8,
    pub rev: u8,
    pub id: i32,
    pub start_offset: i32,
    pub args: i16,
    pub no_vars: i16,
    pub stack_depth: i16,
    pub sym_tab_offset: i32,
    pub line_tab_offset: i32,
    pub object_size: i32,
    pub flags: HeaderFlags,
    pub compile_time: i32,
    pub program_name: String,
}

impl ObjectHeader {
    /// Byte-swaps every multi-byte field (`convert_object_header` in
    /// `header.h`) when the magic byte comes in inverted, meaning the
    /// object was compiled on a host of the opposite endianness.
    pub fn byte_swap(&mut self) {
        self.magic = if self.magic == HDR_MAGIC_INVERSE { HDR_MAGIC } else { self.magic };
        self.id = self.id.swap_bytes();
        self.start_offset = self.start_offset.swap_bytes();
        self.args = self.args.swap_bytes();
        self.no_vars = self.no_vars.swap_bytes();
        self.stack_depth = self.stack_depth.swap_bytes();
        self.sym_tab_offset = self.sym_tab_offset.swap_bytes();
        self.line_tab_offset = self.line_tab_offset.swap_bytes();
        self.object_size = self.object_size.swap_bytes();
        self.flags = HeaderFlags::from_bits_truncate(self.flags.bits().swap_bytes());
        self.compile_time = self.compile_time.swap_bytes();
    }

    pub fn needs_byte_swap(&self) -> bool {
        self.magic == HDR_MAGIC_INVERSE
    }
}

/// One cached compiled program (spec §4.9).
#[derive(Debug, Clone)]
pub struct CachedObject {
    pub header: ObjectHeader,
    pub bytecode: Vec<u8>,
    pub active_refs: u32,
    pub call_count: u64,
    pub cpu_time: Duration,
    pub invalid: bool,
    pub globally_catalogued: bool,
}

impl CachedObject {
    fn size(&self) -> u64 {
        self.header.object_size.max(0) as u64
    }
}

/// The LRU chain itself; front = most recently used.
struct Lru {
    entries: Vec<(String, CachedObject)>,
}

impl Lru {
    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    fn touch(&mut self, pos: usize) {
        let entry = self.entries.remove(pos);
        self.entries.insert(0, entry);
    }
}

/// Object-code cache (spec §4.9), budgeted by total bytes (`objmem`,
/// §6) and item count (`objects`, §6).
pub struct ObjectCache {
    lru: Lru,
    objmem_budget: u64,
    objects_cap: u32,
    total_bytes: u64,
    /// Per-program accumulated CPU time, only populated when the
    /// hot-spot monitor is enabled (§4.9 addendum).
    hot_spots: Option<HashMap<String, Duration>>,
}

impl ObjectCache {
    pub fn new(objmem_budget: u64, objects_cap: u32, hot_spot_monitor: bool) -> ObjectCache {
        ObjectCache {
            lru: Lru { entries: Vec::new() },
            objmem_budget,
            objects_cap,
            total_bytes: 0,
            hot_spots: hot_spot_monitor.then(HashMap::new),
        }
    }

    /// Looks up `name`, skipping (and not touching the recency order of)
    /// entries marked `invalid` by an account switch (§4.9 "lookup skips
    /// invalid entries").
    pub fn get(&mut self, name: &str) -> Option<&CachedObject> {
        let pos = self.lru.entries.iter().position(|(n, obj)| n == name && !obj.invalid)?;
        self.lru.touch(pos);
        self.lru.entries.first().map(|(_, obj)| obj)
    }

    pub fn insert(&mut self, name: String, object: CachedObject) {
        if let Some(pos) = self.lru.position(&name) {
            self.total_bytes -= self.lru.entries[pos].1.size();
            self.lru.entries.remove(pos);
        }
        self.total_bytes += object.size();
        self.lru.entries.insert(0, (name, object));
        self.evict_as_needed();
    }

    /// Walks tail to head, removing only zero-active-reference entries,
    /// until both budgets are satisfied (spec §4.9 "Eviction").
    fn evict_as_needed(&mut self) {
        let mut i = self.lru.entries.len();
        while (self.total_bytes > self.objmem_budget || self.lru.entries.len() as u32 > self.objects_cap) && i > 0 {
            i -= 1;
            if self.lru.entries[i].1.active_refs == 0 {
                let (name, removed) = self.lru.entries.remove(i);
                self.total_bytes -= removed.size();
                debug!(program = %name, bytes = removed.size(), "object cache evicted entry");
            }
        }
    }

    /// `logto` account switch (spec §4.9): invalidates every cached
    /// object that isn't globally catalogued under a reserved prefix
    /// (`*$!_`), since those names resolve the same way from any
    /// account and can safely stay live.
    pub fn invalidate_on_account_switch(&mut self) {
        for (name, obj) in &mut self.lru.entries {
            let reserved = name.starts_with(['*', '$', '!', '_']);
            if !(obj.globally_catalogued && reserved) {
                obj.invalid = true;
            }
        }
    }

    /// Records `duration` of CPU time against `outgoing_program`, called
    /// when the dispatcher switches to a different program (§4.9
    /// addendum). No-op unless the monitor is enabled.
    pub fn record_hot_spot(&mut self, outgoing_program: &str, duration: Duration) {
        if let Some(map) = &mut self.hot_spots {
            *map.entry(outgoing_program.to_string()).or_insert(Duration::ZERO) += duration;
        }
    }

    pub fn hot_spots(&self) -> Option<&HashMap<String, Duration>> {
        self.hot_spots.as_ref()
    }
}

/// Resolves where to look for `name` (spec §4.9's load policy), without
/// itself touching the filesystem — catalogue/account lookup is an
/// external collaborator (spec §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// `name` contains a directory separator: treat as a runfile path.
    RunfilePath,
    /// Search the local catalogue (`$VOC.CAT`) then the account's
    /// private catalogue directory.
    LocalThenPrivateCatalogue,
    /// `name` starts with a reserved prefix: go straight to the global
    /// catalogue.
    GlobalCatalogue,
}

pub fn resolve_load_source(name: &str) -> Result<LoadSource, DhError> {
    if name.contains('/') || name.contains('\\') {
        return Ok(LoadSource::RunfilePath);
    }
    if name.starts_with(['*', '$', '!', '_']) {
        return Ok(LoadSource::GlobalCatalogue);
    }
    Ok(LoadSource::LocalThenPrivateCatalogue)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(size: i32, refs: u32) -> CachedObject {
        CachedObject {
            header: ObjectHeader {
                magic: HDR_MAGIC,
                rev: 1,
                id: 1,
                start_offset: 0,
                args: 0,
                no_vars: 0,
                stack_depth: 0,
                sym_tab_offset: 0,
                line_tab_offset: 0,
                object_size: size,
                flags: HeaderFlags::empty(),
                compile_time: 0,
                program_name: "P".to_string(),
            },
            bytecode: Vec::new(),
            active_refs: refs,
            call_count: 0,
            cpu_time: Duration::ZERO,
            invalid: false,
            globally_catalogued: false,
        }
    }

    #[test]
    fn resolve_load_source_picks_expected_bucket() {
        assert_eq!(resolve_load_source("sub/PROG").unwrap(), LoadSource::RunfilePath);
        assert_eq!(resolve_load_source("*SYSPROG").unwrap(), LoadSource::GlobalCatalogue);
        assert_eq!(resolve_load_source("PROG").unwrap(), LoadSource::LocalThenPrivateCatalogue);
    }

    #[test]
    fn byte_swap_flips_inverted_magic() {
        let mut h = obj(10, 0).header;
        h.magic = HDR_MAGIC_INVERSE;
        assert!(h.needs_byte_swap());
        h.byte_swap();
        assert_eq!(h.magic, HDR_MAGIC);
    }

    #[test]
    fn eviction_skips_entries_with_active_refs() {
        let mut cache = ObjectCache::new(100, 10, false);
        cache.insert("A".to_string(), obj(60, 1));
        cache.insert("B".to_string(), obj(60, 0));
        // B (tail, zero refs) is evicted to stay under the 100-byte budget.
        assert!(cache.get("A").is_some());
        assert!(cache.get("B").is_none());
    }

    #[test]
    fn account_switch_invalidates_non_reserved_entries() {
        let mut cache = ObjectCache::new(1000, 10, false);
        cache.insert("PROG".to_string(), obj(10, 0));
        cache.insert("*SYS".to_string(), CachedObject { globally_catalogued: true, ..obj(10, 0) });
        cache.invalidate_on_account_switch();
        assert!(cache.get("PROG").is_none());
        assert!(cache.get("*SYS").is_some());
    }
}
