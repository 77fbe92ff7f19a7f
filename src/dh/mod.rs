//! DH (dynamic-hash) file engine (spec §3.3, §4.4).
//!
//! A DH file is a directory of physical subfiles: `~0` primary, `~1`
//! overflow, `~2..~33` alternate-key (AK) indices. [`header`] packs/reads
//! the file header, [`group`] walks group blocks and the records packed
//! inside them, [`hash`] implements the linear-hash group function and
//! the split/merge load policy, [`bigrec`] chains large records through
//! the overflow subfile, [`ak`] manages the alternate-key subfiles, and
//! [`file`] ties all of the above into the `dh_open`/`dh_read`/write/
//! delete entry points used by the rest of the engine.

pub mod ak;
pub mod bigrec;
pub mod file;
pub mod group;
pub mod hash;
pub mod header;

pub use file::FileVar;
pub use header::{DhFlags, DhHeader, DhParams};
