//! Directory-file engine (spec §4.5): each record is one host file named
//! after its id, inside a directory that stands in for the DH file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DhError, RecordNotFoundSnafu};

/// A directory-file handle. `nocase` mirrors `DHF_NOCASE` (§4.5):
/// id comparisons ignore case regardless of whether the host filesystem
/// itself is case-sensitive, so behavior doesn't depend on where the
/// file happens to be hosted (resolved as an open question, DESIGN.md).
#[derive(Debug, Clone)]
pub struct DirFile {
    pub dir: PathBuf,
    pub nocase: bool,
    /// When set, writes go to a temp file that is renamed into place
    /// (`safedir` mode, §4.5, §6's `SAFEDIR` config parameter).
    pub safedir: bool,
}

impl DirFile {
    pub fn open(dir: impl AsRef<Path>, nocase: bool, safedir: bool) -> Result<DirFile, DhError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(DirFile { dir, nocase, safedir })
    }

    /// Resolves `id` to an on-disk filename, scanning the directory for a
    /// case-insensitive match when `nocase` is set (since the filesystem
    /// itself may be case-sensitive even though this file isn't).
    fn resolve_name(&self, id: &str) -> Result<Option<String>, DhError> {
        let direct = self.dir.join(id);
        if direct.is_file() {
            return Ok(Some(id.to_string()));
        }
        if !self.nocase {
            return Ok(None);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.eq_ignore_ascii_case(id) {
                    return Ok(Some(name.to_string()));
                }
            }
        }
        Ok(None)
    }

    pub fn read(&self, id: &str) -> Result<Vec<u8>, DhError> {
        match self.resolve_name(id)? {
            Some(name) => Ok(fs::read(self.dir.join(name))?),
            None => RecordNotFoundSnafu.fail(),
        }
    }

    pub fn exists(&self, id: &str) -> Result<bool, DhError> {
        Ok(self.resolve_name(id)?.is_some())
    }

    /// Writes `data` under `id`. In `safedir` mode the data lands in a
    /// temp file first and is renamed into place, so a crash mid-write
    /// never leaves a half-written record visible under the real name
    /// (spec §4.5).
    pub fn write(&self, id: &str, data: &[u8]) -> Result<(), DhError> {
        let target_name = self.resolve_name(id)?.unwrap_or_else(|| id.to_string());
        let target = self.dir.join(&target_name);
        if self.safedir {
            let tmp = self.dir.join(format!(".{target_name}.tmp"));
            fs::write(&tmp, data)?;
            fs::rename(&tmp, &target)?;
        } else {
            fs::write(&target, data)?;
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), DhError> {
        match self.resolve_name(id)? {
            Some(name) => {
                fs::remove_file(self.dir.join(name))?;
                Ok(())
            }
            None => RecordNotFoundSnafu.fail(),
        }
    }

    /// Lists all record ids currently present (used by `SELECT` over a
    /// directory file).
    pub fn list_ids(&self) -> Result<Vec<String>, DhError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        ids.push(name.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_dir::TempDir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let df = DirFile::open(dir.path(), false, false).unwrap();
        df.write("CUST1", b"hello").unwrap();
        assert_eq!(df.read("CUST1").unwrap(), b"hello");
    }

    #[test]
    fn nocase_resolves_existing_file_regardless_of_case() {
        let dir = TempDir::new().unwrap();
        let df = DirFile::open(dir.path(), true, false).unwrap();
        df.write("Customer1", b"x").unwrap();
        assert_eq!(df.read("CUSTOMER1").unwrap(), b"x");
    }

    #[test]
    fn safedir_write_is_visible_atomically() {
        let dir = TempDir::new().unwrap();
        let df = DirFile::open(dir.path(), false, true).unwrap();
        df.write("CUST1", b"v1").unwrap();
        df.write("CUST1", b"v2").unwrap();
        assert_eq!(df.read("CUST1").unwrap(), b"v2");
        assert!(!dir.path().join(".CUST1.tmp").exists());
    }

    #[test]
    fn delete_removes_record() {
        let dir = TempDir::new().unwrap();
        let df = DirFile::open(dir.path(), false, false).unwrap();
        df.write("CUST1", b"x").unwrap();
        df.delete("CUST1").unwrap();
        assert!(matches!(df.read("CUST1"), Err(DhError::RecordNotFound)));
    }
}
