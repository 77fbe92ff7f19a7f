//! Configuration file loading and validation (spec §6).
//!
//! The `[QM]` INI-style file is scanned by hand (no general-purpose INI
//! crate in the corpus fits the bespoke cross-field validation rules
//! here — the same reasoning spec.md gives for hand-rolling the numeric
//! scanner in §4.1) into a `name -> value` map, then validated into the
//! `Config`/`PCfg` split mirrored from `original_source/gplsrc/config.h`:
//! `Config` is the process-independent, shared-at-startup configuration;
//! `PCfg` is loaded per-process to allow local overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, MissingCprocSnafu, MissingQmsysSnafu, OutOfRangeSnafu, RangeConflictSnafu, UnknownParameterSnafu};
use snafu::OptionExt;

/// Users above this number cannot be targeted by `FIXUSERS`/`PORTMAP`
/// ranges (§6).
pub const MIN_HI_USER_NO: i32 = 32767;
pub const MAX_GROUP_SIZE: i16 = 8;
pub const MAX_ID_LEN: i16 = 255;

/// Process-independent configuration, loaded once at startup (`CONFIG` in
/// `config.h`).
#[derive(Debug, Clone)]
pub struct Config {
    pub qmsys: PathBuf,
    pub numusers: i16,
    pub numfiles: i16,
    pub numlocks: i16,
    pub maxidlen: i16,
    pub cmdstack: i16,
    pub deadlock: bool,
    pub debug: u16,
    pub dumpdir: Option<PathBuf>,
    pub errlog_bytes: u32,
    pub exclrem: bool,
    pub fds: i32,
    pub filerule: u16,
    pub fixusers: Option<(i16, i16)>,
    pub jnldir: Option<PathBuf>,
    pub jnlmode: i16,
    pub portmap: Option<(i16, i16, i16)>,
    pub spooler: Option<String>,
    pub startup: Option<String>,
}

/// Per-process configuration, re-loadable locally (`PCFG` in `config.h`).
#[derive(Debug, Clone)]
pub struct PCfg {
    pub flt_diff: f64,
    pub fsync: i16,
    pub gdi: bool,
    pub grpsize: i16,
    pub intprec: i16,
    pub lptrhigh: i16,
    pub lptrwide: i16,
    pub maxcall: i32,
    pub must_lock: bool,
    pub netfiles: u16,
    pub objects: i16,
    pub objmem: u32,
    pub qmclient_mode: i16,
    pub reccache: i16,
    pub ringwait: bool,
    pub safedir: bool,
    pub sh: Option<String>,
    pub sh1: Option<String>,
    pub sortmem: u32,
    pub sortmrg: i16,
    pub sortworkdir: PathBuf,
    pub tempdir: PathBuf,
    pub terminfodir: Option<PathBuf>,
    pub txchar: bool,
    pub yearbase: i16,
}

impl Default for PCfg {
    fn default() -> Self {
        PCfg {
            flt_diff: 2.91e-11,
            fsync: 0,
            gdi: false,
            grpsize: 1,
            intprec: 13,
            lptrhigh: 66,
            lptrwide: 80,
            maxcall: 10_000,
            must_lock: false,
            netfiles: 0,
            objects: 0,
            objmem: 0,
            qmclient_mode: 0,
            reccache: 0,
            ringwait: true,
            safedir: false,
            sh: None,
            sh1: None,
            sortmem: 1024 * 1024,
            sortmrg: 4,
            sortworkdir: default_tempdir(),
            tempdir: default_tempdir(),
            terminfodir: None,
            txchar: true,
            yearbase: 1930,
        }
    }
}

fn default_tempdir() -> PathBuf {
    std::env::var_os("TMP").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Raw `name -> value` map produced by the INI scanner, before typed
/// validation.
#[derive(Debug, Default)]
pub struct RawConfig {
    values: HashMap<String, String>,
}

impl RawConfig {
    /// Scans an INI-style file with a single `[QM]` section. Lines are
    /// `NAME=VALUE`, blank lines and `;`/`#`-prefixed comments ignored.
    pub fn parse(text: &str) -> RawConfig {
        let mut values = HashMap::new();
        let mut in_section = false;
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                in_section = line.eq_ignore_ascii_case("[QM]");
                continue;
            }
            if !in_section {
                continue;
            }
            if let Some(eq) = line.find('=') {
                let name = line[..eq].trim().to_ascii_uppercase();
                let value = line[eq + 1..].trim().to_string();
                values.insert(name, value);
            }
        }
        RawConfig { values }
    }

    pub fn load_file(path: &Path) -> Result<RawConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(RawConfig::parse(&text))
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    fn parse_int(&self, name: &str, default: i64) -> Result<i64, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => v.trim().parse::<i64>().map_err(|_| ConfigError::OutOfRange {
                name: name.to_string(),
                reason: format!("not an integer: {v}"),
            }),
        }
    }

    /// Every recognized parameter name; anything else in the file is an
    /// unknown-parameter error (§7).
    fn known_names() -> &'static [&'static str] {
        &[
            "NUMUSERS", "NUMFILES", "NUMLOCKS", "MAXIDLEN", "CMDSTACK", "DEADLOCK", "DEBUG",
            "DUMPDIR", "ERRLOG", "EXCLREM", "FDS", "FILERULE", "FIXUSERS", "FLTDIFF", "FSYNC",
            "GDI", "GRPSIZE", "INTPREC", "JNLDIR", "JNLMODE", "LPTRHIGH", "LPTRWIDE", "MAXCALL",
            "MUSTLOCK", "NETFILES", "OBJECTS", "OBJMEM", "PDUMP", "PORTMAP", "QMCLIENT", "QMSYS",
            "RECCACHE", "RINGWAIT", "SAFEDIR", "SH", "SH1", "SORTMEM", "SORTMRG", "SORTWORK",
            "SPOOLER", "STARTUP", "TEMPDIR", "TERMINFO", "TXCHAR", "YEARBASE",
        ]
    }

    fn check_known(&self) -> Result<(), ConfigError> {
        let known = Self::known_names();
        for name in self.values.keys() {
            if !known.contains(&name.as_str()) {
                return UnknownParameterSnafu { name: name.clone() }.fail();
            }
        }
        Ok(())
    }
}

fn range_check(name: &str, value: i64, lo: i64, hi: i64) -> Result<i64, ConfigError> {
    if value < lo || value > hi {
        return OutOfRangeSnafu {
            name: name.to_string(),
            reason: format!("{value} not in [{lo}, {hi}]"),
        }
        .fail();
    }
    Ok(value)
}

/// Loads and validates both the process-independent `Config` and the
/// default per-process `PCfg` from one raw config map (§6). `$CPROC`
/// existence under `QMSYS`'s global catalogue is checked via
/// `cproc_exists`, a caller-supplied predicate so this module doesn't
/// need to know the catalogue's on-disk layout (an external-collaborator
/// boundary, spec §1).
pub fn load(raw: &RawConfig, cproc_exists: impl FnOnce(&Path) -> bool) -> Result<(Config, PCfg), ConfigError> {
    raw.check_known()?;

    let qmsys_str = raw.get("QMSYS").context(MissingQmsysSnafu)?;
    let qmsys = PathBuf::from(qmsys_str);

    let maxidlen = range_check("MAXIDLEN", raw.parse_int("MAXIDLEN", 63)?, 63, MAX_ID_LEN as i64)? as i16;
    let numfiles = range_check("NUMFILES", raw.parse_int("NUMFILES", 80)?, 1, i16::MAX as i64)? as i16;
    let numlocks = range_check("NUMLOCKS", raw.parse_int("NUMLOCKS", 100)?, 1, i16::MAX as i64)? as i16;
    let cmdstack = range_check("CMDSTACK", raw.parse_int("CMDSTACK", 99)?, 1, i16::MAX as i64)? as i16;
    let numusers = range_check("NUMUSERS", raw.parse_int("NUMUSERS", 16)?, 1, MIN_HI_USER_NO as i64)? as i16;
    let errlog_kb = raw.parse_int("ERRLOG", 0)?;
    let errlog_bytes = if errlog_kb == 0 {
        0
    } else {
        (range_check("ERRLOG", errlog_kb.max(10), 10, i64::MAX)? * 1024) as u32
    };
    let fds = range_check("FDS", raw.parse_int("FDS", i16::MAX as i64)?, 1, i32::MAX as i64)? as i32;

    let fixusers = match raw.get("FIXUSERS") {
        None => None,
        Some(v) => {
            let (base, range) = parse_pair("FIXUSERS", v)?;
            if (base as i32 + range as i32) > MIN_HI_USER_NO {
                return RangeConflictSnafu {
                    reason: "FIXUSERS range extends beyond MIN_HI_USER_NO".to_string(),
                }
                .fail();
            }
            Some((base, range))
        }
    };

    let portmap = match raw.get("PORTMAP") {
        None => None,
        Some(v) => {
            let parts: Vec<&str> = v.split(',').collect();
            if parts.len() != 3 {
                return OutOfRangeSnafu {
                    name: "PORTMAP".to_string(),
                    reason: "expected port,user,range".to_string(),
                }
                .fail();
            }
            let port: i16 = parts[0].trim().parse().map_err(|_| ConfigError::OutOfRange {
                name: "PORTMAP".to_string(),
                reason: "bad port".to_string(),
            })?;
            let user: i16 = parts[1].trim().parse().map_err(|_| ConfigError::OutOfRange {
                name: "PORTMAP".to_string(),
                reason: "bad base user".to_string(),
            })?;
            let range: i16 = parts[2].trim().parse().map_err(|_| ConfigError::OutOfRange {
                name: "PORTMAP".to_string(),
                reason: "bad range".to_string(),
            })?;
            if (user as i32 + range as i32) > MIN_HI_USER_NO {
                return RangeConflictSnafu {
                    reason: "PORTMAP range extends beyond MIN_HI_USER_NO".to_string(),
                }
                .fail();
            }
            Some((port, user, range))
        }
    };

    if let (Some((fb, fr)), Some((_, pu, pr))) = (fixusers, portmap) {
        let fixusers_range = fb..(fb + fr);
        let portmap_range = pu..(pu + pr);
        if fixusers_range.start < portmap_range.end && portmap_range.start < fixusers_range.end {
            return RangeConflictSnafu {
                reason: "FIXUSERS and PORTMAP user ranges overlap".to_string(),
            }
            .fail();
        }
    }

    let cproc_path = qmsys.join("GLOBAL.CATALOG").join("$CPROC");
    if !cproc_exists(&cproc_path) {
        return MissingCprocSnafu.fail();
    }

    let config = Config {
        qmsys,
        numusers,
        numfiles,
        numlocks,
        maxidlen,
        cmdstack,
        deadlock: parse_bool(raw.get("DEADLOCK")),
        debug: raw.parse_int("DEBUG", 0)? as u16,
        dumpdir: raw.get("DUMPDIR").map(PathBuf::from),
        errlog_bytes,
        exclrem: parse_bool(raw.get("EXCLREM")),
        fds,
        filerule: raw.parse_int("FILERULE", 0)? as u16,
        fixusers,
        jnldir: raw.get("JNLDIR").map(PathBuf::from),
        jnlmode: raw.parse_int("JNLMODE", 0)? as i16,
        portmap,
        spooler: raw.get("SPOOLER").map(str::to_string),
        startup: raw.get("STARTUP").map(str::to_string),
    };

    let mut pcfg = PCfg {
        flt_diff: raw.get_or("FLTDIFF", "0.0000000000291").parse().unwrap_or(2.91e-11),
        fsync: range_check("FSYNC", raw.parse_int("FSYNC", 0)?, 0, 3)? as i16,
        gdi: parse_bool(raw.get("GDI")),
        grpsize: range_check("GRPSIZE", raw.parse_int("GRPSIZE", 1)?, 1, MAX_GROUP_SIZE as i64)? as i16,
        intprec: range_check("INTPREC", raw.parse_int("INTPREC", 13)?, 0, 14)? as i16,
        lptrhigh: range_check("LPTRHIGH", raw.parse_int("LPTRHIGH", 66)?, 10, 32767)? as i16,
        lptrwide: range_check("LPTRWIDE", raw.parse_int("LPTRWIDE", 80)?, 10, 1000)? as i16,
        maxcall: range_check("MAXCALL", raw.parse_int("MAXCALL", 10_000)?, 10, 1_000_000)? as i32,
        must_lock: parse_bool(raw.get("MUSTLOCK")),
        netfiles: raw.parse_int("NETFILES", 0)? as u16,
        objects: raw.parse_int("OBJECTS", 0)? as i16,
        objmem: (raw.parse_int("OBJMEM", 0)? * 1024) as u32,
        qmclient_mode: range_check("QMCLIENT", raw.parse_int("QMCLIENT", 0)?, 0, 2)? as i16,
        reccache: range_check("RECCACHE", raw.parse_int("RECCACHE", 0)?, 0, 32)? as i16,
        ringwait: parse_bool_default(raw.get("RINGWAIT"), true),
        safedir: parse_bool(raw.get("SAFEDIR")),
        sh: raw.get("SH").map(str::to_string),
        sh1: raw.get("SH1").map(str::to_string),
        sortmem: (range_check("SORTMEM", raw.parse_int("SORTMEM", 1024)?, 1, i64::MAX)? * 1024) as u32,
        sortmrg: range_check("SORTMRG", raw.parse_int("SORTMRG", 4)?, 2, 10)? as i16,
        sortworkdir: default_tempdir(),
        tempdir: default_tempdir(),
        terminfodir: raw.get("TERMINFO").map(PathBuf::from),
        txchar: parse_bool_default(raw.get("TXCHAR"), true),
        yearbase: range_check("YEARBASE", raw.parse_int("YEARBASE", 1930)?, 1900, 2500)? as i16,
    };

    // TEMPDIR/SORTWORK must exist as directories; otherwise silently
    // unset and the default substituted (§6).
    if let Some(v) = raw.get("TEMPDIR") {
        let p = PathBuf::from(v);
        if p.is_dir() {
            pcfg.tempdir = p;
        }
    }
    pcfg.sortworkdir = match raw.get("SORTWORK") {
        Some(v) if Path::new(v).is_dir() => PathBuf::from(v),
        _ => pcfg.tempdir.clone(),
    };

    Ok((config, pcfg))
}

fn parse_pair(name: &str, v: &str) -> Result<(i16, i16), ConfigError> {
    let parts: Vec<&str> = v.split(',').collect();
    if parts.len() != 2 {
        return OutOfRangeSnafu {
            name: name.to_string(),
            reason: "expected base,range".to_string(),
        }
        .fail();
    }
    let base: i16 = parts[0].trim().parse().map_err(|_| ConfigError::OutOfRange {
        name: name.to_string(),
        reason: "bad base".to_string(),
    })?;
    let range: i16 = parts[1].trim().parse().map_err(|_| ConfigError::OutOfRange {
        name: name.to_string(),
        reason: "bad range".to_string(),
    })?;
    Ok((base, range))
}

fn parse_bool(v: Option<&str>) -> bool {
    parse_bool_default(v, false)
}

fn parse_bool_default(v: Option<&str>, default: bool) -> bool {
    match v {
        None => default,
        Some(s) => matches!(s.trim().to_ascii_uppercase().as_str(), "1" | "TRUE" | "YES" | "ON"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_section() {
        let raw = RawConfig::parse("[QM]\nQMSYS=/opt/qm\nNUMFILES=120\n");
        assert_eq!(raw.get("QMSYS"), Some("/opt/qm"));
        let (cfg, pcfg) = load(&raw, |_| true).unwrap();
        assert_eq!(cfg.numfiles, 120);
        assert_eq!(pcfg.grpsize, 1);
    }

    #[test]
    fn rejects_unknown_parameter() {
        let raw = RawConfig::parse("[QM]\nQMSYS=/opt/qm\nBOGUS=1\n");
        assert!(matches!(load(&raw, |_| true), Err(ConfigError::UnknownParameter { .. })));
    }

    #[test]
    fn rejects_missing_qmsys() {
        let raw = RawConfig::parse("[QM]\nNUMFILES=10\n");
        assert!(matches!(load(&raw, |_| true), Err(ConfigError::MissingQmsys)));
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let raw = RawConfig::parse("[QM]\nQMSYS=/opt/qm\nFIXUSERS=10,20\nPORTMAP=5000,15,10\n");
        assert!(matches!(load(&raw, |_| true), Err(ConfigError::RangeConflict { .. })));
    }
}
