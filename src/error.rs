//! Crate-wide error taxonomy (spec §7).
//!
//! Each component has its own failure enum; the interpreter-facing
//! [`InterpError`] wraps the lower-level ones and adds the error kinds
//! that only make sense at the opcode-dispatch boundary (overflow,
//! unassigned variable, type mismatch, ...).

use snafu::Snafu;

/// DH engine errors (§4.4, §7). Every DH entry point sets/returns one of
/// these on failure instead of panicking; callers decide whether to raise
/// to the interpreter or surface a warning.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum DhError {
    #[snafu(display("file not found: {path}"))]
    FileNotFound { path: String },

    #[snafu(display("file already open exclusively"))]
    Exclusive,

    #[snafu(display("read error on subfile {subfile}"))]
    ReadError { subfile: u16 },

    #[snafu(display("write error on subfile {subfile}"))]
    WriteError { subfile: u16 },

    #[snafu(display("header corrupt: {reason}"))]
    HeaderCorrupt { reason: String },

    #[snafu(display("unsupported file format version {found}, max supported {max}"))]
    VersionUnsupported { found: u16, max: u16 },

    #[snafu(display("record id length {len} exceeds configured maximum {max}"))]
    IdLengthExceeded { len: usize, max: usize },

    #[snafu(display("too many files open (limit {limit})"))]
    TooManyFiles { limit: u16 },

    #[snafu(display("AK cross-check failed for index {index}"))]
    AkCrossCheckFailed { index: u8 },

    #[snafu(display("AK header corrupt: {reason}"))]
    AkHeaderCorrupt { reason: String },

    #[snafu(display("trusted access required"))]
    TrustedAccessDenied,

    #[snafu(display("out of memory"))]
    OutOfMemory,

    #[snafu(display("record not found"))]
    RecordNotFound,

    #[snafu(display("i/o error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("{source}"))]
    Locked { source: LockError },
}

impl From<LockError> for DhError {
    fn from(source: LockError) -> Self {
        DhError::Locked { source }
    }
}

impl From<std::io::Error> for DhError {
    fn from(source: std::io::Error) -> Self {
        DhError::Io { source }
    }
}

/// Transaction manager errors (§4.8, §7).
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum TxnError {
    #[snafu(display("no transaction is open"))]
    NoTransaction,

    #[snafu(display("commit-time write failed: {source}"))]
    CommitWriteFailed { source: DhError },

    #[snafu(display("transaction id space exhausted"))]
    IdSpaceExhausted,
}

/// Lock manager errors (§4.7, §7).
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum LockError {
    #[snafu(display("lock table is full (limit {limit})"))]
    TableFull { limit: u32 },

    #[snafu(display("deadlock detected"))]
    Deadlock,

    #[snafu(display("file is locked exclusively"))]
    FileLocked,
}

/// Config loading errors (§6, §7). Fatal at startup; reported via a single
/// message and the process exits.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("cannot read config file {path}: {reason}"))]
    Unreadable { path: String, reason: String },

    #[snafu(display("unknown config parameter: {name}"))]
    UnknownParameter { name: String },

    #[snafu(display("config parameter {name} out of range: {reason}"))]
    OutOfRange { name: String, reason: String },

    #[snafu(display("QMSYS install directory not set"))]
    MissingQmsys,

    #[snafu(display("$CPROC not found in global catalogue of QMSYS"))]
    MissingCproc,

    #[snafu(display("FIXUSERS/PORTMAP ranges conflict: {reason}"))]
    RangeConflict { reason: String },
}

/// External sort errors (§4.10, §7).
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SortError {
    #[snafu(display("i/o error during sort: {reason}"))]
    Io { reason: String },

    #[snafu(display("too many keys: {count} (max 16)"))]
    TooManyKeys { count: usize },
}

/// Interpreter-level errors (§7). Each has an "as warning" mode controlled
/// by the program frame; warnings substitute a default and continue,
/// errors raise to the `ON ERROR` handler.
#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum InterpError {
    #[snafu(display("numeric overflow"))]
    NumericOverflow,

    #[snafu(display("non-numeric value used in arithmetic: {value}"))]
    NonNumeric { value: String },

    #[snafu(display("divide by zero"))]
    DivideByZero,

    #[snafu(display("unassigned variable"))]
    UnassignedVariable,

    #[snafu(display("value-type mismatch"))]
    TypeMismatch,

    #[snafu(display("invalid descriptor type for operation"))]
    InvalidDescriptorType,

    #[snafu(display("array index {index} out of range (len {len})"))]
    IndexOutOfRange { index: i64, len: usize },

    #[snafu(display("unknown subroutine: {name}"))]
    UnknownSubroutine { name: String },

    #[snafu(display("{source}"))]
    Dh { source: DhError },

    #[snafu(display("{source}"))]
    Txn { source: TxnError },

    #[snafu(display("{source}"))]
    Lock { source: LockError },

    #[snafu(display("{source}"))]
    Sort { source: SortError },
}

impl From<DhError> for InterpError {
    fn from(source: DhError) -> Self {
        InterpError::Dh { source }
    }
}

impl From<TxnError> for InterpError {
    fn from(source: TxnError) -> Self {
        InterpError::Txn { source }
    }
}

impl From<LockError> for InterpError {
    fn from(source: LockError) -> Self {
        InterpError::Lock { source }
    }
}

impl From<SortError> for InterpError {
    fn from(source: SortError) -> Self {
        InterpError::Sort { source }
    }
}

/// Policy for interpreter errors that have an "as warning" variant (§7).
/// Read from the current program frame rather than a global, per spec §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnOrRaise {
    /// Substitute a default (zero/empty) and continue.
    Warn,
    /// Raise to the interpreter's error handler.
    Raise,
}
