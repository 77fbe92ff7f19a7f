//! Core storage and execution substrate for a multi-value (Pick-style)
//! database engine: the descriptor/string runtime, mark-delimited string
//! algorithms, the shared system segment, the dynamic-hash file engine,
//! the lock and transaction managers, the object-code cache and the
//! external disk-merge sort.
//!
//! Opcode dispatch, the language compiler and user-facing I/O are external
//! collaborators; this crate exposes the operations they call.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod dh;
pub mod dirfile;
pub mod error;
pub mod lock;
pub mod logging;
pub mod markstr;
pub mod objcache;
pub mod sort;
pub mod sysseg;
pub mod txn;

pub use descriptor::Descriptor;
pub use error::{DhError, InterpError};
