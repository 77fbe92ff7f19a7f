//! Ambient tracing setup. Every mutating entry point in this crate
//! (`dh::file::FileVar::write`/`delete`, `txn::TxnManager::commit`/
//! `rollback`, `lock::LockManager::acquire`, `sysseg` critical sections,
//! `objcache` eviction) emits `tracing` spans/events; this module is just
//! the subscriber wiring a host process needs to see them, the same
//! `tracing-subscriber` fmt layer the teacher wires up for its own
//! binaries.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `fmt` subscriber filtered by `QM_LOG` (falling back
/// to `info`), writing to stderr. Intended to be called once near
/// process start; a second call is harmless since
/// `try_init` only fails (silently, here) if a subscriber is already
/// installed.
pub fn init() {
    let filter = EnvFilter::try_from_env("QM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_does_not_panic_when_called_twice() {
        init();
        init();
    }
}
