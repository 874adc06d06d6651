//! vmpool - host-local VM slot pool and hypervisor supervisor.
//!
//! A fixed pool of VM slots, each with a pre-assigned id, IP and MAC, is
//! shared by every user on a host. Starting a VM leases the lowest free
//! slot, provisions a private scratch directory and supervises the
//! hypervisor until it exits; stopping a VM returns its slot to the pool.
//!
//! All pool state lives in a small redb database guarded by a `flock(2)`
//! lock file, so concurrent invocations never hand out the same slot.

pub mod config;
pub mod error;
pub mod hypervisor;
pub mod lock;
pub mod pool;
pub mod process;
pub mod provision;
pub mod reclaim;
pub mod record;
pub mod request;
pub mod store;
pub mod supervisor;
pub mod util;

pub use error::{Error, Result};

/// vmpool version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
