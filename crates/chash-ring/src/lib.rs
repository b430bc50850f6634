//! Consistent hashing ring with ketama placement and liveness-driven
//! quarantine.
//!
//! This crate provides:
//!
//! - [`hash`]: SHA-1 ketama hashing. One digest yields four `u32` ring
//!   coordinates; lookup keys use their mean.
//! - [`Ring`]: sorted, deduplicated virtual nodes with wrap-around
//!   successor lookup.
//! - [`HashRing`]: expands each target into many shadow identities, resolves
//!   keys to one or several distinct targets, and quarantines targets that
//!   fail a liveness predicate until they recover.
//! - [`Checker`]: cancellable background task that runs the reconciliation
//!   on a fixed interval.
//!
//! ```no_run
//! # fn main() -> Result<(), chash_ring::RingError> {
//! use chash_ring::HashRing;
//!
//! let ring = HashRing::new();
//! ring.build(500)?;
//! ring.add_target("10.0.0.1:2181")?;
//! ring.add_target("10.0.0.2:2181")?;
//!
//! let owner = ring.resolve("user:42");
//! let replicas = ring.resolve_n("user:42", 2);
//! # let _ = (owner, replicas);
//! # Ok(())
//! # }
//! ```

pub mod checker;
mod error;
pub mod hash;
mod hash_ring;
mod ring;


pub use checker::{Checker, DEFAULT_CHECK_INTERVAL};
pub use error::RingError;
pub use hash_ring::{DEFAULT_SHADOW_COUNT, HashRing, ReconcileSummary, RingStatus, TargetId};
pub use ring::{Ring, VirtualNode};
