//! Error types for ring operations.

use crate::hash_ring::RingStatus;

/// Errors produced by the ring and its orchestrator.
///
/// Lookups that find nothing are not errors: they return `None`, `false` or
/// an empty list. Checker misuse (start while running, stop while stopped) is
/// reported as a `false` return.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// The operation is not permitted in the ring's current lifecycle state.
    #[error("cannot {operation} while hash ring is {status}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the ring was in.
        status: RingStatus,
    },

    /// A target name was empty.
    #[error("target name must not be empty")]
    InvalidTarget,

    /// The ring's coordinate index and owner map disagree in size.
    ///
    /// This is a bookkeeping defect, not a transient condition. The ring
    /// instance should be considered unusable once this is returned.
    #[error("ring bookkeeping corrupted: {coordinates} coordinates but {owners} owner entries")]
    FatalInconsistency {
        /// Length of the sorted coordinate index.
        coordinates: usize,
        /// Length of the coordinate → target map.
        owners: usize,
    },
}

impl RingError {
    /// Whether the error signals corrupted internal state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RingError::FatalInconsistency { .. })
    }
}
