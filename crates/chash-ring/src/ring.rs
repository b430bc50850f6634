//! Ordered ring of virtual nodes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::RingError;

/// One point on the ring, bound to the target that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualNode {
    /// Position on the `u32` ring.
    pub coordinate: u32,
    /// Target that owns this position.
    pub target: Arc<str>,
}

impl VirtualNode {
    /// Create a virtual node.
    pub fn new(coordinate: u32, target: impl Into<Arc<str>>) -> Self {
        Self {
            coordinate,
            target: target.into(),
        }
    }
}

/// Ordered, deduplicated set of virtual nodes on a `u32` ring.
///
/// Coordinates are kept in a sorted index for binary search and bound to
/// their owners in a separate map. Both structures always hold the same set
/// of coordinates; [`Ring::check_consistency`] verifies it.
///
/// Not synchronized: [`HashRing`](crate::HashRing) wraps it in a lock.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    /// Sorted ascending, no duplicates.
    coordinates: Vec<u32>,
    /// Coordinate → owning target.
    owners: HashMap<u32, Arc<str>>,
}

impl Ring {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of virtual nodes on the ring.
    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    /// Whether the ring has no virtual nodes.
    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    /// Whether a virtual node sits exactly at `coordinate`.
    pub fn contains(&self, coordinate: u32) -> bool {
        self.owners.contains_key(&coordinate)
    }

    /// Owner of the virtual node at `coordinate`, if any.
    pub fn owner(&self, coordinate: u32) -> Option<&str> {
        self.owners.get(&coordinate).map(|t| &**t)
    }

    /// Exact-match lookup.
    pub fn get(&self, coordinate: u32) -> Option<VirtualNode> {
        let index = self.coordinates.binary_search(&coordinate).ok()?;
        self.node_at(index)
    }

    /// The virtual node at the smallest coordinate `>= coordinate`.
    ///
    /// Wraps to the lowest coordinate when `coordinate` is past the highest
    /// one. An exact match is its own successor. Returns `None` only when the
    /// ring is empty.
    pub fn next(&self, coordinate: u32) -> Option<VirtualNode> {
        if self.coordinates.is_empty() {
            return None;
        }
        let index = self.successor_index(coordinate);
        self.node_at(index)
    }

    /// Walk the ring clockwise starting at `next(coordinate)`.
    ///
    /// Visits every virtual node exactly once, wrapping past the highest
    /// coordinate.
    pub fn walk(&self, coordinate: u32) -> impl Iterator<Item = VirtualNode> + '_ {
        let len = self.coordinates.len();
        let start = if len == 0 {
            0
        } else {
            self.successor_index(coordinate)
        };
        (0..len).filter_map(move |step| self.node_at((start + step) % len))
    }

    /// Insert a batch of virtual nodes.
    ///
    /// New coordinates are inserted. A coordinate that already exists is
    /// rebound to the incoming node's target. Returns the coordinates that
    /// were newly inserted and whether anything changed at all (insertions
    /// or rebinds to a different target).
    ///
    /// The index is re-sorted once per batch. If the bookkeeping invariant
    /// does not hold afterwards, every change made by this call is undone
    /// and [`RingError::FatalInconsistency`] is returned.
    pub fn add(&mut self, nodes: &[VirtualNode]) -> Result<(Vec<u32>, bool), RingError> {
        if nodes.is_empty() {
            return Ok((Vec::new(), false));
        }

        let mut inserted = Vec::new();
        let mut rebound: Vec<(u32, Arc<str>)> = Vec::new();

        for node in nodes {
            match self.owners.insert(node.coordinate, node.target.clone()) {
                None => inserted.push(node.coordinate),
                Some(previous) if previous != node.target => {
                    rebound.push((node.coordinate, previous));
                }
                Some(_) => {}
            }
        }

        let expected = self.coordinates.len() + inserted.len();
        if expected != self.owners.len() {
            let owners = self.owners.len();
            for (coordinate, previous) in rebound.into_iter().rev() {
                self.owners.insert(coordinate, previous);
            }
            for coordinate in &inserted {
                self.owners.remove(coordinate);
            }
            error!(
                coordinates = expected,
                owners, "ring index and owner map diverged during insert"
            );
            return Err(RingError::FatalInconsistency {
                coordinates: expected,
                owners,
            });
        }

        let changed = !inserted.is_empty() || !rebound.is_empty();
        if !inserted.is_empty() {
            self.coordinates.extend_from_slice(&inserted);
            self.coordinates.sort_unstable();
        }

        debug!(
            inserted = inserted.len(),
            rebound = rebound.len(),
            total = self.coordinates.len(),
            "added virtual nodes"
        );

        Ok((inserted, changed))
    }

    /// Remove the virtual node at `coordinate`.
    ///
    /// Returns `false` if there is no node there.
    pub fn remove(&mut self, coordinate: u32) -> bool {
        match self.coordinates.binary_search(&coordinate) {
            Ok(index) => {
                self.coordinates.remove(index);
                self.owners.remove(&coordinate);
                true
            }
            Err(_) => false,
        }
    }

    /// Snapshot of every virtual node, ascending by coordinate.
    pub fn all(&self) -> Vec<VirtualNode> {
        (0..self.coordinates.len())
            .filter_map(|index| self.node_at(index))
            .collect()
    }

    /// Verify that the coordinate index and the owner map agree in size.
    pub fn check_consistency(&self) -> Result<(), RingError> {
        if self.coordinates.len() == self.owners.len() {
            Ok(())
        } else {
            Err(RingError::FatalInconsistency {
                coordinates: self.coordinates.len(),
                owners: self.owners.len(),
            })
        }
    }

    fn successor_index(&self, coordinate: u32) -> usize {
        let index = self.coordinates.partition_point(|&c| c < coordinate);
        if index == self.coordinates.len() {
            0
        } else {
            index
        }
    }

    fn node_at(&self, index: usize) -> Option<VirtualNode> {
        let coordinate = *self.coordinates.get(index)?;
        let target = self.owners.get(&coordinate)?;
        Some(VirtualNode {
            coordinate,
            target: target.clone(),
        })
    }
}
