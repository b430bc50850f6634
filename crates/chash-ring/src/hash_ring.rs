//! Hash-ring orchestrator: targets, shadows, quarantine and lifecycle.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::checker::Checker;
use crate::error::RingError;
use crate::hash::{ketama_coordinates, key_hash};
use crate::ring::{Ring, VirtualNode};

/// Shadow identities generated per target when none is configured.
pub const DEFAULT_SHADOW_COUNT: u16 = 1000;

/// Name of a backend. Opaque and compared byte for byte.
pub type TargetId = Arc<str>;

/// Lifecycle state of a [`HashRing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingStatus {
    /// Never built.
    Uninitialized,
    /// Fresh state allocated, shadow count not yet applied.
    Initialized,
    /// Ready for targets and lookups.
    Built,
    /// Torn down; may be built again.
    Destroyed,
}

impl fmt::Display for RingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RingStatus::Uninitialized => "uninitialized",
            RingStatus::Initialized => "initialized",
            RingStatus::Built => "built",
            RingStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Targets moved by one [`HashRing::reconcile`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Targets taken off the ring because the predicate rejected them.
    pub quarantined: Vec<TargetId>,
    /// Pending targets put back on the ring with their previous coordinates.
    pub restored: Vec<TargetId>,
}

impl ReconcileSummary {
    /// Whether the pass changed nothing.
    pub fn is_empty(&self) -> bool {
        self.quarantined.is_empty() && self.restored.is_empty()
    }
}

/// Everything guarded by the ring lock.
///
/// Every coordinate in an `active` set is on `ring` and bound to that
/// target. `pending` sets are off the ring and remembered for restoration.
/// A target is never in both maps.
#[derive(Debug)]
struct RingState {
    status: RingStatus,
    /// Bumped whenever the ring is reset or its checker starts or stops.
    /// A background pass only applies if the generation it started under
    /// still holds.
    generation: u64,
    shadow_count: u16,
    ring: Ring,
    active: HashMap<TargetId, BTreeSet<u32>>,
    pending: HashMap<TargetId, BTreeSet<u32>>,
}

impl RingState {
    fn with_status(status: RingStatus, shadow_count: u16) -> Self {
        Self {
            status,
            generation: 0,
            shadow_count,
            ring: Ring::new(),
            active: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Replace everything with a fresh state, keeping the generation moving
    /// forward.
    fn reset(&mut self, status: RingStatus, shadow_count: u16) {
        let generation = self.generation.wrapping_add(1);
        *self = Self::with_status(status, shadow_count);
        self.generation = generation;
    }

    fn bump_generation(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    fn ensure_built(&self, operation: &'static str) -> Result<(), RingError> {
        if self.status == RingStatus::Built {
            Ok(())
        } else {
            Err(RingError::InvalidState {
                operation,
                status: self.status,
            })
        }
    }

    /// Insert `target`'s virtual nodes, stripping rebound coordinates from
    /// the active targets that owned them before.
    fn claim(&mut self, target: &TargetId, nodes: &[VirtualNode]) -> Result<bool, RingError> {
        let displaced: Vec<(TargetId, u32)> = nodes
            .iter()
            .filter_map(|node| {
                let owner = self.ring.owner(node.coordinate)?;
                (owner != &**target).then(|| (Arc::from(owner), node.coordinate))
            })
            .collect();

        let (_, changed) = self.ring.add(nodes)?;

        for (owner, coordinate) in displaced {
            if let Some(owned) = self.active.get_mut(&owner) {
                owned.remove(&coordinate);
            }
            debug!(%owner, %target, coordinate, "coordinate rebound to new owner");
        }

        Ok(changed)
    }

    /// Take `coordinates` off the ring where they are still bound to `target`.
    fn release(&mut self, target: &str, coordinates: &BTreeSet<u32>) -> usize {
        let mut removed = 0;
        for &coordinate in coordinates {
            if self.ring.owner(coordinate) == Some(target) && self.ring.remove(coordinate) {
                removed += 1;
            }
        }
        removed
    }
}

struct Shared {
    state: RwLock<RingState>,
    checker: Mutex<Option<Checker>>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, RingState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RingState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn checker(&self) -> MutexGuard<'_, Option<Checker>> {
        self.checker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One reconcile pass. `prepare` runs once, after the target snapshot
    /// is taken, and yields the predicate for this pass. With `generation`
    /// set, the pass is dropped if the ring was reset or the checker
    /// restarted or stopped in the meantime.
    fn reconcile<P, F>(
        &self,
        generation: Option<u64>,
        prepare: P,
    ) -> Result<ReconcileSummary, RingError>
    where
        P: FnOnce() -> F,
        F: Fn(&str) -> bool,
    {
        // Evaluate health without holding the lock so lookups keep flowing
        // while a slow predicate runs.
        let (active, pending): (Vec<TargetId>, Vec<TargetId>) = {
            let state = self.read();
            state.ensure_built("reconcile")?;
            if generation.is_some_and(|g| g != state.generation) {
                debug!("stale reconcile pass skipped");
                return Ok(ReconcileSummary::default());
            }
            (
                state.active.keys().cloned().collect(),
                state.pending.keys().cloned().collect(),
            )
        };
        let predicate = prepare();
        let unhealthy: Vec<TargetId> = active
            .into_iter()
            .filter(|t| !predicate(t.as_ref()))
            .collect();
        let recovered: Vec<TargetId> = pending
            .into_iter()
            .filter(|t| predicate(t.as_ref()))
            .collect();

        let mut state = self.write();
        state.ensure_built("reconcile")?;
        if generation.is_some_and(|g| g != state.generation) {
            debug!("stale reconcile pass dropped before applying");
            return Ok(ReconcileSummary::default());
        }
        let mut summary = ReconcileSummary::default();

        for target in unhealthy {
            let Some(coordinates) = state.active.remove(&target) else {
                continue;
            };
            let removed = state.release(&target, &coordinates);
            info!(%target, coordinates = removed, "quarantining unhealthy target");
            state.pending.insert(target.clone(), coordinates);
            summary.quarantined.push(target);
        }

        if let Err(e) = state.ring.check_consistency() {
            error!(error = %e, "FATAL: ring inconsistent after quarantine");
            return Err(e);
        }

        for target in recovered {
            let Some(coordinates) = state.pending.remove(&target) else {
                continue;
            };
            let nodes: Vec<VirtualNode> = coordinates
                .iter()
                .map(|&coordinate| VirtualNode {
                    coordinate,
                    target: target.clone(),
                })
                .collect();

            if let Err(e) = state.claim(&target, &nodes) {
                error!(%target, error = %e, "FATAL: failed to restore target");
                state.pending.insert(target, coordinates);
                return Err(e);
            }
            info!(%target, coordinates = coordinates.len(), "restoring recovered target");
            state.active.insert(target.clone(), coordinates);
            summary.restored.push(target);
        }

        Ok(summary)
    }
}

/// Consistent hash ring with liveness-driven quarantine.
///
/// Each target is expanded into `shadow_count` shadow identities, each of
/// which contributes four coordinates to the ring. Keys resolve to the owner
/// of the first coordinate at or after their hash, walking clockwise.
///
/// Lookups take a shared lock; topology changes and reconciliation take an
/// exclusive lock. Cloning the handle shares the same ring.
#[derive(Clone)]
pub struct HashRing {
    inner: Arc<Shared>,
}

impl HashRing {
    /// Create an unbuilt ring. Call [`HashRing::build`] before adding targets.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                state: RwLock::new(RingState::with_status(RingStatus::Uninitialized, 0)),
                checker: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> RingStatus {
        self.inner.read().status
    }

    /// Shadow identities generated per target (0 until built).
    pub fn shadow_count(&self) -> u16 {
        self.inner.read().shadow_count
    }

    /// Build the ring. A `shadow_count` of 0 selects [`DEFAULT_SHADOW_COUNT`].
    ///
    /// Fails with [`RingError::InvalidState`] if the ring is already built.
    pub fn build(&self, shadow_count: u16) -> Result<(), RingError> {
        let mut state = self.inner.write();
        match state.status {
            RingStatus::Uninitialized | RingStatus::Destroyed => {
                state.reset(RingStatus::Initialized, DEFAULT_SHADOW_COUNT);
            }
            RingStatus::Initialized => {}
            RingStatus::Built => {
                error!("hash ring already built, destroy it before rebuilding");
                return Err(RingError::InvalidState {
                    operation: "build",
                    status: RingStatus::Built,
                });
            }
        }

        if shadow_count > 0 {
            state.shadow_count = shadow_count;
        }
        state.status = RingStatus::Built;
        info!(shadow_count = state.shadow_count, "hash ring built");
        Ok(())
    }

    /// Tear the ring down: clear all targets and stop the checker.
    ///
    /// Returns `false` (and logs a warning) if the ring was not built.
    pub fn destroy(&self) -> bool {
        let mut state = self.inner.write();
        match state.status {
            RingStatus::Initialized | RingStatus::Built => {
                state.reset(RingStatus::Destroyed, 0);
                if let Some(mut checker) = self.inner.checker().take()
                    && checker.in_checking()
                {
                    checker.stop();
                }
                info!("hash ring destroyed");
                true
            }
            status => {
                warn!(%status, "hash ring not built, ignoring destroy");
                false
            }
        }
    }

    /// Put `target` on the ring.
    ///
    /// Generates `shadow_count` shadow identities `"{target}-{i}"` and
    /// inserts their four ketama coordinates each in one batch. Coordinates
    /// already held by another target are rebound to this one. A pending
    /// target is taken out of quarantine.
    ///
    /// Returns whether any new state was introduced; re-adding an active
    /// target is a no-op that returns `false`.
    pub fn add_target(&self, target: &str) -> Result<bool, RingError> {
        if target.is_empty() {
            return Err(RingError::InvalidTarget);
        }

        let mut state = self.inner.write();
        state.ensure_built("add target")?;

        let target: TargetId = Arc::from(target);
        let nodes = shadow_nodes(&target, state.shadow_count);
        let changed = match state.claim(&target, &nodes) {
            Ok(changed) => changed,
            Err(e) => {
                error!(%target, error = %e, "FATAL: failed to add target");
                return Err(e);
            }
        };

        let coordinates: BTreeSet<u32> = nodes.iter().map(|n| n.coordinate).collect();
        let was_pending = state.pending.remove(&target).is_some();
        let owned = coordinates.len();
        state.active.insert(target.clone(), coordinates);

        if changed || was_pending {
            info!(
                %target,
                coordinates = owned,
                ring_size = state.ring.len(),
                "target added to ring"
            );
        } else {
            debug!(%target, "target already on ring");
        }
        Ok(changed || was_pending)
    }

    /// Take `target` off the ring and forget it, whether active or pending.
    ///
    /// Returns `false` if the target is unknown.
    pub fn remove_target(&self, target: &str) -> Result<bool, RingError> {
        let mut state = self.inner.write();
        state.ensure_built("remove target")?;

        let Some(coordinates) = state
            .active
            .remove(target)
            .or_else(|| state.pending.remove(target))
        else {
            debug!(%target, "target not found, nothing removed");
            return Ok(false);
        };

        let removed = state.release(target, &coordinates);
        if let Err(e) = state.ring.check_consistency() {
            error!(%target, error = %e, "FATAL: ring inconsistent after removing target");
            return Err(e);
        }

        info!(
            %target,
            coordinates = removed,
            ring_size = state.ring.len(),
            "target removed from ring"
        );
        Ok(true)
    }

    /// The target owning `key`, or `None` if the key is empty or the ring is.
    pub fn resolve(&self, key: &str) -> Option<TargetId> {
        if key.is_empty() {
            return None;
        }
        let state = self.inner.read();
        state.ring.next(key_hash(key)).map(|node| node.target)
    }

    /// Up to `n` distinct targets for `key`, primary owner first.
    ///
    /// Walks clockwise from the key's hash collecting targets not seen yet.
    /// `n` is clamped to the number of active targets; `0` is treated as 1.
    pub fn resolve_n(&self, key: &str, n: usize) -> Vec<TargetId> {
        if key.is_empty() {
            return Vec::new();
        }

        let state = self.inner.read();
        let wanted = n.max(1).min(state.active.len());
        let mut targets: Vec<TargetId> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return targets;
        }

        for node in state.ring.walk(key_hash(key)) {
            if !targets.contains(&node.target) {
                targets.push(node.target);
                if targets.len() == wanted {
                    break;
                }
            }
        }
        targets
    }

    /// Re-evaluate every target with `predicate`.
    ///
    /// Active targets it rejects move to pending with their exact coordinate
    /// set. Pending targets it accepts go back on the ring with that same
    /// set. The predicate runs before the write lock is taken.
    pub fn reconcile<F>(&self, predicate: F) -> Result<ReconcileSummary, RingError>
    where
        F: Fn(&str) -> bool,
    {
        self.inner.reconcile(None, move || predicate)
    }

    /// Start reconciling with `predicate` every `interval` in the background.
    ///
    /// Must be called from within a Tokio runtime; without one nothing is
    /// started and `Ok(false)` is returned. A zero interval uses the checker
    /// default. A checker that is already running is stopped and replaced.
    /// The checker holds only a weak reference to the ring.
    pub fn start_check<F>(&self, predicate: F, interval: Duration) -> Result<bool, RingError>
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.start_check_with(
            move || {
                let predicate = predicate.clone();
                move |target: &str| predicate(target)
            },
            interval,
        )
    }

    /// Like [`HashRing::start_check`], but `prepare` runs once at the start
    /// of every pass and returns the predicate for that pass. Use it to load
    /// health data once per tick instead of once per target.
    pub fn start_check_with<P, F>(&self, prepare: P, interval: Duration) -> Result<bool, RingError>
    where
        P: Fn() -> F + Send + Sync + 'static,
        F: Fn(&str) -> bool,
    {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no Tokio runtime available, checker not started");
            return Ok(false);
        }

        let mut state = self.inner.write();
        state.ensure_built("start checker")?;
        let generation = state.bump_generation();

        let mut slot = self.inner.checker();
        if let Some(previous) = slot.as_mut()
            && previous.in_checking()
        {
            info!("stopping running checker before restart");
            previous.stop();
        }
        drop(state);

        let shared = Arc::downgrade(&self.inner);
        let mut checker = Checker::new(interval);
        let started = checker.start(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            match shared.reconcile(Some(generation), &prepare) {
                Ok(summary) if !summary.is_empty() => {
                    debug!(
                        quarantined = summary.quarantined.len(),
                        restored = summary.restored.len(),
                        "reconcile pass moved targets"
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => error!(error = %e, "FATAL: reconcile failed"),
                Err(e) => debug!(error = %e, "reconcile skipped"),
            }
        });
        *slot = Some(checker);
        Ok(started)
    }

    /// Stop the background checker. Returns `false` if none is running.
    pub fn stop_check(&self) -> bool {
        let mut state = self.inner.write();
        state.bump_generation();
        let mut slot = self.inner.checker();
        drop(state);
        match slot.as_mut() {
            Some(checker) => checker.stop(),
            None => false,
        }
    }

    /// Whether the background checker is running.
    pub fn in_checking(&self) -> bool {
        self.inner
            .checker()
            .as_ref()
            .is_some_and(|checker| checker.in_checking())
    }

    /// Active targets, sorted.
    pub fn active_targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self.inner.read().active.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Quarantined targets, sorted.
    pub fn pending_targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self.inner.read().pending.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Coordinates recorded for `target`, active or pending, ascending.
    pub fn target_coordinates(&self, target: &str) -> Option<Vec<u32>> {
        let state = self.inner.read();
        state
            .active
            .get(target)
            .or_else(|| state.pending.get(target))
            .map(|coordinates| coordinates.iter().copied().collect())
    }

    /// Whether `target` is known, active or pending.
    pub fn contains_target(&self, target: &str) -> bool {
        let state = self.inner.read();
        state.active.contains_key(target) || state.pending.contains_key(target)
    }

    /// Whether `target` is currently on the ring.
    pub fn is_active(&self, target: &str) -> bool {
        self.inner.read().active.contains_key(target)
    }

    /// Whether `target` is quarantined.
    pub fn is_pending(&self, target: &str) -> bool {
        self.inner.read().pending.contains_key(target)
    }

    /// Number of virtual nodes on the ring.
    pub fn node_count(&self) -> usize {
        self.inner.read().ring.len()
    }

    /// Copy of every virtual node on the ring, ascending by coordinate.
    pub fn snapshot(&self) -> Vec<VirtualNode> {
        self.inner.read().ring.all()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read();
        f.debug_struct("HashRing")
            .field("status", &state.status)
            .field("shadow_count", &state.shadow_count)
            .field("nodes", &state.ring.len())
            .field("active", &state.active.len())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

/// Virtual nodes for every shadow identity of `target`.
fn shadow_nodes(target: &TargetId, shadow_count: u16) -> Vec<VirtualNode> {
    (0..shadow_count)
        .flat_map(|i| {
            ketama_coordinates(&format!("{target}-{i}")).map(|coordinate| VirtualNode {
                coordinate,
                target: target.clone(),
            })
        })
        .collect()
}
