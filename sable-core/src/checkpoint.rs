//! # Checkpoint cache
//!
//! A bounded set of whole-bitmap snapshots per buffer, indexed by log
//! position, so a bounded replay restores from the nearest snapshot instead
//! of replaying the whole history. Checkpoints are a pure optimization: with
//! a budget of zero every operation still produces the same bitmap, just
//! slower.
//!
//! Bookkeeping invariants:
//! - checkpoints are strictly increasing by `index`;
//! - a checkpoint's `cost` counts the non-undone events in the window from
//!   its predecessor (or the log start) up to its own index, so the summed
//!   costs equal the non-undone events before the newest checkpoint.

use crate::raster::Surface;
use crate::util::PixelRect;

#[derive(Copy, Clone, Debug)]
pub struct CheckpointPolicy {
    /// Maximum live snapshots per buffer. Zero disables checkpointing.
    pub budget: usize,
    /// Non-undone events accumulated before a new checkpoint is taken.
    pub interval: u64,
}
impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            budget: 4,
            interval: 16,
        }
    }
}

/// One snapshot at a known log position: the state after applying
/// `[0, index)`. `invalid` means the snapshot data has been dropped (freed
/// buffer, failed allocation) but the bookkeeping - index and cost - is
/// retained so the checkpoint can be restored in place by a later
/// full-region replay.
pub struct Checkpoint<S: Surface> {
    pub index: usize,
    pub cost: u64,
    pub snapshot: Option<S::Snapshot>,
    pub invalid: bool,
}
impl<S: Surface> std::fmt::Debug for Checkpoint<S>
where
    S::Snapshot: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("index", &self.index)
            .field("cost", &self.cost)
            .field("snapshot", &self.snapshot)
            .field("invalid", &self.invalid)
            .finish()
    }
}
impl<S: Surface> PartialEq for Checkpoint<S>
where
    S::Snapshot: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.cost == other.cost
            && self.snapshot == other.snapshot
            && self.invalid == other.invalid
    }
}
impl<S: Surface> Checkpoint<S> {
    #[must_use]
    pub fn restorable(&self) -> bool {
        !self.invalid && self.snapshot.is_some()
    }
}

pub struct CheckpointCache<S: Surface> {
    policy: CheckpointPolicy,
    points: Vec<Checkpoint<S>>,
}
impl<S: Surface> CheckpointCache<S> {
    #[must_use]
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            points: Vec::new(),
        }
    }
    #[must_use]
    pub fn policy(&self) -> CheckpointPolicy {
        self.policy
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint<S>> + '_ {
        self.points.iter()
    }
    #[must_use]
    pub fn newest_index(&self) -> Option<usize> {
        self.points.last().map(|cp| cp.index)
    }
    #[must_use]
    pub fn total_cost(&self) -> u64 {
        self.points.iter().map(|cp| cp.cost).sum()
    }

    /// The latest restorable checkpoint at or before log position `i`.
    #[must_use]
    pub fn restore_point(&self, i: usize) -> Option<&Checkpoint<S>> {
        self.points
            .iter()
            .rev()
            .find(|cp| cp.index <= i && cp.restorable())
    }

    #[must_use]
    pub fn should_checkpoint(&self, events_since_newest: u64) -> bool {
        self.policy.budget > 0 && events_since_newest >= self.policy.interval
    }

    /// Record a fresh snapshot at `index` (the current log end), charging it
    /// the events accumulated since the previous checkpoint. Evicts down to
    /// budget afterwards.
    pub fn push(&mut self, index: usize, cost: u64, snapshot: S::Snapshot, log_len: usize) {
        debug_assert!(
            self.newest_index().map_or(true, |newest| index > newest),
            "checkpoint indices must be strictly increasing"
        );
        log::debug!("checkpoint at {index} (cost {cost})");
        self.points.push(Checkpoint {
            index,
            cost,
            snapshot: Some(snapshot),
            invalid: false,
        });
        self.evict_over_budget(log_len);
    }

    /// Evict minimal-worth checkpoints until within budget. Worth is
    /// `cost / (distance_from_log_end + 1)`: cheap-to-recreate checkpoints
    /// far from the end go first. The most recent checkpoint is never
    /// evicted; an evicted checkpoint's cost folds into its next younger
    /// neighbor so no replay cost is ever double-counted or lost.
    fn evict_over_budget(&mut self, log_len: usize) {
        while self.points.len() > self.policy.budget.max(1) {
            let candidates = &self.points[..self.points.len() - 1];
            let mut victim = 0;
            let mut best = f64::INFINITY;
            for (i, cp) in candidates.iter().enumerate() {
                let distance = log_len.saturating_sub(cp.index) as f64;
                let worth = cp.cost as f64 / (distance + 1.0);
                // Ties break toward the first found; callers must not rely
                // on which one goes.
                if worth < best {
                    best = worth;
                    victim = i;
                }
            }
            let removed = self.points.remove(victim);
            log::debug!(
                "evicting checkpoint at {} (cost {}, worth {best:.3})",
                removed.index,
                removed.cost
            );
            // Safe: the most recent checkpoint was excluded, so a younger
            // neighbor exists at the victim's old position.
            self.points[victim].cost += removed.cost;
        }
    }

    /// A log insert happened at position `p`. `counted` is true when the
    /// inserted event is non-undone, in which case the carrying checkpoint's
    /// window grew by one event.
    pub fn note_insert(&mut self, p: usize, counted: bool) {
        for cp in &mut self.points {
            if cp.index > p {
                cp.index += 1;
            }
        }
        if counted {
            if let Some(cp) = self.points.iter_mut().find(|cp| cp.index > p) {
                cp.cost += 1;
            }
        }
    }

    /// A (necessarily undone) event was spliced out at position `p`. Shifts
    /// later indices down and splices out equal-index duplicates, folding
    /// their cost forward into the survivor.
    pub fn note_remove(&mut self, p: usize) {
        for cp in &mut self.points {
            if cp.index > p {
                cp.index -= 1;
            }
        }
        let mut i = 1;
        while i < self.points.len() {
            if self.points[i - 1].index == self.points[i].index {
                // Both now describe the same log position; keep whichever
                // still has restorable data.
                let removed = if self.points[i - 1].restorable() {
                    self.points.remove(i)
                } else {
                    self.points.remove(i - 1)
                };
                self.points[i - 1].cost += removed.cost;
            } else {
                i += 1;
            }
        }
    }

    /// An event at position `p` flipped to undone: its carrying checkpoint
    /// (the first one past `p`) no longer counts it.
    pub fn note_undo(&mut self, p: usize) {
        if let Some(cp) = self.points.iter_mut().find(|cp| cp.index > p) {
            debug_assert!(cp.cost > 0, "checkpoint cost underflow");
            cp.cost = cp.cost.saturating_sub(1);
        }
    }
    /// An event at position `p` flipped back to applied.
    pub fn note_redo(&mut self, p: usize) {
        if let Some(cp) = self.points.iter_mut().find(|cp| cp.index > p) {
            cp.cost += 1;
        }
    }

    /// Replay is passing log position `k`; the live surface holds the state
    /// after `[0, k)` within `clip`. Refreshes a valid checkpoint's snapshot
    /// region so it stays exact, and fully restores an invalid one when the
    /// replay covers the whole surface.
    pub fn refresh_at(&mut self, k: usize, surface: &S, clip: PixelRect, full: bool) {
        for cp in &mut self.points {
            if cp.index != k {
                continue;
            }
            match &mut cp.snapshot {
                Some(snapshot) if !cp.invalid => surface.store(snapshot, clip),
                _ if full => match surface.snapshot() {
                    Ok(snapshot) => {
                        log::debug!("repaired checkpoint at {k}");
                        cp.snapshot = Some(snapshot);
                        cp.invalid = false;
                    }
                    Err(err) => log::warn!("cannot repair checkpoint at {k}: {err}"),
                },
                _ => {}
            }
        }
    }

    /// Drop all snapshot data, keeping index and cost bookkeeping. Used when
    /// a buffer is freed under memory pressure.
    pub fn invalidate_all(&mut self) {
        for cp in &mut self.points {
            cp.snapshot = None;
            cp.invalid = true;
        }
    }

    /// Drop checkpoints past `max_index` entirely (the log was truncated).
    pub fn truncate_past(&mut self, max_index: usize) {
        self.points.retain(|cp| cp.index <= max_index);
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::color::Color;
    use crate::raster::{CpuSurface, Surface};

    fn surface() -> CpuSurface {
        CpuSurface::new(4, 4, Color::TRANSPARENT, true).unwrap()
    }
    fn cache(budget: usize) -> CheckpointCache<CpuSurface> {
        CheckpointCache::new(CheckpointPolicy {
            budget,
            interval: 4,
        })
    }

    #[test]
    fn restore_point_picks_latest_at_or_before() {
        let s = surface();
        let mut cache = cache(4);
        cache.push(4, 4, s.snapshot().unwrap(), 4);
        cache.push(8, 4, s.snapshot().unwrap(), 8);
        cache.push(12, 4, s.snapshot().unwrap(), 12);
        assert_eq!(cache.restore_point(10).unwrap().index, 8);
        assert_eq!(cache.restore_point(8).unwrap().index, 8);
        assert_eq!(cache.restore_point(3), None);
    }

    #[test]
    fn eviction_spares_most_recent_and_folds_cost() {
        let s = surface();
        let mut cache = cache(2);
        cache.push(4, 4, s.snapshot().unwrap(), 4);
        cache.push(8, 4, s.snapshot().unwrap(), 8);
        cache.push(12, 4, s.snapshot().unwrap(), 12);
        assert_eq!(cache.len(), 2);
        // The newest survives, and the total cost is conserved.
        assert_eq!(cache.newest_index(), Some(12));
        assert_eq!(cache.total_cost(), 12);
        // Some minimal-worth checkpoint went; exactly one of the older two.
        let remaining: Vec<_> = cache.iter().map(|cp| cp.index).collect();
        assert!(remaining == vec![4, 12] || remaining == vec![8, 12]);
    }

    #[test]
    fn insert_and_remove_shift_indices() {
        let s = surface();
        let mut cache = cache(4);
        cache.push(4, 4, s.snapshot().unwrap(), 4);
        cache.push(8, 4, s.snapshot().unwrap(), 8);
        cache.note_insert(5, true);
        let indices: Vec<_> = cache.iter().map(|cp| cp.index).collect();
        assert_eq!(indices, vec![4, 9]);
        assert_eq!(cache.total_cost(), 9);
        cache.note_remove(5);
        let indices: Vec<_> = cache.iter().map(|cp| cp.index).collect();
        assert_eq!(indices, vec![4, 8]);
    }

    #[test]
    fn remove_splices_equal_index_duplicates() {
        let s = surface();
        let mut cache = cache(4);
        cache.push(4, 4, s.snapshot().unwrap(), 4);
        cache.push(5, 1, s.snapshot().unwrap(), 5);
        cache.note_remove(4);
        assert_eq!(cache.len(), 1);
        let cp = cache.iter().next().unwrap();
        assert_eq!(cp.index, 4);
        assert_eq!(cp.cost, 5);
        assert!(cp.restorable());
    }

    #[test]
    fn undo_redo_track_cost() {
        let s = surface();
        let mut cache = cache(4);
        cache.push(4, 4, s.snapshot().unwrap(), 4);
        cache.note_undo(2);
        assert_eq!(cache.total_cost(), 3);
        cache.note_redo(2);
        assert_eq!(cache.total_cost(), 4);
        // Past the newest checkpoint, nothing carries the event.
        cache.note_undo(7);
        assert_eq!(cache.total_cost(), 4);
    }

    #[test]
    fn invalidate_keeps_bookkeeping() {
        let s = surface();
        let mut cache = cache(4);
        cache.push(4, 4, s.snapshot().unwrap(), 4);
        cache.invalidate_all();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 4);
        assert!(cache.restore_point(4).is_none());
        // A full-region replay crossing the index repairs it.
        cache.refresh_at(4, &s, s.rect(), true);
        assert!(cache.restore_point(4).is_some());
    }
}
