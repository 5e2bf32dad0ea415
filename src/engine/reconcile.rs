//! Snapshot + diff-stream reconciliation.
//!
//! Bootstrap: buffer diffs while the snapshot is in flight, drop everything
//! the snapshot already covers, seed the book, replay the rest, then apply
//! on receipt. Any sequence gap abandons the book; the owner restarts the
//! bootstrap with a fresh epoch.
//!
//! Gap rule: a diff is discontinuous only when its range starts past
//! `last_applied + 1` *and* its `prev_final_update_id` does not vouch for
//! continuity (absent, or different from `last_applied`).

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::engine::book::LocalBook;
use crate::engine::types::{DiffEvent, OrderBookSnapshot};

/// Result of offering one diff to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Held until the snapshot arrives.
    Buffered,
    Applied { last_applied_id: u64 },
    /// Already covered by the book; dropped.
    Stale,
    /// Updates were lost. The book has been abandoned.
    Gap(SequenceGap),
}

/// Result of offering a snapshot to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOutcome {
    Live { dropped: usize, replayed: usize, last_applied_id: u64 },
    /// Belongs to an earlier bootstrap, or no bootstrap is waiting for it.
    Ignored,
    Gap(SequenceGap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub last_applied_id: u64,
    pub first_update_id: u64,
    pub prev_final_update_id: Option<u64>,
}

impl std::fmt::Display for SequenceGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sequence gap: last applied {}, next diff starts at {} (pu {:?})",
            self.last_applied_id, self.first_update_id, self.prev_final_update_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No bootstrap started, or the last book was abandoned.
    Idle,
    Buffering,
    Live,
}

/// Single-writer owner of one [`LocalBook`].
#[derive(Debug)]
pub struct Reconciler {
    epoch: u64,
    phase: Phase,
    buffer: VecDeque<DiffEvent>,
    max_buffered: usize,
    book: LocalBook,
}

impl Reconciler {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            epoch: 0,
            phase: Phase::Idle,
            buffer: VecDeque::new(),
            max_buffered: max_buffered.max(1),
            book: LocalBook::empty(),
        }
    }

    /// Discard the current book and start buffering for a new snapshot.
    /// Returns the epoch the snapshot must be tagged with.
    pub fn begin_bootstrap(&mut self) -> u64 {
        self.epoch += 1;
        self.phase = Phase::Buffering;
        self.buffer.clear();
        self.book = LocalBook::empty();
        debug!(epoch = self.epoch, "bootstrap started");
        self.epoch
    }

    /// Retire the book without starting a new bootstrap. Any in-flight
    /// snapshot is ignored when it lands.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.phase = Phase::Idle;
        self.buffer.clear();
        self.book = LocalBook::empty();
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The book, only once it has been seeded and is being kept current.
    pub fn book(&self) -> Option<&LocalBook> {
        match self.phase {
            Phase::Live => Some(&self.book),
            _ => None,
        }
    }

    pub fn on_diff(&mut self, diff: DiffEvent) -> DiffOutcome {
        match self.phase {
            Phase::Idle => DiffOutcome::Stale,
            Phase::Buffering => {
                if self.buffer.len() >= self.max_buffered {
                    // the seed-time gap check catches it if this one was needed
                    if let Some(dropped) = self.buffer.pop_front() {
                        warn!(
                            final_update_id = dropped.final_update_id,
                            max = self.max_buffered,
                            "bootstrap buffer full, dropping oldest diff"
                        );
                    }
                }
                self.buffer.push_back(diff);
                DiffOutcome::Buffered
            }
            Phase::Live => self.apply_validated(&diff),
        }
    }

    pub fn on_snapshot(&mut self, epoch: u64, snapshot: &OrderBookSnapshot) -> SeedOutcome {
        if epoch != self.epoch || self.phase != Phase::Buffering {
            debug!(epoch, current = self.epoch, "ignoring snapshot from a retired bootstrap");
            return SeedOutcome::Ignored;
        }

        let seed_id = snapshot.last_update_id;
        let before = self.buffer.len();
        self.buffer.retain(|d| d.final_update_id > seed_id);
        let dropped = before - self.buffer.len();

        self.book = LocalBook::from_snapshot(snapshot);
        self.phase = Phase::Live;

        let pending: Vec<DiffEvent> = self.buffer.drain(..).collect();
        let mut replayed = 0;
        for diff in &pending {
            match self.apply_validated(diff) {
                DiffOutcome::Applied { .. } => replayed += 1,
                DiffOutcome::Gap(gap) => return SeedOutcome::Gap(gap),
                _ => {}
            }
        }

        debug!(
            epoch,
            snapshot_id = seed_id,
            dropped,
            replayed,
            last_applied_id = self.book.last_applied_id(),
            "book seeded"
        );
        SeedOutcome::Live { dropped, replayed, last_applied_id: self.book.last_applied_id() }
    }

    fn apply_validated(&mut self, diff: &DiffEvent) -> DiffOutcome {
        let last = self.book.last_applied_id();
        if diff.final_update_id <= last {
            trace!(final_update_id = diff.final_update_id, last, "stale diff");
            return DiffOutcome::Stale;
        }
        if is_gap(last, diff) {
            let gap = SequenceGap {
                last_applied_id: last,
                first_update_id: diff.first_update_id,
                prev_final_update_id: diff.prev_final_update_id,
            };
            warn!(%gap, "abandoning book");
            self.phase = Phase::Idle;
            self.buffer.clear();
            self.book = LocalBook::empty();
            return DiffOutcome::Gap(gap);
        }
        // the whole diff lands in one synchronous step
        self.book.apply_diff(diff);
        DiffOutcome::Applied { last_applied_id: self.book.last_applied_id() }
    }
}

/// `diff` cannot follow `last_applied` without missing updates.
pub fn is_gap(last_applied: u64, diff: &DiffEvent) -> bool {
    let range_gap = diff.first_update_id > last_applied.saturating_add(1);
    let chain_vouches = diff.prev_final_update_id == Some(last_applied);
    range_gap && !chain_vouches
}
