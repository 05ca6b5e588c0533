//! Global structure counters, shared by every tree in the process. Compiled
//! to no-ops without the `stats` feature.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::cell::CELL_MAX_NODES;

static CELLS: AtomicU32 = AtomicU32::new(0);
static PUSHDOWNS: AtomicU32 = AtomicU32::new(0);
static SPLITS: AtomicU32 = AtomicU32::new(0);
static PUSHUPS: AtomicU32 = AtomicU32::new(0);
static MERGEUPS: AtomicU32 = AtomicU32::new(0);
static FAILED_MERGES: AtomicU32 = AtomicU32::new(0);
static SHORTCUTS: AtomicU32 = AtomicU32::new(0);

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU32 = AtomicU32::new(0);
/// Cells grouped by occupancy at the time they are destroyed; `[n]` counts
/// cells that died holding `n + 1` nodes. An autopsy, not a live census.
static POPDIST: [AtomicU32; CELL_MAX_NODES] = [ZERO; CELL_MAX_NODES];

/// Snapshot of the counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub cells: u32,
    pub pushdowns: u32,
    pub splits: u32,
    pub pushups: u32,
    pub mergeups: u32,
    pub failed_merges: u32,
    pub shortcuts: u32,
    pub popdist: [u32; CELL_MAX_NODES],
}

impl Stats {
    pub fn snapshot() -> Stats {
        let mut popdist = [0; CELL_MAX_NODES];
        for (out, c) in popdist.iter_mut().zip(POPDIST.iter()) {
            *out = c.load(Ordering::Relaxed);
        }
        Stats {
            cells: CELLS.load(Ordering::Relaxed),
            pushdowns: PUSHDOWNS.load(Ordering::Relaxed),
            splits: SPLITS.load(Ordering::Relaxed),
            pushups: PUSHUPS.load(Ordering::Relaxed),
            mergeups: MERGEUPS.load(Ordering::Relaxed),
            failed_merges: FAILED_MERGES.load(Ordering::Relaxed),
            shortcuts: SHORTCUTS.load(Ordering::Relaxed),
            popdist,
        }
    }

    /// Zero every counter except the live-cell census.
    pub fn reset() {
        for c in [
            &PUSHDOWNS,
            &SPLITS,
            &PUSHUPS,
            &MERGEUPS,
            &FAILED_MERGES,
            &SHORTCUTS,
        ] {
            c.store(0, Ordering::Relaxed);
        }
        for c in POPDIST.iter() {
            c.store(0, Ordering::Relaxed);
        }
    }
}

fn bump(counter: &AtomicU32) {
    #[cfg(feature = "stats")]
    counter.fetch_add(1, Ordering::Relaxed);
    #[cfg(not(feature = "stats"))]
    let _ = counter;
}

pub(crate) fn count_cell_alloc() {
    bump(&CELLS);
}

pub(crate) fn count_cell_free() {
    #[cfg(feature = "stats")]
    CELLS.fetch_sub(1, Ordering::Relaxed);
}

pub(crate) fn count_pushdown() {
    bump(&PUSHDOWNS);
}

pub(crate) fn count_split() {
    bump(&SPLITS);
}

pub(crate) fn count_pushup() {
    bump(&PUSHUPS);
}

pub(crate) fn count_mergeup() {
    bump(&MERGEUPS);
}

pub(crate) fn count_failed_merge() {
    bump(&FAILED_MERGES);
}

pub(crate) fn count_shortcut() {
    bump(&SHORTCUTS);
}

/// Record the population of a cell as the tree tears it down.
pub(crate) fn count_popdist(pop: usize) {
    #[cfg(feature = "stats")]
    POPDIST[pop - 1].fetch_add(1, Ordering::Relaxed);
    #[cfg(not(feature = "stats"))]
    let _ = pop;
}
