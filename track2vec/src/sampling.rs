//! Frequency-proportional negative sampling.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use rand::Rng;
use tracing::debug;

use crate::error::{Error, Result};
use crate::real;

/// Number of slots in the table used for training.
pub const NEGATIVE_TABLE_SIZE: usize = 10_000_000;

/// A table of track indices in which each track occupies a number of slots
/// proportional to `count^0.5`. Drawing a uniform slot draws a track from the
/// smoothed unigram distribution.
pub struct NegativeTable {
    table: Vec<u32>,
    /// Slots held by each track, by track index.
    slots: Vec<u32>,
    /// Number of tracks with at least one slot.
    distinct: usize,
}

impl NegativeTable {
    /// Builds a table of exactly `capacity` slots from per-track counts.
    ///
    /// Every track with a nonzero count gets at least one slot; tracks with a
    /// zero count get none. Fails if `capacity` is smaller than the number of
    /// tracks that need a slot.
    pub fn new(counts: &[u64], capacity: usize) -> Result<Self> {
        let nonzero = counts.iter().filter(|&&c| c > 0).count();
        if nonzero > capacity {
            return Err(Error::SamplingTableTooSmall {
                capacity,
                tracks: nonzero,
            });
        }
        if nonzero == 0 {
            return Ok(NegativeTable {
                table: vec![],
                slots: vec![0; counts.len()],
                distinct: 0,
            });
        }

        let weights: Vec<real> = counts.iter().map(|&c| (c as real).sqrt()).collect();
        let total_weight: real = weights.iter().sum();
        let shares: Vec<real> = weights
            .iter()
            .map(|w| w * capacity as real / total_weight)
            .collect();

        let mut slots: Vec<u32> = counts
            .iter()
            .zip(&shares)
            .map(|(&c, &share)| {
                if c == 0 {
                    0
                } else {
                    (share.floor() as u32).max(1)
                }
            })
            .collect();
        let assigned: usize = slots.iter().map(|&s| s as usize).sum();

        if assigned < capacity {
            // Largest remainder first.
            let mut order: Vec<usize> = (0..counts.len()).filter(|&i| counts[i] > 0).collect();
            order.sort_by(|&a, &b| {
                let fa = shares[a] - shares[a].floor();
                let fb = shares[b] - shares[b].floor();
                fb.total_cmp(&fa).then(a.cmp(&b))
            });
            let mut missing = capacity - assigned;
            for &i in order.iter().cycle() {
                if missing == 0 {
                    break;
                }
                slots[i] += 1;
                missing -= 1;
            }
        } else if assigned > capacity {
            // The one-slot minimum overshot; take slots back from the largest
            // holders.
            let mut heap: BinaryHeap<(u32, Reverse<usize>)> = slots
                .iter()
                .enumerate()
                .filter(|&(_, &s)| s > 1)
                .map(|(i, &s)| (s, Reverse(i)))
                .collect();
            let mut excess = assigned - capacity;
            while excess > 0 {
                let Some((s, Reverse(i))) = heap.pop() else {
                    break;
                };
                slots[i] = s - 1;
                excess -= 1;
                if s - 1 > 1 {
                    heap.push((s - 1, Reverse(i)));
                }
            }
        }

        let mut table = Vec::with_capacity(capacity);
        for (i, &n) in slots.iter().enumerate() {
            table.extend(std::iter::repeat(i as u32).take(n as usize));
        }
        debug_assert_eq!(table.len(), capacity);
        debug!(
            "negative sampling table: {} slots over {nonzero} tracks",
            table.len()
        );

        Ok(NegativeTable {
            table,
            slots,
            distinct: nonzero,
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of slots held by `track`.
    pub fn slots(&self, track: usize) -> usize {
        self.slots.get(track).map_or(0, |&s| s as usize)
    }

    /// Draws a track. Returns `None` only for an empty table.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        if self.table.is_empty() {
            return None;
        }
        Some(self.table[rng.gen_range(0..self.table.len())] as usize)
    }

    /// True if every track in the table is in `excluded`, so that no draw
    /// could ever avoid it.
    pub fn covered_by(&self, excluded: &BTreeSet<usize>) -> bool {
        excluded.iter().filter(|&&t| self.slots(t) > 0).count() == self.distinct
    }

    /// Draws tracks until one is not in `excluded`.
    ///
    /// Loops forever if [`covered_by`](Self::covered_by) holds; callers check
    /// that first.
    pub fn sample_excluding<R: Rng>(&self, rng: &mut R, excluded: &BTreeSet<usize>) -> Option<usize> {
        loop {
            let track = self.sample(rng)?;
            if !excluded.contains(&track) {
                return Some(track);
            }
        }
    }
}
