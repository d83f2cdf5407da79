//! Cheap detection of network weight changes between ticks.
//!
//! In the default sampled mode a check first compares the first element of
//! each weight matrix; if both match the weights are assumed unchanged. Only
//! when they differ is a positional hash over 16 evenly spaced samples (plus
//! the matrix length) computed, and only a hash mismatch marks the agent as
//! changed. Edits that leave both first elements alone therefore go
//! unnoticed. [`WeightCheck::Exact`] hashes every weight on every check.

use std::collections::{HashMap, HashSet};

use crate::config::WeightCheck;
use crate::types::Brain;

const SAMPLES: usize = 16;
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    first: [u32; 2],
    hash: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WeightCacheStats {
    pub checks: u64,
    pub changed: u64,
    pub hashes_computed: u64,
}

#[derive(Debug, Default)]
pub struct WeightCache {
    mode: WeightCheck,
    entries: HashMap<u64, Snapshot>,
    stats: WeightCacheStats,
}

fn fnv(hash: u64, value: u64) -> u64 {
    (hash ^ value).wrapping_mul(FNV_PRIME)
}

fn first_bits(weights: &[f32]) -> u32 {
    weights.first().map_or(0, |w| w.to_bits())
}

fn sampled_hash(hash: u64, weights: &[f32]) -> u64 {
    let mut hash = fnv(hash, weights.len() as u64);
    if weights.is_empty() {
        return hash;
    }
    let count = SAMPLES.min(weights.len());
    for k in 0..count {
        let position = k * weights.len() / count;
        hash = fnv(hash, position as u64);
        hash = fnv(hash, u64::from(weights[position].to_bits()));
    }
    hash
}

fn exact_hash(hash: u64, weights: &[f32]) -> u64 {
    weights
        .iter()
        .fold(fnv(hash, weights.len() as u64), |h, w| fnv(h, u64::from(w.to_bits())))
}

impl WeightCache {
    #[must_use]
    pub fn new(mode: WeightCheck) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn mode(&self) -> WeightCheck {
        self.mode
    }

    fn hash(&mut self, brain: &Brain) -> u64 {
        self.stats.hashes_computed += 1;
        match self.mode {
            WeightCheck::Sampled => {
                sampled_hash(sampled_hash(FNV_OFFSET, &brain.weights1), &brain.weights2)
            }
            WeightCheck::Exact => exact_hash(exact_hash(FNV_OFFSET, &brain.weights1), &brain.weights2),
        }
    }

    /// Returns `true` when `brain` differs from what was seen for `id` on the
    /// previous check, and remembers the new state. The first check of an id
    /// always reports a change.
    pub fn check(&mut self, id: u64, brain: &Brain) -> bool {
        self.stats.checks += 1;
        let first = [first_bits(&brain.weights1), first_bits(&brain.weights2)];
        let updated = match self.entries.get(&id).copied() {
            Some(previous) if self.mode == WeightCheck::Sampled && previous.first == first => None,
            Some(previous) => {
                let hash = self.hash(brain);
                (hash != previous.hash).then_some(hash)
            }
            None => Some(self.hash(brain)),
        };
        let Some(hash) = updated else {
            return false;
        };
        self.entries.insert(id, Snapshot { first, hash });
        self.stats.changed += 1;
        true
    }

    pub fn forget(&mut self, id: u64) {
        self.entries.remove(&id);
    }

    /// Drops every entry whose id is not in `live`.
    pub fn retain(&mut self, live: &HashSet<u64>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| live.contains(id));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> WeightCacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArchitectureKey;

    fn brain() -> Brain {
        let key = ArchitectureKey::new(20, 8, 4);
        let mut brain = Brain::zeroed(key);
        for (i, w) in brain.weights1.iter_mut().enumerate() {
            *w = i as f32 * 0.01;
        }
        for (i, w) in brain.weights2.iter_mut().enumerate() {
            *w = -(i as f32) * 0.02;
        }
        brain
    }

    #[test]
    fn first_check_reports_change() {
        let mut cache = WeightCache::new(WeightCheck::Sampled);
        let brain = brain();
        assert!(cache.check(1, &brain));
        assert!(!cache.check(1, &brain));
        assert!(!cache.check(1, &brain));
        assert!(cache.check(2, &brain));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn first_element_change_is_detected() {
        let mut cache = WeightCache::new(WeightCheck::Sampled);
        let mut brain = brain();
        cache.check(1, &brain);
        brain.weights2[0] = 3.0;
        assert!(cache.check(1, &brain));
        assert!(!cache.check(1, &brain));
    }

    #[test]
    fn exact_mode_sees_every_edit() {
        let mut cache = WeightCache::new(WeightCheck::Exact);
        let mut brain = brain();
        cache.check(1, &brain);
        brain.weights1[101] += 0.5;
        assert!(cache.check(1, &brain));
        assert!(!cache.check(1, &brain));
        brain.weights2.push(0.0);
        assert!(cache.check(1, &brain));
    }

    #[test]
    fn interior_edit_is_missed_by_sampled_mode() {
        let mut brain = brain();
        let mut sampled = WeightCache::new(WeightCheck::Sampled);
        sampled.check(1, &brain);
        let hashes = sampled.stats().hashes_computed;
        brain.weights1[57] = 42.0;
        assert!(!sampled.check(1, &brain));
        // the fast path never touched the hash
        assert_eq!(sampled.stats().hashes_computed, hashes);
    }

    #[test]
    fn empty_matrices_are_stable() {
        let mut cache = WeightCache::new(WeightCheck::Sampled);
        let brain = Brain::zeroed(ArchitectureKey::new(0, 0, 0));
        assert!(cache.check(9, &brain));
        assert!(!cache.check(9, &brain));
    }

    #[test]
    fn maintenance() {
        let mut cache = WeightCache::new(WeightCheck::Sampled);
        let brain = brain();
        for id in 0..4 {
            cache.check(id, &brain);
        }
        cache.forget(0);
        assert!(cache.check(0, &brain));
        let live: HashSet<u64> = [1, 2].into_iter().collect();
        assert_eq!(cache.retain(&live), 2);
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().checks, 5);
    }
}
