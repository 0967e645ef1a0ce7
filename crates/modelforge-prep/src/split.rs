//! Deterministic train/validation/test splitting.
//!
//! Shuffling uses a 31-bit linear-congruential generator so the same seed
//! and row ordering reproduce the same split on every run and platform.

use std::collections::BTreeMap;

const LCG_MULTIPLIER: u64 = 1_103_515_245;
const LCG_INCREMENT: u64 = 12_345;
const LCG_MODULUS: u64 = 1 << 31;

/// Minimal seeded PRNG for reproducible shuffles.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed % LCG_MODULUS,
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = (self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT))
            % LCG_MODULUS;
        self.state as u32
    }

    /// Uniform value in `0..bound`. `bound` must be non-zero.
    pub fn next_below(&mut self, bound: usize) -> usize {
        (self.next_u32() as usize) % bound
    }

    /// In-place Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.next_below(i + 1);
            items.swap(i, j);
        }
    }
}

/// Index assignment of one split pass.
#[derive(Debug, Clone, Default)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

impl SplitIndices {
    pub fn total(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }
}

fn partition(shuffled: &[usize], out: &mut SplitIndices) {
    // 80/10/10 with floor on the two small shares keeps every class's
    // allocation within one row of the exact ratio.
    let n = shuffled.len();
    let val = n / 10;
    let test = n / 10;
    let train = n - val - test;
    out.train.extend_from_slice(&shuffled[..train]);
    out.validation.extend_from_slice(&shuffled[train..train + val]);
    out.test.extend_from_slice(&shuffled[train + val..]);
}

/// Shuffle-and-split the whole index range 80/10/10.
pub fn plain_split(row_count: usize, seed: u64) -> SplitIndices {
    let mut indices: Vec<usize> = (0..row_count).collect();
    let mut rng = Lcg::new(seed);
    rng.shuffle(&mut indices);
    let mut out = SplitIndices::default();
    partition(&indices, &mut out);
    out
}

/// Stratified split: rows are grouped by target label, each group is
/// shuffled and split 80/10/10 independently. Groups are visited in sorted
/// label order so the result is independent of map iteration order.
pub fn stratified_split(labels: &[String], seed: u64) -> SplitIndices {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, label) in labels.iter().enumerate() {
        groups.entry(label.as_str()).or_default().push(idx);
    }

    let mut rng = Lcg::new(seed);
    let mut out = SplitIndices::default();
    for (_, mut indices) in groups {
        rng.shuffle(&mut indices);
        partition(&indices, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcg_sequence_is_reproducible() {
        let mut a = Lcg::new(42);
        let mut b = Lcg::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn plain_split_is_deterministic_and_complete() {
        let a = plain_split(100, 7);
        let b = plain_split(100, 7);
        assert_eq!(a.train, b.train);
        assert_eq!(a.validation, b.validation);
        assert_eq!(a.test, b.test);
        assert_eq!(a.total(), 100);
        assert_eq!(a.train.len(), 80);
        assert_eq!(a.validation.len(), 10);
        assert_eq!(a.test.len(), 10);
    }

    #[test]
    fn different_seed_changes_assignment() {
        let a = plain_split(50, 1);
        let b = plain_split(50, 2);
        assert_ne!(a.train, b.train);
    }

    #[test]
    fn stratified_split_keeps_class_ratios() {
        // 60 of class "a", 40 of class "b".
        let labels: Vec<String> = (0..100)
            .map(|i| if i < 60 { "a".into() } else { "b".into() })
            .collect();
        let split = stratified_split(&labels, 42);
        assert_eq!(split.total(), 100);

        let count = |ids: &[usize], class: &str| {
            ids.iter().filter(|&&i| labels[i] == class).count() as i64
        };
        // Each class train/val/test within +-1 of 80/10/10 of its size.
        assert!((count(&split.train, "a") - 48).abs() <= 1);
        assert!((count(&split.validation, "a") - 6).abs() <= 1);
        assert!((count(&split.test, "a") - 6).abs() <= 1);
        assert!((count(&split.train, "b") - 32).abs() <= 1);
        assert!((count(&split.validation, "b") - 4).abs() <= 1);
        assert!((count(&split.test, "b") - 4).abs() <= 1);
    }

    #[test]
    fn tiny_groups_go_entirely_to_train() {
        let labels: Vec<String> = vec!["x".into(); 4];
        let split = stratified_split(&labels, 9);
        assert_eq!(split.train.len(), 4);
        assert!(split.validation.is_empty());
        assert!(split.test.is_empty());
    }
}
