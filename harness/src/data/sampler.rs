use std::fmt;

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

/// The padding applied when the dataset does not split evenly across the group.
///
/// Every rank gets `ceil(len / world_size)` samples; the missing tail is filled by wrapping
/// around to the start of the (possibly shuffled) index list, so `padding` samples are seen twice
/// per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSkew {
    pub len: usize,
    pub world_size: usize,
    pub padding: usize,
}

impl fmt::Display for PartitionSkew {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} samples don't split evenly across {} ranks, duplicating {}",
            self.len, self.world_size, self.padding
        )
    }
}

/// Rank-aware sampler yielding this rank's non-overlapping share of the dataset indices.
///
/// Ranks take indices strided by the world size, every rank computes the same permutation for a
/// given seed and epoch so the shares stay disjoint.
#[derive(Debug, Clone)]
pub struct ShardSampler {
    len: usize,
    world_size: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl ShardSampler {
    /// Creates a new `ShardSampler`.
    ///
    /// # Panics
    /// If `world_size` is zero or `rank` is not below it.
    pub fn new(len: usize, world_size: usize, rank: usize) -> Self {
        assert!(world_size > 0, "world_size must be > 0");
        assert!(rank < world_size, "rank out of range");

        Self {
            len,
            world_size,
            rank,
            shuffle: true,
            seed: 0,
            epoch: 0,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool, seed: u64) -> Self {
        self.shuffle = shuffle;
        self.seed = seed;
        self
    }

    /// Changes the permutation used by the next `indices` call.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// The amount of indices each rank receives.
    #[inline]
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.num_samples() * self.world_size
    }

    /// The remainder policy applied, if the dataset doesn't split evenly.
    pub fn skew(&self) -> Option<PartitionSkew> {
        let padding = self.total_size() - self.len;

        (padding > 0 && self.len > 0).then_some(PartitionSkew {
            len: self.len,
            world_size: self.world_size,
            padding,
        })
    }

    /// This rank's indices for the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let mut all: Vec<usize> = (0..self.len).collect();

        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            all.shuffle(&mut rng);
        }

        let total = self.total_size();
        let mut i = 0;
        while all.len() < total {
            all.push(all[i % self.len]);
            i += 1;
        }

        all.into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn shares(len: usize, world_size: usize, shuffle: bool) -> Vec<Vec<usize>> {
        (0..world_size)
            .map(|rank| {
                ShardSampler::new(len, world_size, rank)
                    .with_shuffle(shuffle, 1640)
                    .indices()
            })
            .collect()
    }

    #[test]
    fn even_split_is_disjoint_and_covering() {
        let shares = shares(12, 3, true);

        let mut seen = HashSet::new();
        for share in &shares {
            assert_eq!(share.len(), 4);
            for idx in share {
                assert!(seen.insert(*idx), "index {idx} assigned twice");
            }
        }

        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn uneven_split_duplicates_the_remainder() {
        let sampler = ShardSampler::new(10, 4, 0);
        assert_eq!(
            sampler.skew(),
            Some(PartitionSkew {
                len: 10,
                world_size: 4,
                padding: 2
            })
        );

        let shares = shares(10, 4, false);
        assert!(shares.iter().all(|s| s.len() == 3));

        let all: Vec<usize> = shares.iter().flatten().copied().collect();
        let unique: HashSet<usize> = all.iter().copied().collect();
        assert_eq!(unique.len(), 10);
        assert_eq!(all.len() - unique.len(), 2);
    }

    #[test]
    fn unshuffled_shares_are_strided() {
        let shares = shares(6, 2, false);
        assert_eq!(shares[0], vec![0, 2, 4]);
        assert_eq!(shares[1], vec![1, 3, 5]);
    }

    #[test]
    fn epochs_change_the_permutation_consistently() {
        let mut a = ShardSampler::new(64, 2, 0).with_shuffle(true, 3);
        let mut b = ShardSampler::new(64, 2, 1).with_shuffle(true, 3);

        let first = a.indices();
        a.set_epoch(1);
        b.set_epoch(1);
        assert_ne!(first, a.indices());

        let (a, b): (HashSet<_>, HashSet<_>) =
            (a.indices().into_iter().collect(), b.indices().into_iter().collect());
        assert!(a.is_disjoint(&b));
        assert_eq!(a.len() + b.len(), 64);
    }

    #[test]
    fn even_split_reports_no_skew() {
        assert!(ShardSampler::new(8, 4, 1).skew().is_none());
    }
}
