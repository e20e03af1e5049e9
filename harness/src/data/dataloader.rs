use std::{num::NonZeroUsize, sync::Arc};

use super::{
    dataset::{BatchRef, Dataset},
    sampler::ShardSampler,
};

/// Shard-aware loader producing fixed-size batches of this rank's share of the dataset.
///
/// Batches are gathered into transfer buffers owned by the loader and reused across batches.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    sampler: ShardSampler,
    batch_size: NonZeroUsize,
    indices: Vec<usize>,
    cursor: usize,
    xs: Vec<f32>,
    ys: Vec<f32>,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn Dataset>, sampler: ShardSampler, batch_size: NonZeroUsize) -> Self {
        let indices = sampler.indices();
        let capacity = batch_size.get();

        Self {
            xs: Vec::with_capacity(capacity * dataset.x_size()),
            ys: Vec::with_capacity(capacity * dataset.y_size()),
            dataset,
            sampler,
            batch_size,
            indices,
            cursor: 0,
        }
    }

    #[inline]
    pub fn sampler(&self) -> &ShardSampler {
        &self.sampler
    }

    #[inline]
    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size.get()
    }

    /// The amount of samples this rank sees per epoch.
    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The amount of batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size.get())
    }

    /// Reshuffles this rank's share for `epoch` and rewinds the loader.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.sampler.set_epoch(epoch);
        self.indices = self.sampler.indices();
        self.cursor = 0;
    }

    #[inline]
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Returns the next batch for this shard, or None if the epoch is exhausted.
    pub fn next_batch(&mut self) -> Option<BatchRef<'_>> {
        if self.cursor >= self.indices.len() {
            return None;
        }

        let end = (self.cursor + self.batch_size.get()).min(self.indices.len());

        self.xs.clear();
        self.ys.clear();
        for &idx in &self.indices[self.cursor..end] {
            let sample = self.dataset.sample(idx);
            self.xs.extend_from_slice(sample.x);
            self.ys.extend_from_slice(sample.y);
        }

        self.cursor = end;
        Some(BatchRef {
            xs: &self.xs,
            ys: &self.ys,
            x_size: self.dataset.x_size(),
            y_size: self.dataset.y_size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryDataset;

    fn dataset(len: usize) -> Arc<dyn Dataset> {
        Arc::new(
            InMemoryDataset::new(
                (0..len).map(|i| i as f32).collect(),
                (0..len).map(|i| i as f32 + 100.0).collect(),
                1,
                1,
            )
            .unwrap(),
        )
    }

    #[test]
    fn batches_respect_shard_and_batch_size() {
        let sampler = ShardSampler::new(10, 2, 1).with_shuffle(false, 0); // 1, 3, 5, 7, 9
        let mut dl = DataLoader::new(dataset(10), sampler, NonZeroUsize::new(2).unwrap());

        assert_eq!(dl.len(), 5);
        assert_eq!(dl.num_batches(), 3);

        let b1 = dl.next_batch().unwrap();
        assert_eq!(b1.xs, &[1.0, 3.0]);
        assert_eq!(b1.ys, &[101.0, 103.0]);

        let b2 = dl.next_batch().unwrap();
        assert_eq!(b2.xs, &[5.0, 7.0]);

        let b3 = dl.next_batch().unwrap();
        assert_eq!(b3.xs, &[9.0]);
        assert_eq!(b3.len(), 1);

        assert!(dl.next_batch().is_none());

        dl.reset();
        let b4 = dl.next_batch().unwrap();
        assert_eq!(b4.xs, &[1.0, 3.0]);
    }

    #[test]
    fn set_epoch_rewinds() {
        let sampler = ShardSampler::new(8, 1, 0).with_shuffle(true, 5);
        let mut dl = DataLoader::new(dataset(8), sampler, NonZeroUsize::new(8).unwrap());

        while dl.next_batch().is_some() {}
        dl.set_epoch(1);

        let batch = dl.next_batch().unwrap();
        let mut seen = batch.xs.to_vec();
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, (0..8).map(|i| i as f32).collect::<Vec<_>>());
    }
}
