use crate::error::{HarnessErr, Result};

/// A single supervised sample borrowed from a dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample<'a> {
    pub x: &'a [f32],
    pub y: &'a [f32],
}

/// Random access over fixed-width samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The amount of features of every sample.
    fn x_size(&self) -> usize;

    /// The amount of targets of every sample.
    fn y_size(&self) -> usize;

    /// Returns the sample at `idx` (panics if out of bounds).
    fn sample(&self, idx: usize) -> Sample<'_>;
}

/// A dataset held in two flat row-major buffers.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    xs: Vec<f32>,
    ys: Vec<f32>,
    x_size: usize,
    y_size: usize,
}

impl InMemoryDataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Arguments
    /// * `xs` - The features, `x_size` per sample.
    /// * `ys` - The targets, `y_size` per sample.
    ///
    /// # Returns
    /// A `Config` error if the buffers don't describe the same amount of whole samples.
    pub fn new(xs: Vec<f32>, ys: Vec<f32>, x_size: usize, y_size: usize) -> Result<Self> {
        if x_size == 0 || y_size == 0 {
            return Err(HarnessErr::Config(
                "samples must have at least one feature and one target".to_string(),
            ));
        }

        if xs.len() % x_size != 0 || ys.len() % y_size != 0 || xs.len() / x_size != ys.len() / y_size
        {
            return Err(HarnessErr::Config(format!(
                "{} features of width {x_size} don't match {} targets of width {y_size}",
                xs.len(),
                ys.len()
            )));
        }

        Ok(Self {
            xs,
            ys,
            x_size,
            y_size,
        })
    }

    #[inline]
    pub fn xs(&self) -> &[f32] {
        &self.xs
    }

    #[inline]
    pub fn ys(&self) -> &[f32] {
        &self.ys
    }
}

impl Dataset for InMemoryDataset {
    #[inline]
    fn len(&self) -> usize {
        self.xs.len() / self.x_size
    }

    fn x_size(&self) -> usize {
        self.x_size
    }

    fn y_size(&self) -> usize {
        self.y_size
    }

    #[inline]
    fn sample(&self, idx: usize) -> Sample<'_> {
        let Self {
            xs,
            ys,
            x_size,
            y_size,
        } = self;

        Sample {
            x: &xs[idx * x_size..(idx + 1) * x_size],
            y: &ys[idx * y_size..(idx + 1) * y_size],
        }
    }
}

/// Borrowed batch view over a loader's transfer buffers.
#[derive(Debug, Clone, Copy)]
pub struct BatchRef<'a> {
    pub xs: &'a [f32],
    pub ys: &'a [f32],
    pub x_size: usize,
    pub y_size: usize,
}

impl BatchRef<'_> {
    /// The amount of samples in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.xs.len() / self.x_size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_basic() {
        let ds = InMemoryDataset::new(vec![1.0, 2.0, 3.0, 4.0], vec![3.0, 5.0], 2, 1).unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(
            ds.sample(1),
            Sample {
                x: &[3.0, 4.0],
                y: &[5.0]
            }
        );
    }

    #[test]
    fn dataset_rejects_ragged_buffers() {
        assert!(InMemoryDataset::new(vec![1.0, 2.0, 3.0], vec![1.0], 2, 1).is_err());
        assert!(InMemoryDataset::new(vec![1.0, 2.0], vec![1.0, 2.0], 1, 0).is_err());
        assert!(InMemoryDataset::new(vec![1.0, 2.0], vec![1.0], 1, 1).is_err());
    }
}
