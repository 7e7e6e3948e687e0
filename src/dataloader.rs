//! Data loader

use rand::{SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{datasets::SampleSet, tensor::Tensor};

/// Errors for the dataloader
#[derive(Debug, Error, PartialEq)]
pub enum DataLoaderError {
    #[error("Batch size must be positive")]
    InvalidBatchSize,
    #[error("{n_samples} samples cannot fill a single batch of {batch_size}")]
    NotEnoughSamples { n_samples: usize, batch_size: usize },
}

/// A finite sequence of fixed size batches that can be restarted every epoch
pub trait BatchSource {
    /// Starts a new epoch, returning its batches in order
    fn epoch(&mut self) -> Box<dyn Iterator<Item = Tensor> + '_>;
    /// Number of batches every epoch yields
    fn n_batches(&self) -> usize;
    fn n_samples(&self) -> usize;
}

/// Decides the order samples are visited in within an epoch
pub trait ShuffleStrategy {
    fn permute(&mut self, indices: &mut [usize]);
}

/// Visits samples in their stored order
#[derive(Debug, Default, Clone, Copy)]
pub struct NoShuffle;

impl ShuffleStrategy for NoShuffle {
    fn permute(&mut self, _indices: &mut [usize]) {}
}

/// Reproducible shuffling from a fixed seed, the order still changes every epoch
#[derive(Debug, Clone)]
pub struct SeededShuffle(Pcg64Mcg);

impl SeededShuffle {
    pub fn new(seed: u64) -> Self {
        Self(Pcg64Mcg::seed_from_u64(seed))
    }
}

impl ShuffleStrategy for SeededShuffle {
    fn permute(&mut self, indices: &mut [usize]) {
        indices.shuffle(&mut self.0);
    }
}

/// Shuffles with the thread local generator
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadShuffle;

impl ShuffleStrategy for ThreadShuffle {
    fn permute(&mut self, indices: &mut [usize]) {
        indices.shuffle(&mut rand::rng());
    }
}

/// Data loader, returns batches `[batch_size, height, width, 1]` of samples, reshuffled every epoch.
/// A trailing partial batch is dropped.
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader<S> {
    samples: SampleSet,
    batch_size: usize,
    shuffle: S,
}

impl<S: ShuffleStrategy> DataLoader<S> {
    pub fn new(samples: SampleSet, batch_size: usize, shuffle: S) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::InvalidBatchSize);
        }
        if samples.len() < batch_size {
            return Err(DataLoaderError::NotEnoughSamples {
                n_samples: samples.len(),
                batch_size,
            });
        }
        Ok(Self {
            samples,
            batch_size,
            shuffle,
        })
    }

    pub fn iter(&mut self) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.samples.len()).collect::<Vec<_>>();
        self.shuffle.permute(&mut indices);
        DataLoaderIterator {
            samples: &self.samples,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }
}

impl<S: ShuffleStrategy> BatchSource for DataLoader<S> {
    fn epoch(&mut self) -> Box<dyn Iterator<Item = Tensor> + '_> {
        Box::new(self.iter())
    }

    fn n_batches(&self) -> usize {
        self.samples.len() / self.batch_size
    }

    fn n_samples(&self) -> usize {
        self.samples.len()
    }
}

/// An iterator which returns mini batches until fewer than a batch of samples remain
pub struct DataLoaderIterator<'a> {
    samples: &'a SampleSet,
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Tensor;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = self
            .indices
            .get(self.curr_iter..self.curr_iter + self.batch_size)?;
        let data = batch
            .iter()
            .flat_map(|&i| self.samples.sample(i).iter().copied())
            .collect();
        self.curr_iter += self.batch_size;
        let [h, w, c] = self.samples.sample_shape();
        Tensor::new(data, &[self.batch_size, h, w, c]).ok()
    }
}
