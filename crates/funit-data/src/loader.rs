use funit_nn::Rng;
use funit_tensor::Tensor;

use crate::dataset::Dataset;
use crate::error::DataError;

/// A collated mini-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[B, C, H, W]`
    pub images: Tensor,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Iterates over a dataset in batches.
///
/// ```ignore
/// let mut loader = DataLoader::new(dataset, 8, 42).shuffle(true).drop_last(true).repeat(true);
/// let batch = loader.next().unwrap()?;
/// ```
pub struct DataLoader<D: Dataset> {
    dataset: D,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    repeat: bool,
    rng: Rng,
    indices: Vec<usize>,
    position: usize,
    epoch: usize,
}

impl<D: Dataset> std::fmt::Debug for DataLoader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("len", &self.dataset.len())
            .field("batch_size", &self.batch_size)
            .field("shuffle", &self.shuffle)
            .field("drop_last", &self.drop_last)
            .field("repeat", &self.repeat)
            .field("position", &self.position)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl<D: Dataset> DataLoader<D> {
    pub fn new(dataset: D, batch_size: usize, seed: u64) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        let n = dataset.len();
        Self {
            dataset,
            batch_size,
            shuffle: false,
            drop_last: false,
            repeat: false,
            rng: Rng::new(seed),
            indices: (0..n).collect(),
            position: 0,
            epoch: 0,
        }
    }

    /// Reshuffle the order at the start of every epoch.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Skip the final batch of an epoch when it is smaller than `batch_size`.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Start a new epoch instead of ending the iteration.
    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of completed passes over the dataset.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        let n = self.indices.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    fn batch_end(&self) -> Option<usize> {
        let remaining = self.indices.len().saturating_sub(self.position);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            None
        } else {
            Some(self.position + remaining.min(self.batch_size))
        }
    }

    fn collate(&mut self, start: usize, end: usize) -> Result<Batch, DataError> {
        let mut images = Vec::with_capacity(end - start);
        let mut labels = Vec::with_capacity(end - start);
        for k in start..end {
            let sample = self.dataset.get(self.indices[k], &mut self.rng)?;
            images.push(sample.image);
            labels.push(sample.label);
        }
        let refs: Vec<&Tensor> = images.iter().collect();
        Ok(Batch {
            images: Tensor::stack(&refs),
            labels,
        })
    }
}

impl<D: Dataset> Iterator for DataLoader<D> {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.num_batches() == 0 {
            return None;
        }
        if self.position == 0 && self.shuffle {
            self.rng.shuffle(&mut self.indices);
        }
        let end = match self.batch_end() {
            Some(end) => end,
            None if self.repeat => {
                self.epoch += 1;
                self.position = 0;
                return self.next();
            }
            None => {
                self.epoch += 1;
                return None;
            }
        };
        let start = self.position;
        self.position = end;
        Some(self.collate(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sample;
    use funit_tensor::Shape;

    /// Item `i` is a 1x1x1 image holding `i`, labelled `i % 3`.
    struct Counting(usize);

    impl Dataset for Counting {
        fn len(&self) -> usize {
            self.0
        }

        fn class_names(&self) -> &[String] {
            &[]
        }

        fn label(&self, index: usize) -> usize {
            index % 3
        }

        fn get(&self, index: usize, _rng: &mut Rng) -> Result<Sample, DataError> {
            Ok(Sample {
                image: Tensor::full(Shape::from_slice(&[1, 1, 1]), index as f64),
                label: self.label(index),
            })
        }
    }

    #[test]
    fn sequential_batches_keep_the_tail() {
        let batches: Vec<Batch> = DataLoader::new(Counting(5), 2, 0)
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].images.dims(), &[2, 1, 1, 1]);
        assert_eq!(batches[2].labels, vec![4 % 3]);
    }

    #[test]
    fn drop_last_skips_partial_batch() {
        let loader = DataLoader::new(Counting(5), 2, 0).drop_last(true);
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.count(), 2);
    }

    #[test]
    fn shuffled_epoch_is_a_permutation() {
        let mut seen: Vec<usize> = DataLoader::new(Counting(7), 3, 9)
            .shuffle(true)
            .flat_map(|b| b.unwrap().images.into_data())
            .map(|v| v as usize)
            .collect();
        seen.sort();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn repeat_cycles_and_counts_epochs() {
        let mut loader = DataLoader::new(Counting(4), 2, 1)
            .shuffle(true)
            .drop_last(true)
            .repeat(true);
        for _ in 0..5 {
            assert_eq!(loader.next().unwrap().unwrap().len(), 2);
        }
        assert_eq!(loader.epoch(), 2);
    }

    #[test]
    fn batch_larger_than_dataset_with_drop_last_yields_nothing() {
        let mut loader = DataLoader::new(Counting(3), 4, 0).drop_last(true).repeat(true);
        assert!(loader.next().is_none());
    }
}
