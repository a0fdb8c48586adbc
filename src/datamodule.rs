//! Train/validation/test orchestration over one triplet dataset.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use thiserror::Error;

use crate::dataset::TripletDataset;
use crate::loader::{DataLoader, LoaderConfig, LoaderError};
use crate::metadata::MetadataTable;
use crate::sampler::{AnySampler, SamplerConfig, WindowSampler};
use crate::split::{random_split, SplitError, SplitScheme, Subset};
use crate::tensor::{ToFloatTensor, TripletBatcher};

/// One split of the tensor-converted triplet dataset.
pub type TripletSplit<S> = Subset<TripletDataset<S, ToFloatTensor>>;

/// Loader yielding [`TripletBatch`](crate::tensor::TripletBatch)es for a split.
pub type TripletLoader<S> = DataLoader<TripletSplit<S>, TripletBatcher>;

#[derive(Error, Debug)]
pub enum DataModuleError {
    #[error("The {0} split is not supported by this configuration")]
    Unsupported(SplitName),
    #[error("setup() must be called before requesting loaders")]
    NotSetUp,
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitName {
    Train,
    Val,
    Test,
}

impl SplitName {
    fn slot(self) -> usize {
        match self {
            SplitName::Train => 0,
            SplitName::Val => 1,
            SplitName::Test => 2,
        }
    }
}

impl fmt::Display for SplitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SplitName::Train => "train",
            SplitName::Val => "validation",
            SplitName::Test => "test",
        })
    }
}

/// Data module settings.
#[derive(Debug, Clone)]
pub struct DataModuleConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    /// Shuffle the training split every epoch. Validation and test are
    /// always read in split order.
    pub shuffle: bool,
    pub drop_last: bool,
    pub prefetch_factor: usize,
    pub split: SplitScheme,
    /// Seeds the partition and the loaders. `None` draws from entropy, so
    /// runs differ.
    pub seed: Option<u64>,
}

impl DataModuleConfig {
    /// Settings used with direct decoding: 80/10/10, no shuffling.
    pub fn direct() -> Self {
        Self {
            batch_size: 4,
            num_workers: 8,
            shuffle: false,
            drop_last: false,
            prefetch_factor: 2,
            split: SplitScheme::TrainValTest,
            seed: None,
        }
    }

    /// Settings used with cached windows: 90/10, shuffled training.
    pub fn cached() -> Self {
        Self {
            shuffle: true,
            split: SplitScheme::TrainVal,
            ..Self::direct()
        }
    }

    fn loader_config(&self, shuffle: bool) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            num_workers: self.num_workers,
            shuffle,
            drop_last: self.drop_last,
            prefetch_factor: self.prefetch_factor,
            seed: self.seed,
        }
    }
}

impl Default for DataModuleConfig {
    fn default() -> Self {
        Self::direct()
    }
}

struct Splits<S> {
    sizes: Vec<usize>,
    train: TripletSplit<S>,
    val: TripletSplit<S>,
    test: Option<TripletSplit<S>>,
    /// Epoch counters per split, shared by every loader handed out.
    epochs: [Arc<AtomicU64>; 3],
}

/// Owns the metadata and sampler, partitions rows once in
/// [`setup`](Self::setup), and hands out per-split loaders.
pub struct TripletDataModule<S> {
    metadata: Arc<MetadataTable>,
    sampler: Arc<S>,
    config: DataModuleConfig,
    splits: Option<Splits<S>>,
}

impl TripletDataModule<AnySampler> {
    /// Build the module with the sampler selected by `sampler`.
    pub fn from_config(
        metadata: impl Into<Arc<MetadataTable>>,
        sampler: SamplerConfig,
        config: DataModuleConfig,
    ) -> Self {
        Self::new(metadata, sampler.build(), config)
    }
}

impl<S: WindowSampler + 'static> TripletDataModule<S> {
    pub fn new(metadata: impl Into<Arc<MetadataTable>>, sampler: S, config: DataModuleConfig) -> Self {
        Self {
            metadata: metadata.into(),
            sampler: Arc::new(sampler),
            config,
            splits: None,
        }
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataTable {
        &self.metadata
    }

    /// Partition the rows. Only row counts are used; no file is opened.
    pub fn setup(&mut self) -> Result<(), DataModuleError> {
        let n = self.metadata.len();
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let parts = random_split(n, self.config.split.ratios(), &mut rng)?;
        let sizes: Vec<usize> = parts.iter().map(Vec::len).collect();

        let dataset = Arc::new(
            TripletDataset::new(Arc::clone(&self.metadata), Arc::clone(&self.sampler))
                .with_transform(ToFloatTensor),
        );
        let mut parts = parts.into_iter().map(|indices| Subset::new(Arc::clone(&dataset), indices));

        // random_split yields exactly one part per ratio.
        let (Some(train), Some(val)) = (parts.next(), parts.next()) else {
            return Err(SplitError::Empty.into());
        };
        let test = parts.next();

        tracing::info!(rows = n, ?sizes, window_len = self.sampler.window_len(), "data module set up");
        self.splits = Some(Splits {
            sizes,
            train,
            val,
            test,
            epochs: Default::default(),
        });
        Ok(())
    }

    pub fn is_set_up(&self) -> bool {
        self.splits.is_some()
    }

    /// Sizes of train, validation (and test) splits after setup.
    pub fn split_sizes(&self) -> Option<&[usize]> {
        self.splits.as_ref().map(|s| s.sizes.as_slice())
    }

    pub fn split(&self, name: SplitName) -> Result<&TripletSplit<S>, DataModuleError> {
        if name == SplitName::Test && !self.config.split.has_test() {
            return Err(DataModuleError::Unsupported(name));
        }
        let splits = self.splits.as_ref().ok_or(DataModuleError::NotSetUp)?;
        match name {
            SplitName::Train => Ok(&splits.train),
            SplitName::Val => Ok(&splits.val),
            SplitName::Test => splits.test.as_ref().ok_or(DataModuleError::Unsupported(name)),
        }
    }

    pub fn train(&self) -> Result<&TripletSplit<S>, DataModuleError> {
        self.split(SplitName::Train)
    }

    pub fn val(&self) -> Result<&TripletSplit<S>, DataModuleError> {
        self.split(SplitName::Val)
    }

    pub fn test(&self) -> Result<&TripletSplit<S>, DataModuleError> {
        self.split(SplitName::Test)
    }

    /// Loader over one split. Loaders for the same split share an epoch
    /// counter, so requesting a new loader every epoch still advances the
    /// seeded order and draws. [`setup`](Self::setup) resets the counters.
    pub fn loader(&self, name: SplitName) -> Result<TripletLoader<S>, DataModuleError> {
        let split = self.split(name)?.clone();
        let epochs = match &self.splits {
            Some(splits) => Arc::clone(&splits.epochs[name.slot()]),
            None => return Err(DataModuleError::NotSetUp),
        };
        let shuffle = name == SplitName::Train && self.config.shuffle;
        let loader = DataLoader::new(split, TripletBatcher, self.config.loader_config(shuffle))?;
        Ok(loader.with_epoch_counter(epochs))
    }

    pub fn train_loader(&self) -> Result<TripletLoader<S>, DataModuleError> {
        self.loader(SplitName::Train)
    }

    pub fn val_loader(&self) -> Result<TripletLoader<S>, DataModuleError> {
        self.loader(SplitName::Val)
    }

    /// Fails with [`DataModuleError::Unsupported`] under
    /// [`SplitScheme::TrainVal`].
    pub fn test_loader(&self) -> Result<TripletLoader<S>, DataModuleError> {
        self.loader(SplitName::Test)
    }
}
