//! Indexable triplet datasets.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::metadata::MetadataTable;
use crate::sampler::{SampleError, WindowSampler};
use crate::tensor::Samples;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Failed to sample {role} clip of row {row}: {source}")]
    Sample {
        row: usize,
        role: Role,
        #[source]
        source: SampleError,
    },
}

/// Position of a clip within a triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Anchor,
    Neighbor,
    Distant,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Anchor, Role::Neighbor, Role::Distant];

    /// Key used for this role in batch dictionaries.
    pub fn key(self) -> &'static str {
        match self {
            Role::Anchor => "anchor",
            Role::Neighbor => "neighbor",
            Role::Distant => "distant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Anchor, neighbor and distant values of the same type.
#[derive(Debug, Clone, PartialEq)]
pub struct Triplet<T> {
    pub anchor: T,
    pub neighbor: T,
    pub distant: T,
}

impl<T> Triplet<T> {
    pub fn get(&self, role: Role) -> &T {
        match role {
            Role::Anchor => &self.anchor,
            Role::Neighbor => &self.neighbor,
            Role::Distant => &self.distant,
        }
    }

    /// Apply `f` to each member, keeping the key set.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Triplet<U> {
        Triplet {
            anchor: f(self.anchor),
            neighbor: f(self.neighbor),
            distant: f(self.distant),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &T)> {
        Role::ALL.into_iter().map(move |role| (role, self.get(role)))
    }
}

/// An indexed collection whose items are produced on demand.
///
/// Implementations must be `Send + Sync` so loader workers can share them.
pub trait Dataset: Send + Sync {
    type Item: Send;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produce item `index`, drawing any randomness from `rng`.
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Self::Item, DatasetError>;
}

impl<D: Dataset + ?Sized> Dataset for Arc<D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Self::Item, DatasetError> {
        (**self).get(index, rng)
    }
}

/// Post-processing applied to each sampled triplet.
pub trait Transform: Send + Sync {
    type Output: Send;

    fn apply(&self, sample: Triplet<Samples>) -> Self::Output;
}

/// Identity transform: raw samples out.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Transform for Raw {
    type Output = Triplet<Samples>;

    fn apply(&self, sample: Triplet<Samples>) -> Self::Output {
        sample
    }
}

/// Maps a row index to a freshly sampled triplet of windows.
///
/// Nothing is cached: every access re-reads the recordings.
pub struct TripletDataset<S, T = Raw> {
    metadata: Arc<MetadataTable>,
    sampler: Arc<S>,
    transform: T,
}

impl<S: WindowSampler> TripletDataset<S, Raw> {
    pub fn new(metadata: Arc<MetadataTable>, sampler: Arc<S>) -> Self {
        Self {
            metadata,
            sampler,
            transform: Raw,
        }
    }
}

impl<S: WindowSampler, T: Transform> TripletDataset<S, T> {
    pub fn with_transform<U: Transform>(self, transform: U) -> TripletDataset<S, U> {
        TripletDataset {
            metadata: self.metadata,
            sampler: self.sampler,
            transform,
        }
    }

    pub fn metadata(&self) -> &MetadataTable {
        &self.metadata
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    /// Like [`Dataset::get`] with an entropy-seeded RNG.
    pub fn sample(&self, index: usize) -> Result<T::Output, DatasetError> {
        self.get(index, &mut StdRng::from_entropy())
    }
}

impl<S: WindowSampler, T: Transform> Dataset for TripletDataset<S, T> {
    type Item = T::Output;

    fn len(&self) -> usize {
        self.metadata.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<T::Output, DatasetError> {
        let record = self.metadata.get(index).ok_or(DatasetError::IndexOutOfRange {
            index,
            len: self.metadata.len(),
        })?;

        // Each clip gets its own draw; the windows are not time-aligned.
        let mut sample_role = |role: Role| {
            self.sampler
                .sample(record.clip(role), rng)
                .map_err(|source| DatasetError::Sample {
                    row: index,
                    role,
                    source,
                })
        };

        let sample = Triplet {
            anchor: sample_role(Role::Anchor)?,
            neighbor: sample_role(Role::Neighbor)?,
            distant: sample_role(Role::Distant)?,
        };
        Ok(self.transform.apply(sample))
    }
}
