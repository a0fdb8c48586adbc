//! Conversion of raw windows into `f32` tensors and batch stacking.

use ndarray::{Array1, Array2};

use crate::dataset::{Transform, Triplet};
use crate::loader::{Batcher, LoaderError};
use crate::window::{fit_to_length, FitMode};

/// Raw window content in its source dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I16(Vec<i16>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::F32(v) => v.len(),
            Samples::F64(v) => v.len(),
            Samples::I16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep `[start, start + len)`, clamped to the available samples.
    pub fn slice(self, start: usize, len: usize) -> Samples {
        fn cut<T>(mut v: Vec<T>, start: usize, len: usize) -> Vec<T> {
            let start = start.min(v.len());
            v.truncate(start.saturating_add(len));
            v.drain(..start);
            v
        }
        match self {
            Samples::F32(v) => Samples::F32(cut(v, start, len)),
            Samples::F64(v) => Samples::F64(cut(v, start, len)),
            Samples::I16(v) => Samples::I16(cut(v, start, len)),
        }
    }

    /// Force to exactly `len` samples, keeping the dtype.
    pub fn fit(self, len: usize, mode: FitMode) -> Samples {
        match self {
            Samples::F32(v) => Samples::F32(fit_to_length(v, len, mode)),
            Samples::F64(v) => Samples::F64(fit_to_length(v, len, mode)),
            Samples::I16(v) => Samples::I16(fit_to_length(v, len, mode)),
        }
    }

    /// Plain numeric cast to `f32` (no rescaling of integer samples).
    pub fn into_f32(self) -> Vec<f32> {
        match self {
            Samples::F32(v) => v,
            Samples::F64(v) => v.into_iter().map(|x| x as f32).collect(),
            Samples::I16(v) => v.into_iter().map(f32::from).collect(),
        }
    }
}

/// Converts every member of a triplet into a 1-D `f32` tensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToFloatTensor;

impl Transform for ToFloatTensor {
    type Output = Triplet<Array1<f32>>;

    fn apply(&self, sample: Triplet<Samples>) -> Self::Output {
        sample.map(|s| Array1::from_vec(s.into_f32()))
    }
}

/// A batch of triplets. Each tensor has shape `[batch, window_len]`.
#[derive(Debug, Clone)]
pub struct TripletBatch {
    pub anchor: Array2<f32>,
    pub neighbor: Array2<f32>,
    pub distant: Array2<f32>,
}

impl TripletBatch {
    pub fn len(&self) -> usize {
        self.anchor.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window_len(&self) -> usize {
        self.anchor.ncols()
    }

    pub fn into_triplet(self) -> Triplet<Array2<f32>> {
        Triplet {
            anchor: self.anchor,
            neighbor: self.neighbor,
            distant: self.distant,
        }
    }
}

/// Stacks converted triplets row by row.
#[derive(Debug, Clone, Copy, Default)]
pub struct TripletBatcher;

impl Batcher<Triplet<Array1<f32>>> for TripletBatcher {
    type Output = TripletBatch;

    fn batch(&self, items: Vec<Triplet<Array1<f32>>>) -> Result<TripletBatch, LoaderError> {
        let batch_size = items.len();
        let window_len = items.first().map(|t| t.anchor.len()).unwrap_or(0);

        let mut anchor = Vec::with_capacity(batch_size * window_len);
        let mut neighbor = Vec::with_capacity(batch_size * window_len);
        let mut distant = Vec::with_capacity(batch_size * window_len);
        for item in &items {
            anchor.extend(item.anchor.iter().copied());
            neighbor.extend(item.neighbor.iter().copied());
            distant.extend(item.distant.iter().copied());
        }

        let shape = (batch_size, window_len);
        Ok(TripletBatch {
            anchor: Array2::from_shape_vec(shape, anchor)?,
            neighbor: Array2::from_shape_vec(shape, neighbor)?,
            distant: Array2::from_shape_vec(shape, distant)?,
        })
    }
}
