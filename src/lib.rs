//! Triplet data loading for bird-audio embedding training.
//!
//! Single-process, multi-threaded data loading with:
//! - Triplet metadata from Arrow/Parquet/CSV tables
//! - Fixed-length window sampling, by direct decoding (symphonia + rubato)
//!   or from pre-extracted `.npy` windows
//! - Random train/validation/test splitting
//! - Parallel, order-preserving batch assembly into `f32` tensors
//!
//! With the `python` feature the data module is also exported as a Python
//! extension returning NumPy arrays.

pub mod datamodule;
pub mod dataset;
pub mod decode;
pub mod loader;
pub mod metadata;
pub mod reorder;
pub mod sampler;
pub mod split;
pub mod tensor;
pub mod window;

#[cfg(feature = "python")]
mod python;

pub use datamodule::{DataModuleConfig, DataModuleError, SplitName, TripletDataModule};
pub use dataset::{Dataset, DatasetError, Role, Triplet, TripletDataset};
pub use loader::{BatchIter, Batcher, DataLoader, LoaderConfig, LoaderError};
pub use metadata::{ClipRef, MetadataError, MetadataTable, TripletRecord};
pub use sampler::{
    AnySampler, CachedSampler, CachedSamplerConfig, DirectSampler, DirectSamplerConfig,
    SampleError, SamplerConfig, WindowSampler,
};
pub use split::{SplitScheme, Subset};
pub use tensor::{Samples, ToFloatTensor, TripletBatch, TripletBatcher};
pub use window::FitMode;

#[cfg(feature = "python")]
use pyo3::types::{PyModule, PyModuleMethods};
#[cfg(feature = "python")]
use pyo3::{pymodule, Bound, PyResult};

/// Python module entry point.
#[cfg(feature = "python")]
#[pymodule]
fn birdclef_triplets(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PyDataModule>()?;
    m.add_class::<python::PyLoader>()?;
    m.add_class::<python::PyBatchIter>()?;
    Ok(())
}
