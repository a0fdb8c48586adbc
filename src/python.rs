//! Python-facing data module, loaders and batch iterators.

use numpy::PyArray2;
use pyo3::exceptions::{
    PyFileNotFoundError, PyIOError, PyIndexError, PyNotImplementedError, PyRuntimeError,
    PyValueError,
};
use pyo3::types::{PyDict, PyDictMethods};
use pyo3::{pyclass, pymethods, Bound, PyErr, PyRef, PyResult, Python};

use crate::datamodule::{
    DataModuleConfig, DataModuleError, SplitName, TripletDataModule, TripletLoader, TripletSplit,
};
use crate::dataset::DatasetError;
use crate::loader::{BatchIter, LoaderError};
use crate::metadata::MetadataTable;
use crate::sampler::{AnySampler, CachedSamplerConfig, DirectSamplerConfig, SampleError, SamplerConfig};
use crate::tensor::TripletBatcher;

fn loader_err(e: LoaderError) -> PyErr {
    match &e {
        LoaderError::Dataset(DatasetError::IndexOutOfRange { .. }) => {
            PyIndexError::new_err(e.to_string())
        }
        LoaderError::Dataset(DatasetError::Sample {
            source: SampleError::MissingFile(_),
            ..
        }) => PyFileNotFoundError::new_err(e.to_string()),
        LoaderError::Dataset(DatasetError::Sample {
            source: SampleError::Io { .. },
            ..
        }) => PyIOError::new_err(e.to_string()),
        LoaderError::InvalidConfig(_) => PyValueError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

fn module_err(e: DataModuleError) -> PyErr {
    match e {
        DataModuleError::Unsupported(_) => PyNotImplementedError::new_err(e.to_string()),
        DataModuleError::Loader(inner) => loader_err(inner),
        DataModuleError::Split(_) => PyValueError::new_err(e.to_string()),
        DataModuleError::NotSetUp => PyRuntimeError::new_err(e.to_string()),
    }
}

/// Triplet data module. Mirrors a Lightning `DataModule`: call `setup()`,
/// then `train_dataloader()` / `val_dataloader()` / `test_dataloader()`.
#[pyclass(name = "TripletDataModule")]
pub struct PyDataModule {
    inner: TripletDataModule<AnySampler>,
}

#[pymethods]
impl PyDataModule {
    #[new]
    #[pyo3(signature = (
        metadata_path,
        data_dir,
        batch_size = 4,
        num_workers = 8,
        shuffle = None,
        cached = false,
        seed = None,
        drop_last = false,
        prefetch_factor = 2,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        metadata_path: String,
        data_dir: String,
        batch_size: usize,
        num_workers: usize,
        shuffle: Option<bool>,
        cached: bool,
        seed: Option<u64>,
        drop_last: bool,
        prefetch_factor: usize,
    ) -> PyResult<Self> {
        if batch_size == 0 {
            return Err(PyValueError::new_err("batch_size must be > 0"));
        }
        if prefetch_factor == 0 {
            return Err(PyValueError::new_err("prefetch_factor must be > 0"));
        }

        let metadata = MetadataTable::from_path(&metadata_path).map_err(|e| {
            PyIOError::new_err(format!("Failed to read metadata {}: {}", metadata_path, e))
        })?;

        let (sampler, mut config) = if cached {
            (
                SamplerConfig::Cached(CachedSamplerConfig::new(data_dir)),
                DataModuleConfig::cached(),
            )
        } else {
            (
                SamplerConfig::Direct(DirectSamplerConfig::new(data_dir)),
                DataModuleConfig::direct(),
            )
        };
        config.batch_size = batch_size;
        config.num_workers = num_workers;
        config.seed = seed;
        config.drop_last = drop_last;
        config.prefetch_factor = prefetch_factor;
        if let Some(shuffle) = shuffle {
            config.shuffle = shuffle;
        }

        Ok(Self {
            inner: TripletDataModule::from_config(metadata, sampler, config),
        })
    }

    fn setup(&mut self) -> PyResult<()> {
        self.inner.setup().map_err(module_err)
    }

    #[getter]
    fn split_sizes(&self) -> Option<Vec<usize>> {
        self.inner.split_sizes().map(<[usize]>::to_vec)
    }

    fn __len__(&self) -> usize {
        self.inner.metadata().len()
    }

    fn train_dataloader(&self) -> PyResult<PyLoader> {
        self.loader(SplitName::Train)
    }

    fn val_dataloader(&self) -> PyResult<PyLoader> {
        self.loader(SplitName::Val)
    }

    fn test_dataloader(&self) -> PyResult<PyLoader> {
        self.loader(SplitName::Test)
    }
}

impl PyDataModule {
    fn loader(&self, name: SplitName) -> PyResult<PyLoader> {
        let inner = self.inner.loader(name).map_err(module_err)?;
        Ok(PyLoader { inner })
    }
}

/// Re-iterable loader over one split; each `iter()` is an epoch.
#[pyclass(name = "TripletLoader")]
pub struct PyLoader {
    inner: TripletLoader<AnySampler>,
}

#[pymethods]
impl PyLoader {
    fn __iter__(&self) -> PyBatchIter {
        PyBatchIter {
            iter: self.inner.iter(),
        }
    }

    fn __len__(&self) -> usize {
        self.inner.len()
    }
}

/// One epoch of batches as dicts of `float32` arrays `[batch, window_len]`.
#[pyclass(name = "BatchIterator")]
pub struct PyBatchIter {
    iter: BatchIter<TripletSplit<AnySampler>, TripletBatcher>,
}

#[pymethods]
impl PyBatchIter {
    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__<'py>(&mut self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyDict>>> {
        // Release GIL while workers fill the batch
        let next = py.detach(|| self.iter.next());

        let batch = match next {
            Some(Ok(batch)) => batch,
            Some(Err(e)) => return Err(loader_err(e)),
            None => return Ok(None), // StopIteration
        };

        let tensors = batch.into_triplet();
        let dict = PyDict::new(py);
        for (role, tensor) in tensors.iter() {
            dict.set_item(role.key(), PyArray2::from_array(py, tensor))?;
        }
        Ok(Some(dict))
    }
}
