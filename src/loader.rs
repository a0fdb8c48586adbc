//! Pipelined batch loader.
//!
//! Architecture:
//! Feeder Thread -> Job Channel -> Worker Threads -> Reorder Buffer -> Main Thread
//!
//! - Feeder thread walks the epoch order and hands out (position, index) jobs
//! - Workers sample, decode and convert items in parallel
//! - Reorder buffer returns items in epoch order, whatever finishes first
//! - Main thread assembles batches
//!
//! With `num_workers == 0` items are loaded on the calling thread instead.

use crate::dataset::{Dataset, DatasetError};
use crate::reorder::ConcurrentReorderBuffer;
use crate::window::{item_seed, splitmix64};

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use rand::prelude::*;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("Batch assembly failed: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Loader workers exited before item {0} was produced")]
    WorkersExited(usize),
    #[error("Invalid loader config: {0}")]
    InvalidConfig(&'static str),
}

/// Collates loaded items into one batch.
pub trait Batcher<I>: Send + Sync {
    type Output;

    fn batch(&self, items: Vec<I>) -> Result<Self::Output, LoaderError>;
}

/// Loader settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Worker threads; 0 loads on the calling thread.
    pub num_workers: usize,
    /// Reshuffle the item order every epoch.
    pub shuffle: bool,
    /// Drop a trailing batch smaller than `batch_size`.
    pub drop_last: bool,
    /// Items buffered ahead of the consumer, in batches per worker.
    pub prefetch_factor: usize,
    /// Fixes the epoch order and every per-item random draw.
    pub seed: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            num_workers: 8,
            shuffle: false,
            drop_last: false,
            prefetch_factor: 2,
            seed: None,
        }
    }
}

impl LoaderConfig {
    fn validate(&self) -> Result<(), LoaderError> {
        if self.batch_size == 0 {
            return Err(LoaderError::InvalidConfig("batch_size must be > 0"));
        }
        if self.prefetch_factor == 0 {
            return Err(LoaderError::InvalidConfig("prefetch_factor must be > 0"));
        }
        Ok(())
    }
}

/// Batching iterator factory over a dataset. Each [`iter`](Self::iter)
/// call is one epoch.
pub struct DataLoader<D, B> {
    dataset: Arc<D>,
    batcher: Arc<B>,
    config: LoaderConfig,
    epoch: Arc<AtomicU64>,
}

impl<D, B> DataLoader<D, B>
where
    D: Dataset + 'static,
    D::Item: 'static,
    B: Batcher<D::Item>,
{
    pub fn new(dataset: D, batcher: B, config: LoaderConfig) -> Result<Self, LoaderError> {
        config.validate()?;
        Ok(Self {
            dataset: Arc::new(dataset),
            batcher: Arc::new(batcher),
            config,
            epoch: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Draw epoch numbers from `counter`, shared with other loaders over the
    /// same data, so a seeded run does not repeat an epoch when a fresh
    /// loader is created.
    pub fn with_epoch_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.epoch = counter;
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        let n = self.dataset.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a new epoch.
    pub fn iter(&self) -> BatchIter<D, B> {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        let epoch_seed = match self.config.seed {
            Some(seed) => splitmix64(seed.wrapping_add(epoch)),
            None => rand::random(),
        };

        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(epoch_seed));
        }

        let batch_size = self.config.batch_size;
        if self.config.drop_last {
            order.truncate(order.len() / batch_size * batch_size);
        }

        tracing::debug!(
            epoch,
            items = order.len(),
            batch_size,
            workers = self.config.num_workers,
            "starting epoch"
        );

        let mut iter = BatchIter {
            dataset: Arc::clone(&self.dataset),
            batcher: Arc::clone(&self.batcher),
            batch_size,
            total: order.len(),
            order: order.into(),
            epoch_seed,
            produced: 0,
            done: false,
            pipeline: None,
        };
        if self.config.num_workers > 0 && iter.total > 0 {
            let capacity = self.config.num_workers * self.config.prefetch_factor * batch_size;
            iter.pipeline = Some(Pipeline::start(
                Arc::clone(&iter.dataset),
                Arc::clone(&iter.order),
                epoch_seed,
                self.config.num_workers,
                capacity,
            ));
        }
        iter
    }
}

impl<'a, D, B> IntoIterator for &'a DataLoader<D, B>
where
    D: Dataset + 'static,
    D::Item: 'static,
    B: Batcher<D::Item>,
{
    type Item = Result<B::Output, LoaderError>;
    type IntoIter = BatchIter<D, B>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One epoch of batches. The first error ends the epoch.
pub struct BatchIter<D: Dataset, B> {
    dataset: Arc<D>,
    batcher: Arc<B>,
    batch_size: usize,
    order: Arc<[usize]>,
    total: usize,
    epoch_seed: u64,
    produced: usize,
    done: bool,
    pipeline: Option<Pipeline<D::Item>>,
}

impl<D, B> BatchIter<D, B>
where
    D: Dataset,
    B: Batcher<D::Item>,
{
    fn next_item(&mut self) -> Result<D::Item, LoaderError> {
        let Some(pipeline) = &self.pipeline else {
            let index = self.order[self.produced];
            self.produced += 1;
            let mut rng = StdRng::seed_from_u64(item_seed(self.epoch_seed, index as u64));
            return Ok(self.dataset.get(index, &mut rng)?);
        };

        loop {
            if let Some(result) = pipeline.buffer.try_pop(Duration::from_millis(100)) {
                self.produced += 1;
                return Ok(result?);
            }
            if pipeline.buffer.is_closed() {
                // Closed after the last pop attempt: drain once more.
                if let Some(result) = pipeline.buffer.try_pop(Duration::ZERO) {
                    self.produced += 1;
                    return Ok(result?);
                }
                return Err(LoaderError::WorkersExited(self.produced));
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
    }
}

impl<D, B> Iterator for BatchIter<D, B>
where
    D: Dataset,
    B: Batcher<D::Item>,
{
    type Item = Result<B::Output, LoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.produced >= self.total {
            self.finish();
            return None;
        }

        let n = self.batch_size.min(self.total - self.produced);
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            match self.next_item() {
                Ok(item) => items.push(item),
                Err(e) => {
                    self.finish();
                    return Some(Err(e));
                }
            }
        }

        let batch = self.batcher.batch(items);
        if batch.is_err() {
            self.finish();
        }
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let remaining = (self.total - self.produced).div_ceil(self.batch_size);
        (0, Some(remaining))
    }
}

impl<D, B> std::iter::FusedIterator for BatchIter<D, B>
where
    D: Dataset,
    B: Batcher<D::Item>,
{
}

impl<D: Dataset, B> Drop for BatchIter<D, B> {
    fn drop(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
    }
}

/// Position in the epoch order and dataset index of one item.
struct Job {
    seq: usize,
    index: usize,
}

type ItemBuffer<T> = ConcurrentReorderBuffer<Result<T, DatasetError>>;

struct Pipeline<T> {
    buffer: Arc<ItemBuffer<T>>,
    shutdown: Arc<AtomicBool>,
    feeder_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Pipeline<T> {
    fn start<D>(
        dataset: Arc<D>,
        order: Arc<[usize]>,
        epoch_seed: u64,
        n_workers: usize,
        capacity: usize,
    ) -> Self
    where
        D: Dataset<Item = T> + 'static,
    {
        let buffer = Arc::new(ConcurrentReorderBuffer::new(capacity));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (job_tx, job_rx) = bounded(capacity.max(n_workers));

        // Worker completion counter for monitor thread
        let workers_alive = Arc::new(AtomicUsize::new(n_workers));

        let feeder_handle = Some({
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || feeder_thread_main(order, job_tx, shutdown))
        });

        let worker_handles = (0..n_workers)
            .map(|_| {
                let job_rx = job_rx.clone();
                let dataset = Arc::clone(&dataset);
                let buffer = Arc::clone(&buffer);
                let shutdown = Arc::clone(&shutdown);
                let workers_alive = Arc::clone(&workers_alive);

                thread::spawn(move || {
                    worker_thread_main(job_rx, dataset, buffer, epoch_seed, shutdown, workers_alive);
                })
            })
            .collect();

        // Monitor thread: waits for workers to finish, then closes buffer
        let monitor_handle = Some({
            let buffer = Arc::clone(&buffer);
            let shutdown = Arc::clone(&shutdown);

            thread::spawn(move || {
                while workers_alive.load(Ordering::SeqCst) > 0 {
                    thread::sleep(Duration::from_millis(50));
                    if shutdown.load(Ordering::Relaxed) {
                        return; // stop() closes the buffer
                    }
                }
                buffer.close();
            })
        });

        Self {
            buffer,
            shutdown,
            feeder_handle,
            worker_handles,
            monitor_handle,
        }
    }
}

impl<T> Pipeline<T> {
    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.buffer.close();

        if let Some(h) = self.feeder_handle.take() {
            let _ = h.join();
        }
        for h in self.worker_handles.drain(..) {
            let _ = h.join();
        }
        if let Some(h) = self.monitor_handle.take() {
            let _ = h.join();
        }
    }
}

// --- Feeder Thread ---

fn feeder_thread_main(order: Arc<[usize]>, job_tx: Sender<Job>, shutdown: Arc<AtomicBool>) {
    for (seq, &index) in order.iter().enumerate() {
        let mut job = Job { seq, index };
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match job_tx.send_timeout(job, Duration::from_millis(100)) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => job = returned,
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
    // Dropping job_tx lets workers drain and exit.
}

// --- Worker Thread ---

/// Decrements the live-worker count when a worker exits. A worker that
/// unwinds never reports its item, so the buffer is closed to fail the epoch.
struct CounterGuard<T> {
    workers_alive: Arc<AtomicUsize>,
    buffer: Arc<ItemBuffer<T>>,
}

impl<T> Drop for CounterGuard<T> {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("worker: panicked while loading an item");
            self.buffer.close();
        }
        self.workers_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

fn worker_thread_main<D: Dataset>(
    job_rx: Receiver<Job>,
    dataset: Arc<D>,
    buffer: Arc<ItemBuffer<D::Item>>,
    epoch_seed: u64,
    shutdown: Arc<AtomicBool>,
    workers_alive: Arc<AtomicUsize>,
) {
    let _guard = CounterGuard {
        workers_alive,
        buffer: Arc::clone(&buffer),
    };

    loop {
        let job = match job_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(j) => j,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let mut rng = StdRng::seed_from_u64(item_seed(epoch_seed, job.index as u64));
        let result = dataset.get(job.index, &mut rng);
        if let Err(e) = &result {
            tracing::warn!(index = job.index, error = %e, "worker: failed to load item");
        }

        if !buffer.push(job.seq, result) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{table, FakeSampler};
    use crate::dataset::{Triplet, TripletDataset};
    use crate::metadata::{ClipRef, MetadataTable, TripletRecord};
    use crate::tensor::{Samples, ToFloatTensor, TripletBatch, TripletBatcher};
    use std::sync::Mutex;

    /// Dataset of plain integers that sleeps a little so workers finish
    /// out of order, and fails on a chosen index.
    struct Numbers {
        n: usize,
        fail_at: Option<usize>,
        panic_at: Option<usize>,
        calls: Mutex<Vec<usize>>,
    }

    impl Numbers {
        fn new(n: usize) -> Self {
            Self {
                n,
                fail_at: None,
                panic_at: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Dataset for Numbers {
        type Item = (usize, u64);

        fn len(&self) -> usize {
            self.n
        }

        fn get(&self, index: usize, rng: &mut StdRng) -> Result<(usize, u64), DatasetError> {
            self.calls.lock().unwrap().push(index);
            if Some(index) == self.fail_at {
                return Err(DatasetError::IndexOutOfRange { index, len: 0 });
            }
            if Some(index) == self.panic_at {
                panic!("corrupt item {index}");
            }
            thread::sleep(Duration::from_micros(((index * 7919) % 5) as u64 * 200));
            Ok((index, rng.gen()))
        }
    }

    struct VecBatcher;

    impl<I: Send> Batcher<I> for VecBatcher {
        type Output = Vec<I>;

        fn batch(&self, items: Vec<I>) -> Result<Vec<I>, LoaderError> {
            Ok(items)
        }
    }

    fn config(batch_size: usize, num_workers: usize) -> LoaderConfig {
        LoaderConfig {
            batch_size,
            num_workers,
            ..LoaderConfig::default()
        }
    }

    fn collect<D, B>(loader: &DataLoader<D, B>) -> Vec<B::Output>
    where
        D: Dataset + 'static,
        D::Item: 'static,
        B: Batcher<D::Item>,
    {
        loader.iter().map(|b| b.unwrap()).collect()
    }

    #[test]
    fn test_unshuffled_order_and_partial_last_batch() {
        for workers in [0, 1, 4] {
            let loader = DataLoader::new(Numbers::new(10), VecBatcher, config(4, workers)).unwrap();
            assert_eq!(loader.len(), 3);

            let batches = collect(&loader);
            let indices: Vec<Vec<usize>> = batches
                .iter()
                .map(|b| b.iter().map(|(i, _)| *i).collect())
                .collect();
            assert_eq!(indices, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
        }
    }

    #[test]
    fn test_drop_last() {
        let mut cfg = config(4, 2);
        cfg.drop_last = true;
        let loader = DataLoader::new(Numbers::new(10), VecBatcher, cfg).unwrap();
        assert_eq!(loader.len(), 2);
        let batches = collect(&loader);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 4));
    }

    #[test]
    fn test_shuffle_covers_every_item_once() {
        let mut cfg = config(3, 3);
        cfg.shuffle = true;
        let loader = DataLoader::new(Numbers::new(50), VecBatcher, cfg).unwrap();

        let mut seen: Vec<usize> = collect(&loader).into_iter().flatten().map(|(i, _)| i).collect();
        assert_ne!(seen, (0..50).collect::<Vec<_>>());
        seen.sort();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_seeded_epoch_independent_of_worker_count() {
        let run = |workers: usize| {
            let mut cfg = config(5, workers);
            cfg.shuffle = true;
            cfg.seed = Some(1234);
            let loader = DataLoader::new(Numbers::new(40), VecBatcher, cfg).unwrap();
            collect(&loader)
        };
        let serial = run(0);
        assert_eq!(serial, run(1));
        assert_eq!(serial, run(6));
    }

    #[test]
    fn test_epochs_reshuffle() {
        let mut cfg = config(64, 2);
        cfg.shuffle = true;
        cfg.seed = Some(5);
        let loader = DataLoader::new(Numbers::new(64), VecBatcher, cfg).unwrap();
        let first = collect(&loader);
        let second = collect(&loader);
        assert_ne!(first, second);
    }

    #[test]
    fn test_shared_epoch_counter_continues_across_loaders() {
        let mut cfg = config(64, 2);
        cfg.shuffle = true;
        cfg.seed = Some(5);

        let single = DataLoader::new(Numbers::new(64), VecBatcher, cfg.clone()).unwrap();
        let expected = [collect(&single), collect(&single)];

        let counter = Arc::new(AtomicU64::new(0));
        let fresh = || {
            DataLoader::new(Numbers::new(64), VecBatcher, cfg.clone())
                .unwrap()
                .with_epoch_counter(Arc::clone(&counter))
        };
        assert_eq!(collect(&fresh()), expected[0]);
        assert_eq!(collect(&fresh()), expected[1]);
    }

    #[test]
    fn test_error_ends_epoch() {
        for workers in [0, 3] {
            let mut numbers = Numbers::new(20);
            numbers.fail_at = Some(6);
            let loader = DataLoader::new(numbers, VecBatcher, config(4, workers)).unwrap();

            let mut iter = loader.iter();
            assert!(iter.next().unwrap().is_ok());
            let err = iter.next().unwrap().unwrap_err();
            assert!(matches!(
                err,
                LoaderError::Dataset(DatasetError::IndexOutOfRange { index: 6, .. })
            ));
            assert!(iter.next().is_none());
        }
    }

    #[test]
    fn test_worker_panic_ends_epoch() {
        let mut numbers = Numbers::new(200);
        numbers.panic_at = Some(3);
        let mut cfg = config(2, 2);
        cfg.prefetch_factor = 1;
        let loader = DataLoader::new(numbers, VecBatcher, cfg).unwrap();

        // Iterate on a helper thread so a hang fails instead of blocking.
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let results: Vec<_> = loader.iter().collect();
            let _ = tx.send(results);
        });
        let results = rx.recv_timeout(Duration::from_secs(30)).expect("loader hung");

        let last = results.last().unwrap();
        assert!(matches!(last, Err(LoaderError::WorkersExited(n)) if *n <= 3));
        assert!(results[..results.len() - 1].iter().all(Result::is_ok));
        assert!(results.len() <= 2);
    }

    #[test]
    fn test_empty_dataset() {
        let loader = DataLoader::new(Numbers::new(0), VecBatcher, config(4, 4)).unwrap();
        assert!(loader.is_empty());
        assert!(loader.iter().next().is_none());
    }

    #[test]
    fn test_early_drop_stops_workers() {
        let loader = DataLoader::new(Numbers::new(10_000), VecBatcher, config(2, 4)).unwrap();
        let mut iter = loader.iter();
        assert!(iter.next().unwrap().is_ok());
        drop(iter);
        // Bounded look-ahead: nowhere near the whole dataset was touched.
        let calls = loader.dataset().calls.lock().unwrap().len();
        assert!(calls < 1000, "loaded {calls} items");
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            DataLoader::new(Numbers::new(1), VecBatcher, config(0, 1)),
            Err(LoaderError::InvalidConfig(_))
        ));
        let mut cfg = config(1, 1);
        cfg.prefetch_factor = 0;
        assert!(DataLoader::new(Numbers::new(1), VecBatcher, cfg).is_err());
    }

    #[test]
    fn test_triplet_batches() {
        let ds = TripletDataset::new(table(9), Arc::new(FakeSampler { len: 32 }))
            .with_transform(ToFloatTensor);
        let loader = DataLoader::new(ds, TripletBatcher, config(4, 2)).unwrap();

        let batches: Vec<TripletBatch> = collect(&loader);
        assert_eq!(batches.iter().map(TripletBatch::len).collect::<Vec<_>>(), vec![4, 4, 1]);
        for batch in &batches {
            for (_, tensor) in batch.clone().into_triplet().iter() {
                assert_eq!(tensor.ncols(), 32);
            }
        }
        assert_eq!(batches[1].anchor[[2, 0]], 6.0);
    }

    #[test]
    fn test_missing_file_fails_whole_batch() {
        let metadata = Arc::new(MetadataTable::new(vec![
            TripletRecord {
                anchor: ClipRef::new("a.ogg", 0.0),
                neighbor: ClipRef::new("b.ogg", 0.0),
                distant: ClipRef::new("c.ogg", 0.0),
            },
            TripletRecord {
                anchor: ClipRef::new("missing.ogg", 0.0),
                neighbor: ClipRef::new("b.ogg", 0.0),
                distant: ClipRef::new("c.ogg", 0.0),
            },
        ]));
        let ds = TripletDataset::new(metadata, Arc::new(FakeSampler { len: 4 }));
        let loader = DataLoader::new(ds, VecBatcher, config(2, 2)).unwrap();

        let results: Vec<Result<Vec<Triplet<Samples>>, LoaderError>> = loader.iter().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(LoaderError::Dataset(DatasetError::Sample { row: 1, .. }))
        ));
    }
}
