/// Batch assembly on top of a streaming dataset
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::dataset::{Sample, SampleStream, StreamingDataset};
use super::BatchDataLoader;
use crate::config::LoaderConfig;
use crate::{Result, VisionError};

/// A group of samples stacked along a new leading dimension.
///
/// `inputs[i]` pairs with `labels[i]` and `ids[i]`.
#[derive(Debug, Clone)]
pub struct Batch {
    /// [batch, channels, height, width], f32
    pub inputs: Tensor,
    /// [batch], u32
    pub labels: Tensor,
    pub ids: Vec<i64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Stack samples into a [`Batch`] on `device`
pub fn collate(samples: Vec<Sample>, device: &Device) -> Result<Batch> {
    let first = samples
        .first()
        .ok_or_else(|| VisionError::Config("cannot collate an empty batch".to_string()))?;
    let (c, h, w) = first.input.dim();
    let n = samples.len();

    let mut inputs = Vec::with_capacity(n * c * h * w);
    let mut labels = Vec::with_capacity(n);
    let mut ids = Vec::with_capacity(n);

    for sample in samples {
        if sample.input.dim() != (c, h, w) {
            return Err(VisionError::Decode {
                id: Some(sample.id),
                reason: format!(
                    "sample shape {:?} differs from batch shape {:?}",
                    sample.input.dim(),
                    (c, h, w)
                ),
            });
        }
        inputs.extend(sample.input.iter().copied());
        labels.push(sample.label);
        ids.push(sample.id);
    }

    Ok(Batch {
        inputs: Tensor::from_vec(inputs, (n, c, h, w), device)?,
        labels: Tensor::from_vec(labels, n, device)?,
        ids,
    })
}

/// Groups a dataset's passes into batches.
///
/// Each [`DataLoader::iter`] call starts a fresh dataset pass. The loader
/// itself keeps only the pass opened through [`BatchDataLoader`].
pub struct DataLoader {
    dataset: Arc<StreamingDataset>,
    config: LoaderConfig,
    device: Device,
    passes: AtomicU64,
    current: Option<BatchStream>,
}

impl DataLoader {
    pub fn new(dataset: Arc<StreamingDataset>, config: LoaderConfig, device: Device) -> Result<Self> {
        config.validate()?;

        if config.num_workers > 0 && dataset.num_workers() > 1 {
            log::warn!(
                "Loader prefetch ({} batches) stacked on {} dataset workers buffers samples twice",
                config.num_workers,
                dataset.num_workers()
            );
        }

        Ok(Self {
            dataset,
            config,
            device,
            passes: AtomicU64::new(0),
            current: None,
        })
    }

    pub fn dataset(&self) -> &StreamingDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Number of batches one pass yields
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }

    /// Start an independent pass and iterate its batches
    pub fn iter(&self) -> Result<BatchStream> {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed);
        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(pass)),
            None => StdRng::from_entropy(),
        };

        let assembler = Assembler {
            samples: self.dataset.iter()?,
            batch_size: self.config.batch_size,
            drop_last: self.config.drop_last,
            shuffle_capacity: self
                .config
                .shuffle
                .then(|| self.config.batch_size * self.config.shuffle_buffer_batches),
            buffer: Vec::new(),
            rng,
            device: self.device.clone(),
            exhausted: false,
            cancel: Arc::new(AtomicBool::new(false)),
        };

        let source = if self.config.num_workers == 0 {
            BatchSource::Inline(assembler)
        } else {
            BatchSource::Prefetched(Prefetcher::spawn(assembler, self.config.num_workers)?)
        };

        Ok(BatchStream {
            source,
            done: false,
        })
    }
}

impl BatchDataLoader for DataLoader {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.current.is_none() {
            self.current = Some(self.iter()?);
        }
        match self.current.as_mut() {
            Some(stream) => stream.next().transpose(),
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        // Dropping the old stream stops and joins its workers
        self.current = None;
    }

    fn num_batches(&self) -> usize {
        DataLoader::num_batches(self)
    }
}

/// Pulls samples from one pass and cuts them into batches
struct Assembler {
    samples: SampleStream,
    batch_size: usize,
    drop_last: bool,
    shuffle_capacity: Option<usize>,
    buffer: Vec<Sample>,
    rng: StdRng,
    device: Device,
    exhausted: bool,
    /// Set by the owner of a prefetched pass to stop pulling samples
    cancel: Arc<AtomicBool>,
}

impl Assembler {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut samples = Vec::with_capacity(self.batch_size);
        while samples.len() < self.batch_size {
            match self.next_sample()? {
                Some(sample) => samples.push(sample),
                None => break,
            }
        }

        if samples.is_empty() || (self.drop_last && samples.len() < self.batch_size) {
            return Ok(None);
        }
        collate(samples, &self.device).map(Some)
    }

    fn next_sample(&mut self) -> Result<Option<Sample>> {
        let Some(capacity) = self.shuffle_capacity else {
            return self.pull();
        };

        while self.buffer.len() < capacity {
            match self.pull()? {
                Some(sample) => self.buffer.push(sample),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let idx = self.rng.gen_range(0..self.buffer.len());
        Ok(Some(self.buffer.swap_remove(idx)))
    }

    fn pull(&mut self) -> Result<Option<Sample>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.cancel.load(Ordering::Relaxed) {
            // The pass is dropped with the assembler, which stops its readers
            self.exhausted = true;
            return Ok(None);
        }
        match self.samples.next() {
            Some(Ok(sample)) => Ok(Some(sample)),
            Some(Err(e)) => {
                self.exhausted = true;
                Err(e)
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

/// Runs an [`Assembler`] on a background thread, `depth` batches ahead
struct Prefetcher {
    rx: Option<Receiver<Result<Batch>>>,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Prefetcher {
    fn spawn(mut assembler: Assembler, depth: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(depth);
        // Shared with the assembler so a shutdown also interrupts a buffer fill
        let stop = Arc::clone(&assembler.cancel);
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("batch-prefetch".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    let result = assembler.next_batch();
                    let last = !matches!(result, Ok(Some(_)));
                    let message = match result {
                        Ok(Some(batch)) => Ok(batch),
                        Ok(None) => break,
                        Err(e) => Err(e),
                    };
                    if tx.send(message).is_err() || last {
                        break;
                    }
                }
            })
            .map_err(|e| VisionError::Worker(format!("failed to spawn prefetch thread: {}", e)))?;

        Ok(Self {
            rx: Some(rx),
            handle: Some(handle),
            stop,
        })
    }

    fn next(&mut self) -> Option<Result<Batch>> {
        match self.rx.as_ref()?.recv() {
            Ok(message) => Some(message),
            Err(_) if self.shutdown() => {
                Some(Err(VisionError::Worker("prefetch thread panicked".to_string())))
            }
            Err(_) => None,
        }
    }

    /// Stop and join the thread; true if it panicked
    fn shutdown(&mut self) -> bool {
        self.stop.store(true, Ordering::Relaxed);
        self.rx.take();
        self.handle.take().is_some_and(|h| h.join().is_err())
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum BatchSource {
    Inline(Assembler),
    Prefetched(Prefetcher),
}

/// Batches of one pass. Yields at most one error, after which it is finished.
pub struct BatchStream {
    source: BatchSource,
    done: bool,
}

impl Iterator for BatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match &mut self.source {
            BatchSource::Inline(assembler) => assembler.next_batch().transpose(),
            BatchSource::Prefetched(prefetcher) => prefetcher.next(),
        };
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetConfig;
    use crate::data::transform::ImageTransform;
    use crate::data::transform::{ImageShape, SampleTransform};
    use crate::storage::{MemoryTable, OwnedRecord};
    use ndarray::Array3;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn dataset(n: i64, num_workers: usize, shuffle: bool) -> Arc<StreamingDataset> {
        let records: Vec<OwnedRecord> = (0..n)
            .map(|i| OwnedRecord::new(i, vec![(i % 256) as u8; 12], i % 10))
            .collect();
        let table = MemoryTable::new(records);
        let config = DatasetConfig {
            apply_src_numpy_shape: [2, 2, 3],
            num_workers,
            prefetch_per_worker: 8,
            shuffle,
            ..Default::default()
        };
        Arc::new(
            StreamingDataset::from_source(&table, config, Arc::new(ImageTransform::default()))
                .unwrap(),
        )
    }

    fn loader(ds: Arc<StreamingDataset>, config: LoaderConfig) -> DataLoader {
        DataLoader::new(ds, config, Device::Cpu).unwrap()
    }

    fn sizes(loader: &DataLoader) -> Vec<usize> {
        loader.iter().unwrap().map(|b| b.unwrap().len()).collect()
    }

    #[test]
    fn test_short_final_batch_is_emitted() {
        let loader = loader(
            dataset(50, 2, true),
            LoaderConfig {
                batch_size: 16,
                ..Default::default()
            },
        );
        assert_eq!(loader.num_batches(), 4);
        assert_eq!(sizes(&loader), vec![16, 16, 16, 2]);
    }

    #[test]
    fn test_exact_multiple_has_no_short_batch() {
        let loader = loader(
            dataset(48, 3, false),
            LoaderConfig {
                batch_size: 16,
                ..Default::default()
            },
        );
        assert_eq!(sizes(&loader), vec![16, 16, 16]);
    }

    #[test]
    fn test_drop_last() {
        let loader = loader(
            dataset(50, 1, false),
            LoaderConfig {
                batch_size: 16,
                drop_last: true,
                ..Default::default()
            },
        );
        assert_eq!(loader.num_batches(), 3);
        assert_eq!(sizes(&loader), vec![16, 16, 16]);
    }

    #[test]
    fn test_batch_tensors_line_up() -> Result<()> {
        let loader = loader(
            dataset(10, 1, false),
            LoaderConfig {
                batch_size: 4,
                ..Default::default()
            },
        );
        let batch = loader.iter()?.next().unwrap()?;

        assert_eq!(batch.inputs.dims(), &[4, 3, 2, 2]);
        assert_eq!(batch.labels.dims(), &[4]);
        assert_eq!(batch.ids, vec![0, 1, 2, 3]);
        assert_eq!(batch.labels.to_vec1::<u32>()?, vec![0, 1, 2, 3]);

        // every pixel of record 3 is byte 3
        let expected = (3.0 / 255.0 - 0.5) / 0.5;
        let pixel = batch.inputs.get(3)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(pixel.iter().all(|v| (v - expected).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_unshuffled_loader_preserves_order() {
        let loader = loader(
            dataset(30, 1, false),
            LoaderConfig {
                batch_size: 7,
                ..Default::default()
            },
        );
        let ids: Vec<i64> = loader
            .iter()
            .unwrap()
            .flat_map(|b| b.unwrap().ids)
            .collect();
        assert_eq!(ids, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn test_batch_shuffle_reorders_but_keeps_samples() {
        let loader = loader(
            dataset(64, 1, false),
            LoaderConfig {
                batch_size: 8,
                shuffle: true,
                shuffle_buffer_batches: 2,
                seed: Some(3),
                ..Default::default()
            },
        );
        let ids: Vec<i64> = loader
            .iter()
            .unwrap()
            .flat_map(|b| b.unwrap().ids)
            .collect();
        assert_ne!(ids, (0..64).collect::<Vec<_>>());

        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_prefetching_loader_matches_inline() {
        let inline = loader(
            dataset(45, 1, false),
            LoaderConfig {
                batch_size: 10,
                ..Default::default()
            },
        );
        let prefetched = loader(
            dataset(45, 1, false),
            LoaderConfig {
                batch_size: 10,
                num_workers: 2,
                ..Default::default()
            },
        );

        let a: Vec<Vec<i64>> = inline.iter().unwrap().map(|b| b.unwrap().ids).collect();
        let b: Vec<Vec<i64>> = prefetched.iter().unwrap().map(|b| b.unwrap().ids).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_error_keeps_earlier_batches() {
        let mut records: Vec<OwnedRecord> = (0..20)
            .map(|i| OwnedRecord::new(i, vec![0u8; 12], 1))
            .collect();
        records[13].image.clear();
        let table = MemoryTable::new(records);

        for num_workers in [0, 1] {
            let config = DatasetConfig {
                apply_src_numpy_shape: [2, 2, 3],
                num_workers: 1,
                shuffle: false,
                ..Default::default()
            };
            let ds = StreamingDataset::from_source(&table, config, Arc::new(ImageTransform::default()))
                .unwrap();
            let loader = loader(
                Arc::new(ds),
                LoaderConfig {
                    batch_size: 5,
                    num_workers,
                    ..Default::default()
                },
            );
            let results: Vec<Result<Batch>> = loader.iter().unwrap().collect();

            assert_eq!(results.len(), 3);
            assert_eq!(results[0].as_ref().unwrap().ids, vec![0, 1, 2, 3, 4]);
            assert_eq!(results[1].as_ref().unwrap().ids, vec![5, 6, 7, 8, 9]);
            assert!(matches!(
                results[2],
                Err(VisionError::Decode { id: Some(13), .. })
            ));
        }
    }

    #[test]
    fn test_batch_data_loader_reset_starts_new_pass() -> Result<()> {
        let mut loader = loader(
            dataset(10, 2, true),
            LoaderConfig {
                batch_size: 4,
                ..Default::default()
            },
        );

        let mut count = 0;
        while let Some(batch) = loader.next_batch()? {
            count += batch.len();
        }
        assert_eq!(count, 10);
        assert!(loader.next_batch()?.is_none());

        loader.reset();
        assert_eq!(loader.next_batch()?.map(|b| b.len()), Some(4));
        Ok(())
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = DataLoader::new(
            dataset(4, 1, false),
            LoaderConfig {
                batch_size: 0,
                ..Default::default()
            },
            Device::Cpu,
        );
        assert!(matches!(result, Err(VisionError::Config(_))));
    }

    /// Counts decodes and makes each one slow
    struct SlowTransform {
        inner: ImageTransform,
        decoded: Arc<AtomicUsize>,
    }

    impl SampleTransform for SlowTransform {
        fn apply(&self, raw: &[u8], shape: ImageShape) -> Result<Array3<f32>> {
            self.decoded.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_micros(200));
            self.inner.apply(raw, shape)
        }
    }

    #[test]
    fn test_dropping_prefetched_pass_interrupts_buffer_fill() {
        let decoded = Arc::new(AtomicUsize::new(0));
        let records: Vec<OwnedRecord> = (0..2000)
            .map(|i| OwnedRecord::new(i, vec![0; 12], i % 10))
            .collect();
        let table = MemoryTable::new(records);
        let config = DatasetConfig {
            apply_src_numpy_shape: [2, 2, 3],
            num_workers: 1,
            prefetch_per_worker: 4,
            shuffle: false,
            ..Default::default()
        };
        let transform = Arc::new(SlowTransform {
            inner: ImageTransform::default(),
            decoded: Arc::clone(&decoded),
        });
        let ds = Arc::new(StreamingDataset::from_source(&table, config, transform).unwrap());

        // the first batch needs the whole table in the shuffle buffer
        let loader = loader(
            ds,
            LoaderConfig {
                batch_size: 4,
                shuffle: true,
                shuffle_buffer_batches: 500,
                num_workers: 1,
                ..Default::default()
            },
        );
        drop(loader.iter().unwrap());

        assert!(decoded.load(Ordering::Relaxed) < 2000);
    }

    #[test]
    fn test_cancelled_assembler_stops_pulling() {
        let loader = loader(
            dataset(40, 1, false),
            LoaderConfig {
                batch_size: 8,
                ..Default::default()
            },
        );
        let mut stream = loader.iter().unwrap();
        assert_eq!(stream.next().unwrap().unwrap().len(), 8);

        match &stream.source {
            BatchSource::Inline(assembler) => assembler.cancel.store(true, Ordering::Relaxed),
            BatchSource::Prefetched(_) => panic!("expected an inline pass"),
        }
        assert!(stream.next().is_none());
    }
}
