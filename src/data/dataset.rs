/// Sharded, shuffled, worker-parallel stream of transformed samples
///
/// A [`StreamingDataset`] reads the rows of its shard once at construction;
/// rows owned by other ranks are never kept. Every call to [`StreamingDataset::iter`]
/// starts an independent pass: the shard's rows are split into one contiguous
/// slice per worker, each slice is optionally permuted, and the workers decode
/// their slices in parallel into a shared bounded channel.
///
/// Shuffling is per worker slice. Which records a worker reads is fixed by the
/// row split; only the order inside the slice changes between passes, and the
/// merged order across workers depends on thread timing.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng, SeedableRng};

use super::shard::ShardAssignment;
use super::transform::{ImageShape, SampleTransform};
use crate::config::DatasetConfig;
use crate::storage::{open_table, RecordColumns, RecordSource};
use crate::{Result, VisionError};

/// One decoded, normalized record
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: i64,
    /// Normalized image, (channels, height, width)
    pub input: Array3<f32>,
    pub label: u32,
}

pub struct StreamingDataset {
    config: DatasetConfig,
    shard: ShardAssignment,
    shape: ImageShape,
    location: PathBuf,
    version: u64,
    total_rows: usize,
    columns: Arc<RecordColumns>,
    rows: Vec<usize>,
    transform: Arc<dyn SampleTransform>,
    passes: AtomicU64,
}

impl StreamingDataset {
    /// Open the table at `config.path` and build the dataset over it
    pub fn open(config: DatasetConfig, transform: Arc<dyn SampleTransform>) -> Result<Self> {
        config.validate()?;
        let table = open_table(&config.path)?;
        Self::from_source(&table, config, transform)
    }

    /// Build the dataset over an already opened source
    pub fn from_source(
        source: &dyn RecordSource,
        config: DatasetConfig,
        transform: Arc<dyn SampleTransform>,
    ) -> Result<Self> {
        config.validate()?;
        let shard = config.shard_assignment()?;
        let shape = ImageShape::from_hwc(config.apply_src_numpy_shape);

        // Only this shard's rows are held in memory
        let columns = source.read_fields(&config.fields, &shard)?;
        warn_on_duplicate_ids(columns.ids(), source.location());

        let rows: Vec<usize> = (0..columns.len()).collect();

        log::info!(
            "Dataset {:?} v{}: {} of {} rows ({}), {} workers, shuffle={}",
            source.location(),
            source.version(),
            rows.len(),
            source.num_rows(),
            shard,
            config.num_workers,
            config.shuffle
        );

        Ok(Self {
            shard,
            shape,
            location: source.location().to_path_buf(),
            version: source.version(),
            total_rows: source.num_rows(),
            columns: Arc::new(columns),
            rows,
            transform,
            passes: AtomicU64::new(0),
            config,
        })
    }

    /// Samples per pass (this shard only)
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in the whole table, across all shards
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn shard(&self) -> ShardAssignment {
        self.shard
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn image_shape(&self) -> ImageShape {
        self.shape
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Start a new pass over the shard
    pub fn iter(&self) -> Result<SampleStream> {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed);
        let seed = self.config.seed.map(|s| s.wrapping_add(pass));
        let slices = plan_pass(&self.rows, self.config.num_workers, self.config.shuffle, seed);

        log::debug!(
            "Pass {} over {:?}: {} samples across {} worker slices",
            pass,
            self.location,
            self.rows.len(),
            slices.iter().filter(|s| !s.is_empty()).count()
        );

        let capacity = self.config.prefetch_per_worker * self.config.num_workers;
        let (tx, rx) = mpsc::sync_channel(capacity);
        let mut stream = SampleStream {
            rx: Some(rx),
            handles: Vec::with_capacity(slices.len()),
            stop: Arc::new(AtomicBool::new(false)),
            remaining: self.rows.len(),
            done: false,
        };

        for (worker, slice) in slices.into_iter().enumerate() {
            if slice.is_empty() {
                continue;
            }
            let reader = SliceReader {
                columns: Arc::clone(&self.columns),
                transform: Arc::clone(&self.transform),
                shape: self.shape,
                num_classes: self.config.num_classes,
                stop: Arc::clone(&stream.stop),
            };
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("dataset-reader-{}", worker))
                .spawn(move || reader.run(slice, tx))
                .map_err(|e| VisionError::Worker(format!("failed to spawn reader thread: {}", e)))?;
            stream.handles.push(handle);
        }

        // Channel closes once every worker has dropped its sender
        drop(tx);

        Ok(stream)
    }
}

fn warn_on_duplicate_ids(ids: &[i64], location: &Path) {
    let mut seen = HashSet::with_capacity(ids.len());
    let duplicates = ids.iter().filter(|id| !seen.insert(**id)).count();
    if duplicates > 0 {
        log::warn!(
            "{:?} contains {} duplicate ids; shards will not be disjoint by record",
            location,
            duplicates
        );
    }
}

/// Split `rows` into `num_workers` contiguous slices (sizes differ by at most
/// one) and optionally permute each slice independently.
pub fn plan_pass(
    rows: &[usize],
    num_workers: usize,
    shuffle: bool,
    seed: Option<u64>,
) -> Vec<Vec<usize>> {
    let workers = num_workers.max(1);
    let base = rows.len() / workers;
    let extra = rows.len() % workers;

    let mut slices = Vec::with_capacity(workers);
    let mut start = 0;
    for worker in 0..workers {
        let len = base + usize::from(worker < extra);
        slices.push(rows[start..start + len].to_vec());
        start += len;
    }

    if shuffle {
        match seed {
            Some(seed) => shuffle_slices(&mut slices, &mut StdRng::seed_from_u64(seed)),
            None => shuffle_slices(&mut slices, &mut thread_rng()),
        }
    }

    slices
}

fn shuffle_slices<R: Rng>(slices: &mut [Vec<usize>], rng: &mut R) {
    for slice in slices.iter_mut() {
        slice.shuffle(rng);
    }
}

/// What one reader thread needs to decode its slice
struct SliceReader {
    columns: Arc<RecordColumns>,
    transform: Arc<dyn SampleTransform>,
    shape: ImageShape,
    num_classes: usize,
    stop: Arc<AtomicBool>,
}

impl SliceReader {
    fn run(self, slice: Vec<usize>, tx: SyncSender<Result<Sample>>) {
        for row in slice {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            let result = self.decode(row);
            let failed = result.is_err();
            // Receiver gone means the pass was abandoned
            if tx.send(result).is_err() || failed {
                return;
            }
        }
    }

    fn decode(&self, row: usize) -> Result<Sample> {
        let record = self.columns.record(row);
        let input = self
            .transform
            .apply(record.image, self.shape)
            .map_err(|e| e.for_record(record.id))?;

        let label = u32::try_from(record.label)
            .ok()
            .filter(|l| (*l as usize) < self.num_classes)
            .ok_or_else(|| VisionError::Decode {
                id: Some(record.id),
                reason: format!("label {} outside [0, {})", record.label, self.num_classes),
            })?;

        Ok(Sample {
            id: record.id,
            input,
            label,
        })
    }
}

/// Lazy sequence of samples for one pass.
///
/// The first error ends the pass: it is yielded once, the workers are stopped
/// and every later call returns `None`. Dropping the stream early stops and
/// joins the workers as well.
pub struct SampleStream {
    rx: Option<Receiver<Result<Sample>>>,
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    remaining: usize,
    done: bool,
}

impl SampleStream {
    /// Samples not yet yielded in this pass
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn shutdown(&mut self) -> usize {
        self.done = true;
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the receiver unblocks workers waiting on a full channel
        self.rx.take();
        self.handles
            .drain(..)
            .map(JoinHandle::join)
            .filter(std::result::Result::is_err)
            .count()
    }
}

impl Iterator for SampleStream {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let received = self.rx.as_ref()?.recv();
        match received {
            Ok(Ok(sample)) => {
                self.remaining = self.remaining.saturating_sub(1);
                Some(Ok(sample))
            }
            Ok(Err(e)) => {
                log::debug!("Aborting pass: {}", e);
                self.shutdown();
                Some(Err(e))
            }
            Err(_) => {
                let panicked = self.shutdown();
                if panicked > 0 {
                    Some(Err(VisionError::Worker(format!(
                        "{} reader thread(s) panicked, {} samples unread",
                        panicked, self.remaining
                    ))))
                } else {
                    None
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            (0, Some(self.remaining))
        }
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
