/// Record sources: tables of `(id, image bytes, label)` rows
///
/// The training pipeline never writes to a table. A source hands back the
/// requested columns for the rows of one shard; ordering and decoding happen
/// in [`crate::data`].
pub mod memory;
pub mod npy_table;

pub use memory::MemoryTable;
pub use npy_table::{open_table, open_table_version, ColumnKind, NpyTable, TableWriter};

use std::path::Path;

use crate::config::FieldMapping;
use crate::data::ShardAssignment;
use crate::{Result, VisionError};

/// A readable, read-only table
pub trait RecordSource: Send + Sync {
    /// Where the table lives (used in error messages and logs)
    fn location(&self) -> &Path;

    /// Table version being read
    fn version(&self) -> u64;

    /// Rows in the whole table
    fn num_rows(&self) -> usize;

    /// Names of all columns in the table
    fn field_names(&self) -> Vec<String>;

    /// Read the id, source and target columns named by `fields`, keeping only
    /// the rows whose id `shard` owns
    fn read_fields(&self, fields: &FieldMapping, shard: &ShardAssignment) -> Result<RecordColumns>;
}

/// One raw row borrowed from a [`RecordColumns`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub id: i64,
    pub image: &'a [u8],
    pub label: i64,
}

/// One raw row with owned bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRecord {
    pub id: i64,
    pub image: Vec<u8>,
    pub label: i64,
}

impl OwnedRecord {
    pub fn new(id: i64, image: Vec<u8>, label: i64) -> Self {
        Self { id, image, label }
    }
}

/// The three columns a dataset reads, held in memory.
///
/// Images are stored back to back in one buffer; row `i` spans
/// `values[offsets[i]..offsets[i + 1]]`.
#[derive(Debug, Clone, Default)]
pub struct RecordColumns {
    ids: Vec<i64>,
    labels: Vec<i64>,
    values: Vec<u8>,
    offsets: Vec<usize>,
}

impl RecordColumns {
    /// Assemble columns, checking that they describe the same number of rows
    pub fn new(ids: Vec<i64>, labels: Vec<i64>, values: Vec<u8>, offsets: Vec<usize>) -> Result<Self> {
        let rows = ids.len();
        if labels.len() != rows || offsets.len() != rows + 1 {
            return Err(VisionError::Config(format!(
                "column length mismatch: {} ids, {} labels, {} offsets",
                rows,
                labels.len(),
                offsets.len()
            )));
        }
        if offsets[0] != 0
            || offsets.windows(2).any(|w| w[0] > w[1])
            || offsets[rows] != values.len()
        {
            return Err(VisionError::Config(
                "binary column offsets are not monotonic over the value buffer".to_string(),
            ));
        }
        Ok(Self {
            ids,
            labels,
            values,
            offsets,
        })
    }

    pub fn from_records(records: &[OwnedRecord]) -> Self {
        let mut ids = Vec::with_capacity(records.len());
        let mut labels = Vec::with_capacity(records.len());
        let mut values = Vec::new();
        let mut offsets = Vec::with_capacity(records.len() + 1);
        offsets.push(0);

        for record in records {
            ids.push(record.id);
            labels.push(record.label);
            values.extend_from_slice(&record.image);
            offsets.push(values.len());
        }

        Self {
            ids,
            labels,
            values,
            offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    /// Copy of the given rows, in the given order
    pub fn select(&self, rows: &[usize]) -> Self {
        let mut ids = Vec::with_capacity(rows.len());
        let mut labels = Vec::with_capacity(rows.len());
        let mut values = Vec::new();
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        offsets.push(0);

        for &row in rows {
            let record = self.record(row);
            ids.push(record.id);
            labels.push(record.label);
            values.extend_from_slice(record.image);
            offsets.push(values.len());
        }

        Self {
            ids,
            labels,
            values,
            offsets,
        }
    }

    /// Drop every row `shard` does not own
    pub fn retain_shard(self, shard: &ShardAssignment) -> Self {
        match shard {
            ShardAssignment::Unsharded => self,
            ShardAssignment::Fixed { .. } => self.select(&shard.select_rows(&self.ids)),
        }
    }

    /// Row at `row`; panics if out of range
    pub fn record(&self, row: usize) -> RawRecord<'_> {
        RawRecord {
            id: self.ids[row],
            image: &self.values[self.offsets[row]..self.offsets[row + 1]],
            label: self.labels[row],
        }
    }
}

/// Check that every requested field exists in `available`
pub(crate) fn check_fields(fields: &FieldMapping, available: &[String]) -> Result<()> {
    for name in fields.names() {
        if !available.iter().any(|f| f == name) {
            return Err(VisionError::SchemaMismatch {
                field: name.to_string(),
                available: available.to_vec(),
            });
        }
    }
    Ok(())
}
