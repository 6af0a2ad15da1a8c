/// In-process table, mostly for tests
use std::path::{Path, PathBuf};

use super::{check_fields, OwnedRecord, RecordColumns, RecordSource};
use crate::config::FieldMapping;
use crate::data::ShardAssignment;
use crate::Result;

pub struct MemoryTable {
    location: PathBuf,
    fields: Vec<String>,
    records: Vec<OwnedRecord>,
}

impl MemoryTable {
    /// Table with the default `id` / `image` / `label` columns
    pub fn new(records: Vec<OwnedRecord>) -> Self {
        Self::with_fields(&FieldMapping::default(), records)
    }

    pub fn with_fields(fields: &FieldMapping, records: Vec<OwnedRecord>) -> Self {
        Self {
            location: PathBuf::from("memory://table"),
            fields: fields.names().iter().map(|s| s.to_string()).collect(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordSource for MemoryTable {
    fn location(&self) -> &Path {
        &self.location
    }

    fn version(&self) -> u64 {
        0
    }

    fn num_rows(&self) -> usize {
        self.records.len()
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.clone()
    }

    fn read_fields(&self, fields: &FieldMapping, shard: &ShardAssignment) -> Result<RecordColumns> {
        check_fields(fields, &self.fields)?;
        let owned: Vec<OwnedRecord> = self
            .records
            .iter()
            .filter(|r| shard.owns(r.id))
            .cloned()
            .collect();
        Ok(RecordColumns::from_records(&owned))
    }
}
