/// Versioned on-disk table stored as NumPy column files
///
/// Layout:
///
/// ```text
/// cifar_train.delta/
///   _table.json            manifest: current version + per-version schema
///   v1/id.npy              i64 [rows]
///   v1/label.npy           i64 [rows]
///   v1/image.npy           u8  [total bytes]
///   v1/image.offsets.npy   i64 [rows + 1]
///   v2/...
/// ```
///
/// Every commit writes a complete new version directory; older versions stay
/// readable through [`open_table_version`].
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use ndarray::Array1;
use ndarray_npy::{ReadNpyExt, ReadableElement, WriteNpyExt};
use serde::{Deserialize, Serialize};

use super::{check_fields, OwnedRecord, RecordColumns, RecordSource};
use crate::config::FieldMapping;
use crate::data::ShardAssignment;
use crate::{Result, VisionError};

const MANIFEST_FILE: &str = "_table.json";
const FORMAT: &str = "npy-table/1";

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// One `i64` per row
    Int64,
    /// Variable-length bytes per row (values + offsets)
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

/// One committed version of a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u64,
    pub num_rows: usize,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableManifest {
    format: String,
    current_version: u64,
    versions: Vec<VersionEntry>,
}

impl TableManifest {
    fn load(root: &Path) -> Result<Self> {
        let manifest_path = root.join(MANIFEST_FILE);
        if !root.is_dir() || !manifest_path.is_file() {
            return Err(VisionError::StorageUnavailable {
                path: root.to_path_buf(),
                reason: format!("no {} found", MANIFEST_FILE),
            });
        }

        let file = File::open(&manifest_path)?;
        let manifest: TableManifest = serde_json::from_reader(BufReader::new(file))?;
        if manifest.format != FORMAT {
            return Err(VisionError::StorageUnavailable {
                path: root.to_path_buf(),
                reason: format!("unsupported table format '{}'", manifest.format),
            });
        }
        Ok(manifest)
    }

    fn entry(&self, version: u64) -> Option<&VersionEntry> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// Handle on one version of an on-disk table
#[derive(Debug, Clone)]
pub struct NpyTable {
    root: PathBuf,
    entry: VersionEntry,
}

/// Open the current version of the table at `path`
pub fn open_table<P: AsRef<Path>>(path: P) -> Result<NpyTable> {
    let root = path.as_ref();
    let manifest = TableManifest::load(root)?;
    open_entry(root, &manifest, manifest.current_version)
}

/// Open a specific version of the table at `path`
pub fn open_table_version<P: AsRef<Path>>(path: P, version: u64) -> Result<NpyTable> {
    let root = path.as_ref();
    let manifest = TableManifest::load(root)?;
    open_entry(root, &manifest, version)
}

fn open_entry(root: &Path, manifest: &TableManifest, version: u64) -> Result<NpyTable> {
    let entry = manifest
        .entry(version)
        .cloned()
        .ok_or_else(|| VisionError::StorageUnavailable {
            path: root.to_path_buf(),
            reason: format!("version {} does not exist", version),
        })?;

    log::info!(
        "Opened table {:?} at version {} ({} rows)",
        root,
        entry.version,
        entry.num_rows
    );

    Ok(NpyTable {
        root: root.to_path_buf(),
        entry,
    })
}

impl NpyTable {
    pub fn num_rows(&self) -> usize {
        self.entry.num_rows
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.entry.columns
    }

    pub fn description(&self) -> &str {
        &self.entry.description
    }

    fn version_dir(&self) -> PathBuf {
        version_dir(&self.root, self.entry.version)
    }

    fn names_of_kind(&self, kind: ColumnKind) -> Vec<String> {
        self.entry
            .columns
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.name.clone())
            .collect()
    }

    fn require(&self, name: &str, kind: ColumnKind) -> Result<()> {
        let names = self.names_of_kind(kind);
        if names.iter().any(|n| n == name) {
            Ok(())
        } else {
            Err(VisionError::SchemaMismatch {
                field: name.to_string(),
                available: names,
            })
        }
    }

    fn read_int_column(&self, name: &str) -> Result<Vec<i64>> {
        let values = read_column::<i64>(&self.version_dir().join(format!("{}.npy", name)))?;
        if values.len() != self.entry.num_rows {
            return Err(invalid_data(format!(
                "column '{}' has {} rows, manifest says {}",
                name,
                values.len(),
                self.entry.num_rows
            )));
        }
        Ok(values.to_vec())
    }

    fn read_binary_column(&self, name: &str) -> Result<(Vec<u8>, Vec<usize>)> {
        let dir = self.version_dir();
        let values = read_column::<u8>(&dir.join(format!("{}.npy", name)))?;
        let offsets = read_column::<i64>(&dir.join(format!("{}.offsets.npy", name)))?;

        let offsets = offsets
            .iter()
            .map(|&o| usize::try_from(o))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| invalid_data(format!("column '{}' has negative offsets", name)))?;

        Ok((values.to_vec(), offsets))
    }
}

impl RecordSource for NpyTable {
    fn location(&self) -> &Path {
        &self.root
    }

    fn version(&self) -> u64 {
        self.entry.version
    }

    fn num_rows(&self) -> usize {
        self.entry.num_rows
    }

    fn field_names(&self) -> Vec<String> {
        self.entry.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn read_fields(&self, fields: &FieldMapping, shard: &ShardAssignment) -> Result<RecordColumns> {
        check_fields(fields, &self.field_names())?;
        self.require(&fields.id_field, ColumnKind::Int64)?;
        self.require(&fields.target_field, ColumnKind::Int64)?;
        self.require(&fields.src_field, ColumnKind::Binary)?;

        let ids = self.read_int_column(&fields.id_field)?;
        let labels = self.read_int_column(&fields.target_field)?;
        let (values, offsets) = self.read_binary_column(&fields.src_field)?;

        let columns = RecordColumns::new(ids, labels, values, offsets)?.retain_shard(shard);

        log::debug!(
            "Read {} of {} rows ({}) of {:?} from {:?} v{}",
            columns.len(),
            self.entry.num_rows,
            shard,
            fields.names(),
            self.root,
            self.entry.version
        );

        Ok(columns)
    }
}

/// Commits new versions of a table from owned records.
///
/// Used to build fixtures and demo tables; the training path only reads.
pub struct TableWriter {
    root: PathBuf,
    fields: FieldMapping,
    description: String,
}

impl TableWriter {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            fields: FieldMapping::default(),
            description: String::new(),
        }
    }

    pub fn fields(mut self, fields: FieldMapping) -> Self {
        self.fields = fields;
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Write `records` as a new version and make it current
    pub fn commit(&self, records: &[OwnedRecord]) -> Result<u64> {
        fs::create_dir_all(&self.root)?;

        let mut manifest = if self.root.join(MANIFEST_FILE).is_file() {
            TableManifest::load(&self.root)?
        } else {
            TableManifest {
                format: FORMAT.to_string(),
                current_version: 0,
                versions: Vec::new(),
            }
        };

        let version = manifest.current_version + 1;
        let dir = version_dir(&self.root, version);
        fs::create_dir_all(&dir)?;

        let ids: Array1<i64> = records.iter().map(|r| r.id).collect();
        let labels: Array1<i64> = records.iter().map(|r| r.label).collect();
        let values: Array1<u8> = records.iter().flat_map(|r| r.image.iter().copied()).collect();
        let mut offsets = Vec::with_capacity(records.len() + 1);
        let mut end = 0i64;
        offsets.push(end);
        for record in records {
            end += record.image.len() as i64;
            offsets.push(end);
        }

        write_column(&ids, &dir.join(format!("{}.npy", self.fields.id_field)))?;
        write_column(&labels, &dir.join(format!("{}.npy", self.fields.target_field)))?;
        write_column(&values, &dir.join(format!("{}.npy", self.fields.src_field)))?;
        write_column(
            &Array1::from(offsets),
            &dir.join(format!("{}.offsets.npy", self.fields.src_field)),
        )?;

        manifest.versions.push(VersionEntry {
            version,
            num_rows: records.len(),
            columns: vec![
                ColumnSpec { name: self.fields.id_field.clone(), kind: ColumnKind::Int64 },
                ColumnSpec { name: self.fields.src_field.clone(), kind: ColumnKind::Binary },
                ColumnSpec { name: self.fields.target_field.clone(), kind: ColumnKind::Int64 },
            ],
            description: self.description.clone(),
        });
        manifest.current_version = version;

        // Swap the manifest in last so readers never see a half-written version
        let tmp = self.root.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?)?;
        fs::rename(&tmp, self.root.join(MANIFEST_FILE))?;

        log::info!(
            "Committed {} rows to {:?} as version {}",
            records.len(),
            self.root,
            version
        );

        Ok(version)
    }
}

fn version_dir(root: &Path, version: u64) -> PathBuf {
    root.join(format!("v{}", version))
}

fn invalid_data(msg: String) -> VisionError {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg).into()
}

fn read_column<A: ReadableElement>(path: &Path) -> Result<Array1<A>> {
    let file = File::open(path).map_err(|e| VisionError::StorageUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    <Array1<A> as ReadNpyExt>::read_npy(BufReader::new(file))
        .map_err(|e| invalid_data(format!("Failed to read {}: {}", path.display(), e)))
}

fn write_column<A: ndarray_npy::WritableElement>(array: &Array1<A>, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    array
        .write_npy(BufWriter::new(file))
        .map_err(|e| invalid_data(format!("Failed to write {}: {}", path.display(), e)))
}
