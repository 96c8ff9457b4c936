//! CSV table storage under `<root>/<dataset>/data.csv`.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, SecondsFormat};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::merge::{MergedTable, TableRow};

pub const TABLE_FILE_NAME: &str = "data.csv";
pub const TIME_COLUMN: &str = "dt";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid dataset name '{0}'")]
    InvalidDatasetName(String),
    #[error("table for dataset '{0}' not found")]
    NotFound(String),
    #[error("malformed table {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTable {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, dataset: &str) -> Result<PathBuf, StorageError> {
        validate_dataset_name(dataset)?;
        Ok(self.root.join(dataset).join(TABLE_FILE_NAME))
    }

    /// Replaces any previous table for the dataset. Readers see the old file or the new one.
    pub fn write_table(&self, dataset: &str, table: &MergedTable) -> Result<StoredTable, StorageError> {
        let path = self.table_path(dataset)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = encode_table(table)?;
        write_atomic(&path, &bytes)?;
        let stored = StoredTable {
            path,
            size_bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        };

        info!(
            component = "table_store",
            event = "storage.table.written",
            dataset,
            path = %stored.path.display(),
            rows = table.n_rows(),
            size_bytes = stored.size_bytes
        );
        Ok(stored)
    }

    /// Deletes `<root>/<dataset>` with everything in it. Returns false when nothing was there.
    pub fn remove_dataset(&self, dataset: &str) -> Result<bool, StorageError> {
        validate_dataset_name(dataset)?;
        let dir = self.root.join(dataset);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(
                    component = "table_store",
                    event = "storage.dataset.removed",
                    dataset,
                    path = %dir.display()
                );
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn read_table(&self, dataset: &str) -> Result<MergedTable, StorageError> {
        let path = self.table_path(dataset)?;
        if !path.exists() {
            return Err(StorageError::NotFound(dataset.to_string()));
        }
        let malformed = |reason: String| StorageError::Malformed {
            path: path.clone(),
            reason,
        };

        let mut reader = csv::Reader::from_path(&path)?;
        let headers = reader.headers()?.clone();
        if headers.get(0) != Some(TIME_COLUMN) {
            return Err(malformed(format!("first column must be '{TIME_COLUMN}'")));
        }
        let columns: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let dt_text = record.get(0).unwrap_or_default();
            let dt = DateTime::parse_from_rfc3339(dt_text)
                .map_err(|err| malformed(format!("bad timestamp '{dt_text}': {err}")))?;
            let mut values = Vec::with_capacity(columns.len());
            for cell in record.iter().skip(1) {
                let cell = cell.trim();
                if cell.is_empty() {
                    values.push(None);
                } else {
                    let value = cell
                        .parse::<f64>()
                        .map_err(|err| malformed(format!("bad value '{cell}': {err}")))?;
                    values.push(Some(value));
                }
            }
            rows.push(TableRow { dt, values });
        }

        Ok(MergedTable { columns, rows })
    }
}

fn validate_dataset_name(name: &str) -> Result<(), StorageError> {
    let invalid = || StorageError::InvalidDatasetName(name.to_string());
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed != name || name.contains(&['/', '\\'][..]) {
        return Err(invalid());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid()),
    }
}

fn encode_table(table: &MergedTable) -> Result<Vec<u8>, StorageError> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = Vec::with_capacity(table.columns.len() + 1);
    header.push(TIME_COLUMN.to_string());
    header.extend(table.columns.iter().cloned());
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = Vec::with_capacity(row.values.len() + 1);
        record.push(row.dt.to_rfc3339_opts(SecondsFormat::Secs, false));
        record.extend(
            row.values
                .iter()
                .map(|value| value.map(|v| v.to_string()).unwrap_or_default()),
        );
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|err| StorageError::Io(io::Error::new(io::ErrorKind::Other, err.to_string())))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StorageError::InvalidDatasetName(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
