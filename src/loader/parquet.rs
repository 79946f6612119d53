//! Parquet chunk loader
//!
//! Writes every chunk to its own Parquet file named after its first and last
//! timestamps and business keys. Before a chunk lands, rows carrying any of
//! its keys are stripped from the files already in the directory, so a
//! re-delivered record only ever lives in the newest file.

use super::{dedupe_latest, LoadReport, Loader};
use crate::decode::ExtractedRecord;
use crate::error::{Error, Result};
use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use ::parquet::arrow::{ArrowWriter, ProjectionMask};
use ::parquet::basic::Compression;
use ::parquet::file::properties::WriterProperties;
use arrow::array::{Array, ArrayRef, BooleanArray, StringArray, TimestampMillisecondArray};
use arrow::compute::{concat_batches, filter_record_batch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Longest business key fragment kept in a file name
const NAME_KEY_LEN: usize = 24;

/// Loader writing one Parquet file per chunk
#[derive(Debug, Clone)]
pub struct ParquetChunkLoader {
    dir: PathBuf,
    prefix: String,
    compression: Compression,
}

impl ParquetChunkLoader {
    /// Write files into `dir`, creating it on first use
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: "sales".to_string(),
            compression: Compression::SNAPPY,
        }
    }

    /// Set the file name prefix
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Use no compression
    #[must_use]
    pub fn uncompressed(mut self) -> Self {
        self.compression = Compression::UNCOMPRESSED;
        self
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fixed schema of every chunk file
    pub fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("business_key", DataType::Utf8, false),
            Field::new(
                "sold_at",
                DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
                false,
            ),
            Field::new("payload", DataType::Utf8, false),
        ]))
    }

    fn file_name(&self, records: &[&ExtractedRecord]) -> Option<String> {
        let first = records.iter().map(|r| r.timestamp).min()?;
        let last = records.iter().map(|r| r.timestamp).max()?;
        let first_key = records.first()?.dedupe_key();
        let last_key = records.last()?.dedupe_key();
        Some(format!(
            "{}_{}_{}_{}_{}.parquet",
            self.prefix,
            first.format("%Y%m%dT%H%M%S"),
            last.format("%Y%m%dT%H%M%S"),
            name_fragment(&first_key),
            name_fragment(&last_key)
        ))
    }

    /// Chunk files currently in the output directory
    fn chunk_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let head = format!("{}_", self.prefix);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&head) && n.ends_with(".parquet"));
            if matches && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn to_batch(records: &[&ExtractedRecord]) -> Result<RecordBatch> {
        let keys = StringArray::from_iter_values(records.iter().map(|r| r.dedupe_key()));
        let sold_at = TimestampMillisecondArray::from_iter_values(
            records.iter().map(|r| r.timestamp.timestamp_millis()),
        )
        .with_timezone("UTC");
        let payloads = StringArray::from_iter_values(records.iter().map(|r| r.payload.to_string()));

        let columns: Vec<ArrayRef> = vec![Arc::new(keys), Arc::new(sold_at), Arc::new(payloads)];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }

    /// Whether any row of the file carries one of `keys`
    fn holds_any(path: &Path, keys: &HashSet<String>) -> Result<bool> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [0]);
        for batch in builder.with_projection(mask).build()? {
            let batch = batch?;
            if key_column(&batch, 0)?.iter().flatten().any(|k| keys.contains(k)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Rows of the file whose key is not in `keys`
    fn surviving_rows(path: &Path, keys: &HashSet<String>) -> Result<RecordBatch> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
        let mut kept = Vec::new();
        for batch in reader {
            let batch = batch?;
            let mask: BooleanArray = key_column(&batch, 0)?
                .iter()
                .map(|k| Some(!k.is_some_and(|k| keys.contains(k))))
                .collect();
            kept.push(filter_record_batch(&batch, &mask)?);
        }
        Ok(concat_batches(&Self::schema(), &kept)?)
    }

    fn write_file(&self, path: &Path, batch: &RecordBatch) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = path.with_extension("parquet.tmp");
        let file = File::create(&temp_path)
            .map_err(|e| Error::loader(format!("Failed to create file: {e}")))?;

        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;

        std::fs::rename(&temp_path, path)
            .map_err(|e| Error::loader(format!("Failed to rename chunk file: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Loader for ParquetChunkLoader {
    async fn load(&self, records: &[ExtractedRecord]) -> Result<LoadReport> {
        let unique = dedupe_latest(records);
        let Some(name) = self.file_name(&unique) else {
            return Ok(LoadReport::default());
        };
        let path = self.dir.join(name);
        let keys: HashSet<String> = unique.iter().map(|r| r.dedupe_key()).collect();

        let mut batch = Self::to_batch(&unique)?;
        let mut stale = Vec::new();
        for file in self.chunk_files()? {
            if file == path {
                // same name as an earlier chunk: keep its other rows
                let survivors = Self::surviving_rows(&file, &keys)?;
                batch = concat_batches(&Self::schema(), &[survivors, batch])?;
            } else if Self::holds_any(&file, &keys)? {
                stale.push(file);
            }
        }

        // new rows land before old copies go, so a crash leaves duplicates, never gaps
        self.write_file(&path, &batch)?;
        debug!(path = %path.display(), rows = batch.num_rows(), "Wrote chunk file");

        for file in stale {
            let survivors = Self::surviving_rows(&file, &keys)?;
            if survivors.num_rows() == 0 {
                std::fs::remove_file(&file)?;
            } else {
                self.write_file(&file, &survivors)?;
            }
            debug!(
                path = %file.display(),
                rows = survivors.num_rows(),
                "Removed re-delivered keys from chunk file"
            );
        }

        Ok(LoadReport {
            received: records.len(),
            written: unique.len(),
            duplicates: records.len() - unique.len(),
            location: Some(path.display().to_string()),
        })
    }

    fn name(&self) -> &'static str {
        "parquet"
    }
}

fn key_column(batch: &RecordBatch, index: usize) -> Result<&StringArray> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::loader("business_key column is not a string column"))
}

/// File-name-safe slice of a business key
fn name_fragment(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(NAME_KEY_LEN)
        .collect()
}
