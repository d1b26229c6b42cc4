//! # On-disk variation store
//!
//! A store directory holding one raw little-endian file per dataset
//! plus a JSON manifest with the dataset catalog, sample list and chunk
//! size. The first axis grows by appending whole rows to the dataset
//! file; the manifest is flushed at chunk boundaries, so after a crash
//! the store re-opens at the last completed append.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, SchemaError};
use crate::matrix::Matrix;
use crate::store::{DatasetMeta, VariationChunk, VariationStore};
use crate::VARS_PER_CHUNK;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    samples: Vec<String>,
    chunk_size: usize,
    num_variations: usize,
    datasets: BTreeMap<String, DatasetMeta>,
}

#[derive(Debug)]
pub struct DiskVariations {
    dir: PathBuf,
    manifest: Manifest,
    writable: bool,
}

impl DiskVariations {
    /// Create a new store directory (or re-initialize an empty one).
    pub fn create(dir: impl AsRef<Path>) -> Result<DiskVariations> {
        DiskVariations::create_with_chunk_size(dir, VARS_PER_CHUNK)
    }

    pub fn create_with_chunk_size(
        dir: impl AsRef<Path>,
        chunk_size: usize,
    ) -> Result<DiskVariations> {
        let dir = dir.as_ref().to_path_buf();
        // creating over an existing store truncates it
        if dir.join(MANIFEST_FILE).exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        let store = DiskVariations {
            dir,
            manifest: Manifest {
                samples: Vec::new(),
                chunk_size: chunk_size.max(1),
                num_variations: 0,
                datasets: BTreeMap::new(),
            },
            writable: true,
        };
        store.write_manifest()?;
        Ok(store)
    }

    /// Open an existing store read-only.
    pub fn open(dir: impl AsRef<Path>) -> Result<DiskVariations> {
        let dir = dir.as_ref().to_path_buf();
        let manifest_path = dir.join(MANIFEST_FILE);
        let mut raw = String::new();
        File::open(&manifest_path)?.read_to_string(&mut raw)?;
        let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| {
            Error::shape(format!(
                "can not read store manifest {}: {e}",
                manifest_path.display()
            ))
        })?;
        Ok(DiskVariations {
            dir,
            manifest,
            writable: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn dataset_file(&self, path: &str) -> PathBuf {
        let mut rel = path.trim_start_matches('/').to_string();
        rel.push_str(".bin");
        self.dir.join(rel)
    }

    fn write_manifest(&self) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.manifest)
            .map_err(|e| Error::shape(format!("can not serialize store manifest: {e}")))?;
        fs::write(self.dir.join(MANIFEST_FILE), raw)?;
        Ok(())
    }

    fn append_bytes(&self, path: &str, matrix: &Matrix) -> Result<()> {
        let file_path = self.dataset_file(path);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(file_path)?;
        file.write_all(&matrix.to_le_bytes())?;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::Unsupported(
                "store was opened read-only".to_string(),
            ))
        }
    }
}

impl VariationStore for DiskVariations {
    fn num_variations(&self) -> usize {
        self.manifest.num_variations
    }

    fn samples(&self) -> &[String] {
        &self.manifest.samples
    }

    fn set_samples(&mut self, samples: Vec<String>) -> Result<()> {
        self.check_writable()?;
        self.manifest.samples = samples;
        self.write_manifest()
    }

    fn chunk_size(&self) -> usize {
        self.manifest.chunk_size
    }

    fn field_paths(&self) -> Vec<String> {
        self.manifest.datasets.keys().cloned().collect()
    }

    fn dataset_meta(&self, path: &str) -> Option<&DatasetMeta> {
        self.manifest.datasets.get(path)
    }

    fn read_rows(&self, path: &str, start: usize, stop: usize) -> Result<Matrix> {
        let meta = self
            .manifest
            .datasets
            .get(path)
            .ok_or_else(|| Error::Schema(SchemaError::UnknownField(path.to_string())))?;
        if stop > self.manifest.num_variations || start > stop {
            return Err(Error::shape(format!(
                "rows {start}..{stop} out of range for {path} with {} rows",
                self.manifest.num_variations
            )));
        }
        let row_bytes = meta.row_bytes();
        let mut buf = vec![0u8; (stop - start) * row_bytes];
        let mut file = File::open(self.dataset_file(path))?;
        file.seek(SeekFrom::Start((start * row_bytes) as u64))?;
        file.read_exact(&mut buf)?;

        let mut shape = Vec::with_capacity(meta.row_shape.len() + 1);
        shape.push(stop - start);
        shape.extend_from_slice(&meta.row_shape);
        Matrix::from_le_bytes(meta.kind, &shape, meta.str_width, &buf)
    }

    fn append_chunk(&mut self, chunk: &VariationChunk) -> Result<()> {
        self.check_writable()?;
        chunk.validate()?;
        if chunk.is_empty() {
            return Ok(());
        }
        let n_before = self.manifest.num_variations;
        let n_new = chunk.num_rows();

        for (path, field) in chunk.fields() {
            match self.manifest.datasets.get(path) {
                Some(meta) => {
                    meta.compatible_with(&field.meta)?;
                    self.append_bytes(path, &field.data)?;
                }
                None => {
                    let mut meta = field.meta.clone();
                    meta.chunk_size = self.manifest.chunk_size;
                    if n_before > 0 {
                        debug!("dataset {path} created mid-store, front-filling {n_before} rows");
                        self.append_bytes(path, &meta.filled_rows(n_before))?;
                    }
                    self.append_bytes(path, &field.data)?;
                    self.manifest.datasets.insert(path.to_string(), meta);
                }
            }
        }

        let absent: Vec<(String, DatasetMeta)> = self
            .manifest
            .datasets
            .iter()
            .filter(|(path, _)| chunk.get(path).is_none())
            .map(|(path, meta)| (path.clone(), meta.clone()))
            .collect();
        for (path, meta) in absent {
            self.append_bytes(&path, &meta.filled_rows(n_new))?;
        }

        self.manifest.num_variations = n_before + n_new;
        // writes land on disk at chunk boundaries
        self.write_manifest()
    }

    fn delete(&mut self, _path: &str) -> Result<()> {
        Err(Error::Unsupported(
            "the disk backing is append-only and can not delete datasets".to_string(),
        ))
    }

    fn flush(&mut self) -> Result<()> {
        if self.writable {
            self.write_manifest()?;
        }
        Ok(())
    }
}
