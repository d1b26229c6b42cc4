//! # In-memory variation store
//!
//! Datasets are owned [`Matrix`] slabs; appending reallocates through
//! `ndarray`'s amortized axis-0 growth. Useful as a scratch store, as
//! the target of projections and subsampling, and for tests.
use std::collections::BTreeMap;

use crate::error::{Error, Result, SchemaError};
use crate::matrix::Matrix;
use crate::store::{DatasetMeta, VariationChunk, VariationStore};
use crate::VARS_PER_CHUNK;

#[derive(Debug)]
pub struct ArrayVariations {
    samples: Vec<String>,
    chunk_size: usize,
    datasets: BTreeMap<String, (DatasetMeta, Matrix)>,
}

impl Default for ArrayVariations {
    fn default() -> ArrayVariations {
        ArrayVariations::new()
    }
}

impl ArrayVariations {
    pub fn new() -> ArrayVariations {
        ArrayVariations::with_chunk_size(VARS_PER_CHUNK)
    }

    pub fn with_chunk_size(chunk_size: usize) -> ArrayVariations {
        ArrayVariations {
            samples: Vec::new(),
            chunk_size: chunk_size.max(1),
            datasets: BTreeMap::new(),
        }
    }

    /// Inject one dataset directly, deriving its descriptor from the
    /// slab. The first axis must agree with the datasets already held.
    pub fn set_matrix(&mut self, path: &str, data: Matrix) -> Result<()> {
        if !self.datasets.is_empty() && data.nrows() != self.num_variations() {
            return Err(Error::shape(format!(
                "dataset {path} brings {} rows into a store of {} variations",
                data.nrows(),
                self.num_variations()
            )));
        }
        let meta = DatasetMeta::from_matrix(path, &data, self.chunk_size);
        self.datasets.insert(path.to_string(), (meta, data));
        Ok(())
    }
}

impl VariationStore for ArrayVariations {
    fn num_variations(&self) -> usize {
        self.datasets
            .values()
            .next()
            .map_or(0, |(_, data)| data.nrows())
    }

    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn set_samples(&mut self, samples: Vec<String>) -> Result<()> {
        self.samples = samples;
        Ok(())
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn field_paths(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    fn dataset_meta(&self, path: &str) -> Option<&DatasetMeta> {
        self.datasets.get(path).map(|(meta, _)| meta)
    }

    fn read_rows(&self, path: &str, start: usize, stop: usize) -> Result<Matrix> {
        let (_, data) = self
            .datasets
            .get(path)
            .ok_or_else(|| Error::Schema(SchemaError::UnknownField(path.to_string())))?;
        if stop > data.nrows() || start > stop {
            return Err(Error::shape(format!(
                "rows {start}..{stop} out of range for {path} with {} rows",
                data.nrows()
            )));
        }
        Ok(data.slice_rows(start, stop))
    }

    fn append_chunk(&mut self, chunk: &VariationChunk) -> Result<()> {
        chunk.validate()?;
        if chunk.is_empty() {
            return Ok(());
        }
        let n_before = self.num_variations();
        let n_new = chunk.num_rows();

        for (path, field) in chunk.fields() {
            match self.datasets.get_mut(path) {
                Some((meta, data)) => {
                    meta.compatible_with(&field.meta)?;
                    data.append(&field.data)?;
                }
                None => {
                    // a dataset first seen mid-store starts with a
                    // missing-filled prefix to stay in lock-step
                    let mut meta = field.meta.clone();
                    meta.chunk_size = self.chunk_size;
                    let data = if n_before > 0 {
                        let mut data = meta.filled_rows(n_before);
                        data.append(&field.data)?;
                        data
                    } else {
                        field.data.clone()
                    };
                    self.datasets.insert(path.to_string(), (meta, data));
                }
            }
        }

        // datasets the chunk did not mention advance with fill rows
        for (meta, data) in self.datasets.values_mut() {
            if data.nrows() == n_before {
                data.append(&meta.filled_rows(n_new))?;
            }
            if data.nrows() != n_before + n_new {
                return Err(Error::shape(format!(
                    "dataset {} ended at {} rows instead of {}",
                    meta.path,
                    data.nrows(),
                    n_before + n_new
                )));
            }
        }
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        self.datasets
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::Schema(SchemaError::UnknownField(path.to_string())))
    }
}
