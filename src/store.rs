//! # Variation store abstraction
//!
//! One contract over two backings: named datasets addressed by path,
//! grown by appending chunks, iterated in chunks, windows and
//! chromosomes, with derived genotype views computed chunk by chunk to
//! respect a memory budget. The disk backing ([`disk::DiskVariations`])
//! and the memory backing ([`memory::ArrayVariations`]) expose
//! identical semantics.
use std::collections::BTreeMap;

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, SchemaError};
use crate::index::PosIndex;
use crate::ingest::{self, IngestLog, IngestOptions};
use crate::matrix::Matrix;
use crate::missing::DataKind;
use crate::vcf::VcfParser;
use crate::GT_FIELD;

pub mod disk;
pub mod memory;

/// Dataset descriptor: enough for a receiving store to materialize a
/// compatible dataset (dtype, per-row shape, string width, chunk shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub path: String,
    pub kind: DataKind,
    /// Shape of one row, i.e. the dataset shape without the first axis.
    pub row_shape: Vec<usize>,
    /// Bytes per string element; zero for numeric datasets.
    pub str_width: usize,
    pub chunk_size: usize,
}

impl DatasetMeta {
    pub fn new(
        path: impl Into<String>,
        kind: DataKind,
        row_shape: Vec<usize>,
        str_width: usize,
        chunk_size: usize,
    ) -> DatasetMeta {
        DatasetMeta {
            path: path.into(),
            kind,
            row_shape,
            str_width,
            chunk_size,
        }
    }

    pub fn from_matrix(path: impl Into<String>, matrix: &Matrix, chunk_size: usize) -> DatasetMeta {
        DatasetMeta {
            path: path.into(),
            kind: matrix.kind(),
            row_shape: matrix.row_shape(),
            str_width: matrix.str_width(),
            chunk_size,
        }
    }

    /// Group part of the path, e.g. `/variations/info` for
    /// `/variations/info/AF`.
    pub fn group(&self) -> &str {
        match self.path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &self.path[..idx],
        }
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn row_elems(&self) -> usize {
        self.row_shape.iter().product()
    }

    pub fn row_bytes(&self) -> usize {
        let elem = if self.kind.is_str() {
            self.str_width
        } else {
            self.kind.elem_size()
        };
        self.row_elems() * elem
    }

    /// `n` rows of this dataset filled with the missing sentinel.
    pub fn filled_rows(&self, n: usize) -> Matrix {
        let mut shape = Vec::with_capacity(self.row_shape.len() + 1);
        shape.push(n);
        shape.extend_from_slice(&self.row_shape);
        Matrix::filled_missing(self.kind, &shape, self.str_width)
    }

    pub fn compatible_with(&self, other: &DatasetMeta) -> Result<()> {
        if self.kind != other.kind
            || self.row_shape != other.row_shape
            || self.str_width != other.str_width
        {
            return Err(Error::shape(format!(
                "dataset {}: stored element shape {:?} ({:?}, width {}) disagrees with \
                 appended {:?} ({:?}, width {})",
                self.path,
                self.row_shape,
                self.kind,
                self.str_width,
                other.row_shape,
                other.kind,
                other.str_width
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FieldChunk {
    pub meta: DatasetMeta,
    pub data: Matrix,
}

/// A mapping from field path to data slab plus dataset descriptor: the
/// unit of append and iteration. All fields carry the same first-axis
/// length.
#[derive(Debug, Clone, Default)]
pub struct VariationChunk {
    fields: BTreeMap<String, FieldChunk>,
}

impl VariationChunk {
    pub fn new() -> VariationChunk {
        VariationChunk::default()
    }

    pub fn insert(&mut self, meta: DatasetMeta, data: Matrix) -> Result<()> {
        if !self.fields.is_empty() {
            let have = self.num_rows();
            if data.nrows() != have {
                return Err(Error::shape(format!(
                    "field {} brings {} rows into a chunk of {} rows",
                    meta.path,
                    data.nrows(),
                    have
                )));
            }
        }
        let path = meta.path.clone();
        self.fields.insert(path, FieldChunk { meta, data });
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.fields
            .values()
            .next()
            .map_or(0, |field| field.data.nrows())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Matrix> {
        self.fields.get(path).map(|field| &field.data)
    }

    pub fn field(&self, path: &str) -> Option<&FieldChunk> {
        self.fields.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldChunk)> {
        self.fields.iter().map(|(path, field)| (path.as_str(), field))
    }

    /// Uniform first-axis length across fields.
    pub fn validate(&self) -> Result<()> {
        let mut rows: Option<usize> = None;
        for (path, field) in &self.fields {
            let n = field.data.nrows();
            match rows {
                None => rows = Some(n),
                Some(have) if have != n => {
                    return Err(Error::shape(format!(
                        "chunk fields disagree on row count: {path} has {n}, others {have}"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn slice_rows(&self, start: usize, stop: usize) -> VariationChunk {
        let fields = self
            .fields
            .iter()
            .map(|(path, field)| {
                (
                    path.clone(),
                    FieldChunk {
                        meta: field.meta.clone(),
                        data: field.data.slice_rows(start, stop),
                    },
                )
            })
            .collect();
        VariationChunk { fields }
    }

    pub fn select_rows(&self, rows: &[usize]) -> VariationChunk {
        let fields = self
            .fields
            .iter()
            .map(|(path, field)| {
                (
                    path.clone(),
                    FieldChunk {
                        meta: field.meta.clone(),
                        data: field.data.select_rows(rows),
                    },
                )
            })
            .collect();
        VariationChunk { fields }
    }
}

/// Options for [`VariationStore::iterate_chunks`].
#[derive(Debug, Clone, Default)]
pub struct ChunkIterOpts {
    /// Rows per yielded chunk; the store's chunk size when `None`.
    pub chunk_size: Option<usize>,
    pub start: usize,
    pub stop: Option<usize>,
    pub kept_fields: Option<Vec<String>>,
    pub ignored_fields: Option<Vec<String>>,
    /// Independently retain each row with this probability.
    pub random_sample_rate: Option<f64>,
    pub seed: Option<u64>,
}

impl ChunkIterOpts {
    pub fn kept(fields: &[&str]) -> ChunkIterOpts {
        ChunkIterOpts {
            kept_fields: Some(fields.iter().map(|f| (*f).to_string()).collect()),
            ..ChunkIterOpts::default()
        }
    }
}

/// An ordered pair of sub-chunks on the same chromosome whose position
/// spans are within the requested distance.
#[derive(Debug, Clone)]
pub struct ChunkPair {
    pub chunk1: VariationChunk,
    pub chunk2: VariationChunk,
}

/// The capability set shared by the disk and memory backings.
pub trait VariationStore {
    fn num_variations(&self) -> usize;
    fn samples(&self) -> &[String];
    /// Stamp the sample list; done once at store-creation time.
    fn set_samples(&mut self, samples: Vec<String>) -> Result<()>;
    fn chunk_size(&self) -> usize;
    fn field_paths(&self) -> Vec<String>;
    fn dataset_meta(&self, path: &str) -> Option<&DatasetMeta>;
    /// Read `[start, stop)` rows of one dataset as an owned slab.
    fn read_rows(&self, path: &str, start: usize, stop: usize) -> Result<Matrix>;
    /// Grow the first axis of every dataset by the chunk's rows;
    /// datasets are created lazily on first encounter, and datasets the
    /// chunk does not mention are padded with their fill value so every
    /// dataset advances in lock-step.
    fn append_chunk(&mut self, chunk: &VariationChunk) -> Result<()>;
    fn delete(&mut self, path: &str) -> Result<()>;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn has_field(&self, path: &str) -> bool {
        self.dataset_meta(path).is_some()
    }

    /// Read one whole dataset.
    fn read(&self, path: &str) -> Result<Matrix> {
        self.read_rows(path, 0, self.num_variations())
    }

    /// Random-access chunk over `[start, stop)` with all fields.
    fn get_chunk(&self, start: usize, stop: usize) -> Result<VariationChunk>
    where
        Self: Sized,
    {
        let fields = self.field_paths();
        read_chunk(self, &fields, start, stop)
    }

    fn iterate_chunks(&self, opts: ChunkIterOpts) -> Result<ChunkIter<'_, Self>>
    where
        Self: Sized,
    {
        let fields = resolve_fields(
            self,
            opts.kept_fields.as_deref(),
            opts.ignored_fields.as_deref(),
        )?;
        let stop = opts.stop.unwrap_or_else(|| self.num_variations());
        let stop = stop.min(self.num_variations());
        let rate = opts.random_sample_rate;
        if let Some(rate) = rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::Unsupported(format!(
                    "random_sample_rate must be within [0, 1], got {rate}"
                )));
            }
        }
        Ok(ChunkIter {
            store: self,
            fields,
            cursor: opts.start.min(stop),
            stop,
            step: opts.chunk_size.unwrap_or_else(|| self.chunk_size()).max(1),
            rate,
            rng: rate.map(|_| match opts.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            }),
        })
    }

    /// Sub-chunks whose positions fall in half-open windows of
    /// `win_size` base pairs, anchored at the first position of each
    /// chromosome and reset at every chromosome change.
    fn iterate_wins(&self, win_size: i32) -> Result<RangeChunkIter<'_, Self>>
    where
        Self: Sized,
    {
        let index = PosIndex::new(self)?;
        Ok(RangeChunkIter {
            store: self,
            fields: self.field_paths(),
            ranges: index.window_ranges(win_size).into_iter(),
        })
    }

    /// One sub-chunk per chromosome, paired with the chromosome name.
    fn iterate_chroms(&self) -> Result<ChromChunkIter<'_, Self>>
    where
        Self: Sized,
    {
        let index = PosIndex::new(self)?;
        Ok(ChromChunkIter {
            store: self,
            fields: self.field_paths(),
            blocks: index.chrom_blocks().into_iter(),
        })
    }

    /// All ordered pairs (A, B), A at or before B, of same-chromosome
    /// sub-chunks whose position spans are within `max_dist`.
    fn iterate_chunk_pairs(
        &self,
        max_dist: i32,
        chunk_size: usize,
    ) -> Result<ChunkPairIter<'_, Self>>
    where
        Self: Sized,
    {
        let index = PosIndex::new(self)?;
        Ok(ChunkPairIter {
            store: self,
            fields: self.field_paths(),
            pairs: index.pair_ranges(max_dist, chunk_size).into_iter(),
        })
    }

    /// Rows of one chromosome whose positions fall in `[start, stop)`.
    fn get_genome_chunk(&self, chrom: &[u8], start: i32, stop: i32) -> Result<VariationChunk>
    where
        Self: Sized,
    {
        let index = PosIndex::new(self)?;
        let (row_start, row_stop) = index.genome_range(chrom, start, stop);
        self.get_chunk(row_start, row_stop)
    }

    fn put_chunks<I>(&mut self, chunks: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<VariationChunk>>,
        Self: Sized,
    {
        for chunk in chunks {
            self.append_chunk(&chunk?)?;
        }
        self.flush()
    }

    /// Consume a parser to populate this store.
    fn put_vars(&mut self, parser: &mut VcfParser, options: IngestOptions) -> Result<IngestLog>
    where
        Self: Sized,
    {
        ingest::put_vars(self, parser, options)
    }

    /// Streaming re-append of this store into `dst` through chunk
    /// iteration, optionally restricted to a kept-fields projection.
    fn copy<D>(&self, dst: &mut D, kept_fields: Option<&[String]>) -> Result<()>
    where
        D: VariationStore,
        Self: Sized,
    {
        dst.set_samples(self.samples().to_vec())?;
        let chunks = self.iterate_chunks(ChunkIterOpts {
            kept_fields: kept_fields.map(<[String]>::to_vec),
            ..ChunkIterOpts::default()
        })?;
        for chunk in chunks {
            dst.append_chunk(&chunk?)?;
        }
        dst.flush()
    }

    /// Per-row histogram of non-missing allele indices across samples
    /// and ploidy, shape `[N, max_allele + 1]`.
    fn allele_count(&self) -> Result<Array2<i32>>
    where
        Self: Sized,
    {
        let mut max_allele: i8 = 0;
        for chunk in self.iterate_chunks(ChunkIterOpts::kept(&[GT_FIELD]))? {
            let chunk = chunk?;
            let gts = chunk_gts(&chunk)?;
            for &allele in gts.iter() {
                if allele > max_allele {
                    max_allele = allele;
                }
            }
        }
        let n_alleles = max_allele as usize + 1;
        let mut counts = Array2::<i32>::zeros((self.num_variations(), n_alleles));
        let mut row_offset = 0;
        for chunk in self.iterate_chunks(ChunkIterOpts::kept(&[GT_FIELD]))? {
            let chunk = chunk?;
            let gts = chunk_gts(&chunk)?;
            for (i, row) in gts.axis_iter(Axis(0)).enumerate() {
                for &allele in row.iter() {
                    if allele >= 0 {
                        counts[[row_offset + i, allele as usize]] += 1;
                    }
                }
            }
            row_offset += chunk.num_rows();
        }
        Ok(counts)
    }

    /// 0/1/2 genotype encoding for diploid stores: 0 homozygous
    /// reference, 1 heterozygous, 2 homozygous for any alternate
    /// allele, -1 any missing.
    fn gts_as_mat012(&self) -> Result<Array2<i8>>
    where
        Self: Sized,
    {
        let meta = self
            .dataset_meta(GT_FIELD)
            .ok_or_else(|| Error::Schema(SchemaError::UnknownField(GT_FIELD.to_string())))?;
        let ploidy = meta.row_shape.get(1).copied().unwrap_or(1);
        if ploidy != 2 {
            return Err(Error::Unsupported(format!(
                "0/1/2 genotype encoding needs a diploid store, ploidy is {ploidy}"
            )));
        }
        let n_samples = meta.row_shape[0];
        let mut encoded = Array2::<i8>::zeros((self.num_variations(), n_samples));
        let mut row_offset = 0;
        for chunk in self.iterate_chunks(ChunkIterOpts::kept(&[GT_FIELD]))? {
            let chunk = chunk?;
            let gts = chunk_gts(&chunk)?;
            for i in 0..chunk.num_rows() {
                for s in 0..n_samples {
                    let a = gts[[i, s, 0]];
                    let b = gts[[i, s, 1]];
                    encoded[[row_offset + i, s]] = if a < 0 || b < 0 {
                        -1
                    } else if a != b {
                        1
                    } else if a == 0 {
                        0
                    } else {
                        2
                    };
                }
            }
            row_offset += chunk.num_rows();
        }
        Ok(encoded)
    }

    /// For each (variation, sample) choose one of the ploidy allele
    /// slots uniformly at random; deterministic under a fixed seed.
    fn get_random_haploid_gts(&self, seed: Option<u64>) -> Result<Array2<i8>>
    where
        Self: Sized,
    {
        let meta = self
            .dataset_meta(GT_FIELD)
            .ok_or_else(|| Error::Schema(SchemaError::UnknownField(GT_FIELD.to_string())))?;
        let ploidy = meta.row_shape.get(1).copied().unwrap_or(1);
        let n_samples = meta.row_shape[0];
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut haploid = Array2::<i8>::zeros((self.num_variations(), n_samples));
        let mut row_offset = 0;
        for chunk in self.iterate_chunks(ChunkIterOpts::kept(&[GT_FIELD]))? {
            let chunk = chunk?;
            let gts = chunk_gts(&chunk)?;
            for i in 0..chunk.num_rows() {
                for s in 0..n_samples {
                    let slot = rng.gen_range(0..ploidy);
                    haploid[[row_offset + i, s]] = if gts.ndim() == 3 {
                        gts[[i, s, slot]]
                    } else {
                        gts[[i, s]]
                    };
                }
            }
            row_offset += chunk.num_rows();
        }
        Ok(haploid)
    }
}

/// The genotype slab of a chunk as a `[rows, samples, ploidy]` view.
fn chunk_gts(chunk: &VariationChunk) -> Result<&ndarray::ArrayD<i8>> {
    let gts = chunk
        .get(GT_FIELD)
        .ok_or_else(|| Error::Schema(SchemaError::UnknownField(GT_FIELD.to_string())))?;
    gts.as_i8()
        .ok_or_else(|| Error::shape(format!("{GT_FIELD} is not an int8 dataset")))
}

fn read_chunk<S: VariationStore>(
    store: &S,
    fields: &[String],
    start: usize,
    stop: usize,
) -> Result<VariationChunk> {
    let mut chunk = VariationChunk::new();
    for path in fields {
        let meta = store
            .dataset_meta(path)
            .ok_or_else(|| Error::Schema(SchemaError::UnknownField(path.clone())))?
            .clone();
        let data = store.read_rows(path, start, stop)?;
        chunk.insert(meta, data)?;
    }
    Ok(chunk)
}

fn resolve_fields<S: VariationStore>(
    store: &S,
    kept: Option<&[String]>,
    ignored: Option<&[String]>,
) -> Result<Vec<String>> {
    if kept.is_some() && ignored.is_some() {
        return Err(SchemaError::BothKeptAndIgnored.into());
    }
    let mut fields = store.field_paths();
    if let Some(kept) = kept {
        fields.retain(|path| kept.iter().any(|k| k == path));
    }
    if let Some(ignored) = ignored {
        fields.retain(|path| !ignored.iter().any(|i| i == path));
    }
    Ok(fields)
}

pub struct ChunkIter<'a, S: VariationStore> {
    store: &'a S,
    fields: Vec<String>,
    cursor: usize,
    stop: usize,
    step: usize,
    rate: Option<f64>,
    rng: Option<StdRng>,
}

impl<S: VariationStore> Iterator for ChunkIter<'_, S> {
    type Item = Result<VariationChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.stop {
            return None;
        }
        let start = self.cursor;
        let stop = (start + self.step).min(self.stop);
        self.cursor = stop;
        let chunk = match read_chunk(self.store, &self.fields, start, stop) {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(e)),
        };
        if let (Some(rate), Some(rng)) = (self.rate, self.rng.as_mut()) {
            let kept: Vec<usize> = (0..chunk.num_rows())
                .filter(|_| rng.gen::<f64>() < rate)
                .collect();
            return Some(Ok(chunk.select_rows(&kept)));
        }
        Some(Ok(chunk))
    }
}

pub struct RangeChunkIter<'a, S: VariationStore> {
    store: &'a S,
    fields: Vec<String>,
    ranges: std::vec::IntoIter<(usize, usize)>,
}

impl<S: VariationStore> Iterator for RangeChunkIter<'_, S> {
    type Item = Result<VariationChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let (start, stop) = self.ranges.next()?;
        Some(read_chunk(self.store, &self.fields, start, stop))
    }
}

pub struct ChromChunkIter<'a, S: VariationStore> {
    store: &'a S,
    fields: Vec<String>,
    blocks: std::vec::IntoIter<(Vec<u8>, usize, usize)>,
}

impl<S: VariationStore> Iterator for ChromChunkIter<'_, S> {
    type Item = Result<(Vec<u8>, VariationChunk)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (chrom, start, stop) = self.blocks.next()?;
        Some(read_chunk(self.store, &self.fields, start, stop).map(|chunk| (chrom, chunk)))
    }
}

pub struct ChunkPairIter<'a, S: VariationStore> {
    store: &'a S,
    fields: Vec<String>,
    pairs: std::vec::IntoIter<((usize, usize), (usize, usize))>,
}

impl<S: VariationStore> Iterator for ChunkPairIter<'_, S> {
    type Item = Result<ChunkPair>;

    fn next(&mut self) -> Option<Self::Item> {
        let ((a_start, a_stop), (b_start, b_stop)) = self.pairs.next()?;
        let chunk1 = match read_chunk(self.store, &self.fields, a_start, a_stop) {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(e)),
        };
        let chunk2 = match read_chunk(self.store, &self.fields, b_start, b_stop) {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(ChunkPair { chunk1, chunk2 }))
    }
}
