//! # Chunk pipeline
//!
//! Turns the parser's record stream into store appends: datasets are
//! shaped from the widths the pre-read discovered, chunk buffers start
//! out missing-filled, rows narrower than the column width keep the
//! filling sentinel in their tail, and values wider than the column are
//! dropped and counted. Exceeding the `alt` width is a hard error with
//! remediation advice; every other field logs and leaves the row
//! missing.
use std::collections::BTreeMap;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::missing::DataKind;
use crate::store::{DatasetMeta, VariationChunk, VariationStore};
use crate::vcf::header::{Arity, Projection, VcfMetadata};
use crate::vcf::line::FieldWidths;
use crate::vcf::record::{CallValues, FilterStatus, InfoValues, VariationRecord};
use crate::vcf::VcfParser;
use crate::{ALT_FIELD, CHROM_FIELD, ID_FIELD, POS_FIELD, QUAL_FIELD, REF_FIELD};

/// Extra bytes on top of the discovered maximum string length, to
/// absorb slightly longer values without reshaping.
const STR_WIDTH_SLACK: usize = 5;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub chunk_size: usize,
    /// Raise at end of ingest if any field had to drop values.
    pub strict: bool,
    /// Skip records with more alternate alleles than the alt column
    /// holds instead of raising.
    pub ignore_alt: bool,
}

impl Default for IngestOptions {
    fn default() -> IngestOptions {
        IngestOptions {
            chunk_size: crate::VARS_PER_CHUNK,
            strict: false,
            ignore_alt: false,
        }
    }
}

/// Per-field truncation bookkeeping: how many rows dropped a value and
/// the widest value seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFit {
    pub count: usize,
    pub width: usize,
    pub max_len: usize,
}

#[derive(Debug, Default)]
pub struct IngestLog {
    pub variations_processed: usize,
    pub data_no_fit: BTreeMap<String, NoFit>,
    pub skipped_wide_alt: usize,
}

impl IngestLog {
    fn bump(&mut self, path: &str, width: usize, needed: usize) {
        let entry = self.data_no_fit.entry(path.to_string()).or_default();
        entry.count += 1;
        entry.width = width;
        if entry.max_len < needed {
            entry.max_len = needed;
        }
    }
}

/// Consume `parser` into `store`.
pub fn put_vars<S: VariationStore>(
    store: &mut S,
    parser: &mut VcfParser,
    options: IngestOptions,
) -> Result<IngestLog> {
    store.set_samples(parser.samples().to_vec())?;
    let metas = shape_datasets(
        parser.metadata(),
        parser.projection(),
        parser.field_widths(),
        parser.effective_ploidy(),
        parser.samples().len(),
        options.chunk_size,
    );
    let alt_capacity = metas
        .iter()
        .find(|meta| meta.path == ALT_FIELD)
        .map_or(0, |meta| meta.row_shape[0]);

    let mut log = IngestLog::default();
    let mut builder = ChunkBuilder::new(metas, options.chunk_size);
    for record in parser.records() {
        let record = record?;
        if options.ignore_alt {
            if let Some(alt) = &record.alt {
                if alt.len() > alt_capacity {
                    log.skipped_wide_alt += 1;
                    continue;
                }
            }
        }
        builder.push_record(&record, &mut log)?;
        log.variations_processed += 1;
        if builder.is_full() {
            store.append_chunk(&builder.chunk())?;
            builder.reset();
        }
    }
    if builder.len > 0 {
        store.append_chunk(&builder.chunk())?;
    }
    store.flush()?;

    info!(
        "stored {} variations across {} datasets",
        log.variations_processed,
        store.field_paths().len()
    );
    for (path, no_fit) in &log.data_no_fit {
        warn!(
            "field {path}: dropped values from {} rows (width {}, widest value {})",
            no_fit.count, no_fit.width, no_fit.max_len
        );
    }
    if options.strict {
        if let Some((path, no_fit)) = log.data_no_fit.iter().next() {
            return Err(Error::WidthExceeded {
                field: path.clone(),
                width: no_fit.width,
                needed: no_fit.max_len,
            });
        }
    }
    Ok(log)
}

/// Compute a dataset descriptor for every field the store will carry,
/// using the declared arities and the discovered maxima. Variable
/// fields that stayed empty through the pre-read are skipped with a
/// warning. A trailing axis of length one is collapsed away.
pub fn shape_datasets(
    metadata: &VcfMetadata,
    projection: &Projection,
    widths: &FieldWidths,
    ploidy: usize,
    n_samples: usize,
    chunk_size: usize,
) -> Vec<DatasetMeta> {
    let mut metas = Vec::new();
    let str_width = |max_len: usize| max_len.max(1) + STR_WIDTH_SLACK;

    metas.push(DatasetMeta::new(
        CHROM_FIELD,
        DataKind::Str,
        vec![],
        str_width(widths.chrom_len),
        chunk_size,
    ));
    metas.push(DatasetMeta::new(POS_FIELD, DataKind::Int32, vec![], 0, chunk_size));
    metas.push(DatasetMeta::new(
        ID_FIELD,
        DataKind::Str,
        vec![],
        str_width(widths.id_len),
        chunk_size,
    ));
    metas.push(DatasetMeta::new(
        REF_FIELD,
        DataKind::Str,
        vec![],
        str_width(widths.ref_len),
        chunk_size,
    ));
    metas.push(DatasetMeta::new(QUAL_FIELD, DataKind::Float32, vec![], 0, chunk_size));
    let alt_arity = if widths.alt_arity == 0 {
        warn!("no alternate alleles seen while sizing columns, using width 1 for alt");
        1
    } else {
        widths.alt_arity
    };
    metas.push(DatasetMeta::new(
        ALT_FIELD,
        DataKind::Str,
        vec![alt_arity],
        str_width(widths.alt_len),
        chunk_size,
    ));

    if !metadata.filter.is_empty() {
        for tag in metadata.filter.keys() {
            let path = format!("/variations/filter/{tag}");
            if projection.is_ignored(&path) {
                continue;
            }
            metas.push(DatasetMeta::new(path, DataKind::Bool, vec![], 0, chunk_size));
        }
        metas.push(DatasetMeta::new(
            "/variations/filter/no_filters",
            DataKind::Bool,
            vec![],
            0,
            chunk_size,
        ));
    }

    for (tag, field) in &metadata.info {
        let path = format!("/variations/info/{tag}");
        if projection.is_ignored(&path)
            || (projection.kept_set() && !projection.kept_contains(&path))
        {
            continue;
        }
        let arity = match field.number {
            Arity::Fixed(_) if field.kind == DataKind::Bool => 1,
            Arity::Fixed(n) => n,
            Arity::Variable => widths.info_arity.get(tag).copied().unwrap_or(0),
        };
        if arity == 0 {
            warn!("INFO field {tag} is empty in the pre-read records, skipping its dataset");
            continue;
        }
        let row_shape = if arity == 1 { vec![] } else { vec![arity] };
        let width = if field.kind.is_str() {
            str_width(widths.info_str_len.get(tag).copied().unwrap_or(0))
        } else {
            0
        };
        metas.push(DatasetMeta::new(path, field.kind, row_shape, width, chunk_size));
    }

    for (tag, field) in &metadata.calls {
        let path = format!("/calls/{tag}");
        if projection.is_ignored(&path)
            || (projection.kept_set() && !projection.kept_contains(&path))
        {
            continue;
        }
        let (kind, depth) = if tag == "GT" {
            (DataKind::Int8, ploidy)
        } else {
            let depth = match field.number {
                Arity::Fixed(_) if field.kind == DataKind::Bool => 1,
                Arity::Fixed(n) => n,
                Arity::Variable => widths.call_arity.get(tag).copied().unwrap_or(0),
            };
            if depth == 0 {
                warn!("FORMAT field {tag} is empty in the pre-read records, skipping its dataset");
                continue;
            }
            (field.kind, depth)
        };
        let row_shape = if depth == 1 {
            vec![n_samples]
        } else {
            vec![n_samples, depth]
        };
        let width = if kind.is_str() {
            str_width(widths.call_str_len.get(tag).copied().unwrap_or(0))
        } else {
            0
        };
        metas.push(DatasetMeta::new(path, kind, row_shape, width, chunk_size));
    }

    metas
}

struct ChunkBuilder {
    metas: Vec<DatasetMeta>,
    slabs: Vec<Matrix>,
    capacity: usize,
    len: usize,
}

impl ChunkBuilder {
    fn new(metas: Vec<DatasetMeta>, capacity: usize) -> ChunkBuilder {
        let capacity = capacity.max(1);
        let slabs = metas.iter().map(|meta| meta.filled_rows(capacity)).collect();
        ChunkBuilder {
            metas,
            slabs,
            capacity,
            len: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    fn chunk(&self) -> VariationChunk {
        let mut chunk = VariationChunk::new();
        for (meta, slab) in self.metas.iter().zip(&self.slabs) {
            chunk
                .insert(meta.clone(), slab.slice_rows(0, self.len))
                .expect("builder slabs share one length");
        }
        chunk
    }

    fn reset(&mut self) {
        for (meta, slab) in self.metas.iter().zip(self.slabs.iter_mut()) {
            *slab = meta.filled_rows(self.capacity);
        }
        self.len = 0;
    }

    fn push_record(&mut self, record: &VariationRecord, log: &mut IngestLog) -> Result<()> {
        let row = self.len;
        for (meta, slab) in self.metas.iter().zip(self.slabs.iter_mut()) {
            write_field(meta, slab, row, record, log)?;
        }
        self.len += 1;
        Ok(())
    }
}

fn write_field(
    meta: &DatasetMeta,
    slab: &mut Matrix,
    row: usize,
    record: &VariationRecord,
    log: &mut IngestLog,
) -> Result<()> {
    match meta.path.as_str() {
        CHROM_FIELD => set_str_logged(slab, &[row], &record.chrom, meta, log),
        POS_FIELD => slab.set_int(&[row], record.pos),
        ID_FIELD => {
            if let Some(id) = &record.id {
                set_str_logged(slab, &[row], id, meta, log);
            }
        }
        REF_FIELD => set_str_logged(slab, &[row], &record.ref_allele, meta, log),
        QUAL_FIELD => {
            if let Some(qual) = record.qual {
                slab.set_float(&[row], qual);
            }
        }
        ALT_FIELD => {
            if let Some(alt) = &record.alt {
                let capacity = meta.row_shape[0];
                if alt.len() > capacity {
                    return Err(Error::WidthExceeded {
                        field: ALT_FIELD.to_string(),
                        width: capacity,
                        needed: alt.len(),
                    });
                }
                for (slot, allele) in alt.iter().enumerate() {
                    set_str_logged(slab, &[row, slot], allele, meta, log);
                }
                // unused slots keep the filling sentinel (empty bytes)
            }
        }
        path if path.starts_with("/variations/filter/") => {
            let value = if meta.name() == "no_filters" {
                matches!(record.filter, FilterStatus::Missing)
            } else {
                match &record.filter {
                    FilterStatus::Tags(tags) => tags.iter().any(|tag| tag == meta.name()),
                    _ => false,
                }
            };
            slab.set_bool(&[row], value);
        }
        path if path.starts_with("/variations/info/") => {
            write_info(meta, slab, row, record, log);
        }
        path if path.starts_with("/calls/") => {
            write_calls(meta, slab, row, record, log);
        }
        other => {
            return Err(Error::shape(format!("dataset path out of any group: {other}")));
        }
    }
    Ok(())
}

fn write_info(
    meta: &DatasetMeta,
    slab: &mut Matrix,
    row: usize,
    record: &VariationRecord,
    log: &mut IngestLog,
) {
    let Some(values) = record.info_value(meta.name()) else {
        return;
    };
    if meta.row_shape.is_empty() {
        // scalar dataset: expect one value, log and take the first on a
        // longer list
        match values {
            InfoValues::Flag => slab.set_bool(&[row], true),
            InfoValues::Ints(v) => {
                if v.len() != 1 {
                    log.bump(&meta.path, 1, v.len());
                }
                if let Some(&value) = v.first() {
                    slab.set_int(&[row], value);
                }
            }
            InfoValues::Floats(v) => {
                if v.len() != 1 {
                    log.bump(&meta.path, 1, v.len());
                }
                if let Some(&value) = v.first() {
                    slab.set_float(&[row], value);
                }
            }
            InfoValues::Strs(v) => {
                if v.len() != 1 {
                    log.bump(&meta.path, 1, v.len());
                }
                if let Some(value) = v.first() {
                    set_str_logged(slab, &[row], value, meta, log);
                }
            }
        }
        return;
    }

    let capacity = meta.row_shape[0];
    match values {
        InfoValues::Flag => slab.set_bool(&[row, 0], true),
        InfoValues::Ints(v) => {
            if v.len() > capacity {
                log.bump(&meta.path, capacity, v.len());
            } else {
                for (slot, &value) in v.iter().enumerate() {
                    slab.set_int(&[row, slot], value);
                }
            }
        }
        InfoValues::Floats(v) => {
            if v.len() > capacity {
                log.bump(&meta.path, capacity, v.len());
            } else {
                for (slot, &value) in v.iter().enumerate() {
                    slab.set_float(&[row, slot], value);
                }
            }
        }
        InfoValues::Strs(v) => {
            if v.len() > capacity {
                log.bump(&meta.path, capacity, v.len());
            } else {
                for (slot, value) in v.iter().enumerate() {
                    set_str_logged(slab, &[row, slot], value, meta, log);
                }
            }
        }
    }
}

fn write_calls(
    meta: &DatasetMeta,
    slab: &mut Matrix,
    row: usize,
    record: &VariationRecord,
    log: &mut IngestLog,
) {
    let Some(values) = record.call_values(meta.name()) else {
        return;
    };
    let n_samples = meta.row_shape[0];
    match values {
        CallValues::Gt(gts) => {
            if meta.row_shape.len() == 2 {
                let ploidy = meta.row_shape[1];
                for (sample, alleles) in gts.iter().enumerate().take(n_samples) {
                    if alleles.len() != ploidy {
                        log.bump(&meta.path, ploidy, alleles.len());
                        continue;
                    }
                    for (slot, &allele) in alleles.iter().enumerate() {
                        slab.set_int(&[row, sample, slot], i32::from(allele));
                    }
                }
            } else {
                for (sample, alleles) in gts.iter().enumerate().take(n_samples) {
                    if let Some(&allele) = alleles.first() {
                        slab.set_int(&[row, sample], i32::from(allele));
                    }
                }
            }
        }
        CallValues::Ints(samples) => {
            write_call_numbers(meta, slab, row, samples, Matrix::set_int, log);
        }
        CallValues::Floats(samples) => {
            write_call_numbers(meta, slab, row, samples, Matrix::set_float, log);
        }
        CallValues::Strs(samples) => {
            if row_fits(meta, samples, log) {
                for (sample, values) in samples.iter().enumerate().take(n_samples) {
                    let Some(values) = values else { continue };
                    if meta.row_shape.len() == 1 {
                        if let Some(value) = values.first() {
                            set_str_logged(slab, &[row, sample], value, meta, log);
                        }
                    } else {
                        for (slot, value) in values.iter().enumerate() {
                            set_str_logged(slab, &[row, sample, slot], value, meta, log);
                        }
                    }
                }
            }
        }
    }
}

/// Whole-row precheck: if any sample brings more values than the
/// dataset depth, the field's row is dropped and counted, mirroring a
/// failed row-wise assignment.
fn row_fits<T>(meta: &DatasetMeta, samples: &[Option<Vec<T>>], log: &mut IngestLog) -> bool {
    let depth = meta.row_shape.get(1).copied().unwrap_or(1);
    let widest = samples
        .iter()
        .map(|sample| sample.as_ref().map_or(0, Vec::len))
        .max()
        .unwrap_or(0);
    if widest > depth {
        log.bump(&meta.path, depth, widest);
        return false;
    }
    true
}

fn write_call_numbers<T: Copy>(
    meta: &DatasetMeta,
    slab: &mut Matrix,
    row: usize,
    samples: &[Option<Vec<T>>],
    set: fn(&mut Matrix, &[usize], T),
    log: &mut IngestLog,
) {
    if !row_fits(meta, samples, log) {
        return;
    }
    let n_samples = meta.row_shape[0];
    for (sample, values) in samples.iter().enumerate().take(n_samples) {
        let Some(values) = values else { continue };
        if meta.row_shape.len() == 1 {
            if let Some(&value) = values.first() {
                set(slab, &[row, sample], value);
            }
        } else {
            for (slot, &value) in values.iter().enumerate() {
                set(slab, &[row, sample, slot], value);
            }
            // shorter samples keep the filling sentinel in their tail
        }
    }
}

fn set_str_logged(
    slab: &mut Matrix,
    index: &[usize],
    value: &[u8],
    meta: &DatasetMeta,
    log: &mut IngestLog,
) {
    if let Some(strings) = slab.as_str_mut() {
        if strings.set(index, value).is_err() {
            log.bump(&meta.path, meta.str_width, value.len());
        }
    }
}
