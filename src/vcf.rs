//! # VCF parser front-end
//!
//! [`VcfParser`] owns the input byte stream, detects ploidy, parses the
//! header and runs the bounded pre-read, then yields
//! [`VariationRecord`]s: first from the pre-read cache, then straight
//! from the stream. An optional worker pool fans the pure per-line
//! parsing out in submission order; in that mode the max-width
//! accumulators are frozen and the pre-read must have discovered all
//! column widths already.
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use log::{debug, warn};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::error::{Error, Result, SchemaError};
use crate::vcf::cache::RecordCache;
use crate::vcf::header::{Projection, VcfMetadata};
use crate::vcf::line::{FieldWidths, LineParser};
use crate::vcf::record::VariationRecord;
use crate::VARS_PER_CHUNK;

pub mod cache;
pub mod header;
pub mod line;
pub mod record;

/// User overrides for discovered column widths, e.g. capping `alt`.
#[derive(Debug, Clone, Default)]
pub struct MaxFieldLens {
    pub alt: Option<usize>,
    pub info: HashMap<String, usize>,
    pub calls: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct VcfOptions {
    /// Bytes of parsed records to buffer before any dataset is shaped.
    /// Zero (or `None`) disables the pre-read; widths are then
    /// discovered incrementally.
    pub pre_read_max_size: Option<usize>,
    pub kept_fields: Option<Vec<String>>,
    pub ignored_fields: Option<Vec<String>>,
    pub max_field_lens: MaxFieldLens,
    /// Truncate the record stream after this many records.
    pub max_n_vars: Option<usize>,
    /// Fan line parsing out to this many worker threads. Requires a
    /// non-zero pre-read; otherwise single-threaded parsing is used.
    pub n_workers: Option<usize>,
}

struct LineSource {
    reader: Box<dyn BufRead>,
    pushback: VecDeque<Vec<u8>>,
}

impl LineSource {
    fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if let Some(line) = self.pushback.pop_front() {
            return Ok(Some(line));
        }
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(buf))
        }
    }
}

impl std::fmt::Debug for VcfParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcfParser").finish_non_exhaustive()
    }
}

pub struct VcfParser {
    lines: LineSource,
    metadata: Arc<VcfMetadata>,
    projection: Arc<Projection>,
    widths: FieldWidths,
    cache: RecordCache,
    line_parser: LineParser,
    /// Ploidy detected from the first explicit genotype, if any.
    pub ploidy: Option<usize>,
    effective_ploidy: usize,
    max_n_vars: Option<usize>,
    workers: Option<rayon::ThreadPool>,
    track_widths: bool,
}

impl VcfParser {
    /// Build a parser over an arbitrary byte stream: detect ploidy,
    /// parse the header, validate projections and run the pre-read.
    pub fn from_reader(reader: Box<dyn BufRead>, options: VcfOptions) -> Result<VcfParser> {
        let mut lines = LineSource {
            reader,
            pushback: VecDeque::new(),
        };

        let ploidy = determine_ploidy(&mut lines)?;
        let effective_ploidy = ploidy.unwrap_or_else(|| {
            debug!("could not detect ploidy from any genotype, assuming diploid");
            2
        });

        let (header_lines, chrom_line) = read_header(&mut lines)?;
        let metadata = Arc::new(VcfMetadata::parse(&header_lines, &chrom_line)?);
        let projection = Arc::new(Projection::new(
            &metadata,
            options.kept_fields.as_deref(),
            options.ignored_fields.as_deref(),
        )?);

        let widths = FieldWidths::for_schema(&metadata);
        let line_parser = LineParser::new(
            Arc::clone(&metadata),
            Arc::clone(&projection),
            effective_ploidy,
        );
        let mut parser = VcfParser {
            lines,
            metadata,
            projection,
            widths,
            cache: RecordCache::new(),
            line_parser,
            ploidy,
            effective_ploidy,
            max_n_vars: options.max_n_vars,
            workers: None,
            track_widths: true,
        };

        let pre_read_cap = options.pre_read_max_size.unwrap_or(0);
        if pre_read_cap > 0 {
            parser.fill_cache(pre_read_cap)?;
        }

        // user-supplied widths take precedence over whatever the
        // pre-read discovered
        if let Some(alt) = options.max_field_lens.alt {
            parser.widths.alt_arity = alt;
        }
        for (tag, len) in &options.max_field_lens.info {
            parser.widths.info_arity.insert(tag.clone(), *len);
        }
        for (tag, len) in &options.max_field_lens.calls {
            parser.widths.call_arity.insert(tag.clone(), *len);
        }

        if let Some(n_workers) = options.n_workers.filter(|&n| n > 1) {
            if pre_read_cap == 0 {
                warn!(
                    "parse workers need the pre-read pass to discover column widths, \
                     falling back to single-threaded parsing"
                );
            } else {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n_workers)
                    .build()
                    .map_err(|e| Error::Unsupported(format!("can not build worker pool: {e}")))?;
                parser.workers = Some(pool);
                // workers must not mutate the accumulators; widths stay
                // as the pre-read discovered them
                parser.track_widths = false;
            }
        }

        Ok(parser)
    }

    /// Open a VCF file (gzip-framed when the extension is `.gz`).
    pub fn from_path(path: impl AsRef<Path>, options: VcfOptions) -> Result<VcfParser> {
        VcfParser::from_reader(open_vcf(path.as_ref())?, options)
    }

    fn fill_cache(&mut self, max_size: usize) -> Result<()> {
        while self.cache.byte_size() < max_size {
            let Some(line) = self.lines.next_line()? else {
                break;
            };
            if let Some(record) = self.line_parser.parse(&line, Some(&mut self.widths))? {
                self.cache.push(record);
            }
        }
        debug!(
            "pre-read {} records ({} bytes)",
            self.cache.len(),
            self.cache.byte_size()
        );
        Ok(())
    }

    pub fn metadata(&self) -> &Arc<VcfMetadata> {
        &self.metadata
    }

    pub fn projection(&self) -> &Arc<Projection> {
        &self.projection
    }

    pub fn samples(&self) -> &[String] {
        &self.metadata.samples
    }

    /// Maximum arities and string lengths discovered so far (pre-read
    /// plus every record already yielded).
    pub fn field_widths(&self) -> &FieldWidths {
        &self.widths
    }

    pub fn effective_ploidy(&self) -> usize {
        self.effective_ploidy
    }

    /// Iterate the records: the pre-read cache first, then the stream.
    pub fn records(&mut self) -> Records<'_> {
        Records {
            parser: self,
            batch: VecDeque::new(),
            yielded: 0,
            failed: false,
        }
    }
}

pub struct Records<'a> {
    parser: &'a mut VcfParser,
    batch: VecDeque<VariationRecord>,
    yielded: usize,
    failed: bool,
}

impl Records<'_> {
    fn fill_batch(&mut self) -> Result<bool> {
        let mut raw_lines = Vec::with_capacity(VARS_PER_CHUNK);
        while raw_lines.len() < VARS_PER_CHUNK {
            match self.parser.lines.next_line()? {
                Some(line) => raw_lines.push(line),
                None => break,
            }
        }
        if raw_lines.is_empty() {
            return Ok(false);
        }

        let metadata = Arc::clone(&self.parser.metadata);
        let projection = Arc::clone(&self.parser.projection);
        let ploidy = self.parser.effective_ploidy;
        let pool = self.parser.workers.as_ref().expect("worker pool is set");
        let parsed: Vec<Result<Option<VariationRecord>>> = pool.install(|| {
            raw_lines
                .par_iter()
                .map_init(
                    || LineParser::new(Arc::clone(&metadata), Arc::clone(&projection), ploidy),
                    |line_parser, line| line_parser.parse(line, None),
                )
                .collect()
        });
        for item in parsed {
            if let Some(record) = item? {
                self.batch.push_back(record);
            }
        }
        Ok(true)
    }
}

impl Iterator for Records<'_> {
    type Item = Result<VariationRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(max) = self.parser.max_n_vars {
            if self.yielded >= max {
                return None;
            }
        }
        loop {
            if let Some(record) = self.parser.cache.pop() {
                self.yielded += 1;
                return Some(Ok(record));
            }
            if let Some(record) = self.batch.pop_front() {
                self.yielded += 1;
                return Some(Ok(record));
            }

            if self.parser.workers.is_some() {
                match self.fill_batch() {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }

            let line = match self.parser.lines.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            };
            let VcfParser {
                ref mut line_parser,
                ref mut widths,
                track_widths,
                ..
            } = *self.parser;
            let widths = if track_widths { Some(widths) } else { None };
            match line_parser.parse(&line, widths) {
                Ok(Some(record)) => {
                    self.yielded += 1;
                    return Some(Ok(record));
                }
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Open a VCF path, transparently decompressing `.gz` files.
pub fn open_vcf(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Peek ahead to the first body line with an explicit genotype and
/// count its alleles; the peeked lines are chained back onto the input
/// so the main pass is unaffected. Absent sample columns and absent
/// genotypes (`.`, by value equality) are skipped.
fn determine_ploidy(lines: &mut LineSource) -> Result<Option<usize>> {
    let mut read_lines = Vec::new();
    let mut ploidy = None;
    while let Some(line) = lines.next_line()? {
        let is_header = line.starts_with(b"#");
        read_lines.push(line);
        if is_header {
            continue;
        }
        let line = read_lines.last().expect("just pushed");
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        for column in line.split(|&b| b == b'\t').skip(9) {
            if column == b"." {
                continue;
            }
            let gt = column.split(|&b| b == b':').next().unwrap_or(b"");
            if gt == b"." || gt.is_empty() {
                continue;
            }
            let separator = if gt.contains(&b'|') { b'|' } else { b'/' };
            ploidy = Some(gt.split(|&b| b == separator).count());
            break;
        }
        if ploidy.is_some() {
            break;
        }
    }
    // restore the peeked lines onto the stream
    for line in read_lines.into_iter().rev() {
        lines.pushback.push_front(line);
    }
    Ok(ploidy)
}

fn read_header(lines: &mut LineSource) -> Result<(Vec<Vec<u8>>, Vec<u8>)> {
    let mut header_lines = Vec::new();
    while let Some(line) = lines.next_line()? {
        if line.starts_with(b"#CHROM") {
            return Ok((header_lines, line));
        }
        header_lines.push(line);
    }
    Err(SchemaError::MalformedHeader("no #CHROM column header line found".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcf::record::{CallValues, FilterStatus, InfoValues};

    const SMALL_VCF: &[u8] = b"\
##fileformat=VCFv4.0
##INFO=<ID=NS,Number=1,Type=Integer,Description=\"Number of Samples With Data\">
##INFO=<ID=AF,Number=.,Type=Float,Description=\"Allele Frequency\">
##INFO=<ID=DB,Number=0,Type=Flag,Description=\"dbSNP membership\">
##FILTER=<ID=q10,Description=\"Quality below 10\">
##FILTER=<ID=s50,Description=\"Less than 50% of samples have data\">
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">
##FORMAT=<ID=GQ,Number=1,Type=Integer,Description=\"Genotype Quality\">
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tNA1\tNA2\tNA3
20\t14370\trs6054257\tG\tA\t29\tPASS\tNS=3;AF=0.5;DB\tGT:GQ\t0|0:48\t1|0:48\t1/1:43
20\t17330\t.\tT\tA\t3\tq10;s50\tNS=3;AF=0.017\tGT:GQ\t0|0:49\t0|1:3\t0/0:41
20\t1110696\t.\tA\tG,T\t67\t.\tNS=2;AF=0.333,0.667\tGT:GQ\t1|2:21\t2|1:2\t.
";

    fn parser(options: VcfOptions) -> VcfParser {
        VcfParser::from_reader(Box::new(SMALL_VCF), options).unwrap()
    }

    #[test]
    fn detects_ploidy_and_samples() {
        let vcf = parser(VcfOptions::default());
        assert_eq!(vcf.ploidy, Some(2));
        assert_eq!(vcf.samples(), ["NA1", "NA2", "NA3"]);
        assert_eq!(vcf.metadata().format_version.as_deref(), Some("VCFv4.0"));
    }

    #[test]
    fn yields_records_in_order() {
        let mut vcf = parser(VcfOptions::default());
        let records: Vec<_> = vcf.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].chrom, b"20");
        assert_eq!(records[0].pos, 14370);
        assert_eq!(records[0].id.as_deref(), Some(&b"rs6054257"[..]));
        assert_eq!(records[0].filter, FilterStatus::Pass);
        assert_eq!(records[1].filter, FilterStatus::Tags(vec!["q10".into(), "s50".into()]));
        assert_eq!(records[2].filter, FilterStatus::Missing);
        assert_eq!(
            records[2].alt,
            Some(vec![b"G".to_vec(), b"T".to_vec()])
        );
        // absent sample column yields a fully missing genotype
        match records[2].call_values("GT").unwrap() {
            CallValues::Gt(gts) => {
                assert_eq!(gts[0], vec![1, 2]);
                assert_eq!(gts[2], vec![-1, -1]);
            }
            other => panic!("expected genotypes, got {other:?}"),
        }
        match records[0].info_value("DB").unwrap() {
            InfoValues::Flag => {}
            other => panic!("expected a flag, got {other:?}"),
        }
    }

    #[test]
    fn pre_read_cache_then_stream() {
        let mut vcf = parser(VcfOptions {
            pre_read_max_size: Some(100),
            ..VcfOptions::default()
        });
        assert!(!vcf.cache.is_empty());
        // widths were discovered from the cached records
        assert!(vcf.field_widths().alt_arity >= 1);
        let records: Vec<_> = vcf.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].pos, 14370);
        assert_eq!(records[2].pos, 1110696);
    }

    #[test]
    fn max_n_vars_truncates() {
        let mut vcf = parser(VcfOptions {
            max_n_vars: Some(2),
            ..VcfOptions::default()
        });
        assert_eq!(vcf.records().count(), 2);
    }

    #[test]
    fn width_discovery() {
        let mut vcf = parser(VcfOptions::default());
        for record in vcf.records() {
            record.unwrap();
        }
        let widths = vcf.field_widths();
        assert_eq!(widths.alt_arity, 2);
        assert_eq!(widths.info_arity["AF"], 2);
        assert_eq!(widths.filter_arity, 2);
        assert_eq!(widths.chrom_len, 2);
    }

    #[test]
    fn worker_pool_preserves_order() {
        let mut vcf = parser(VcfOptions {
            pre_read_max_size: Some(1),
            n_workers: Some(2),
            ..VcfOptions::default()
        });
        let positions: Vec<i32> = vcf.records().map(|r| r.unwrap().pos).collect();
        assert_eq!(positions, vec![14370, 17330, 1110696]);
    }

    #[test]
    fn fixed_arity_string_format_fields_parse() {
        const TWO_STR_VCF: &[u8] = b"\
##fileformat=VCFv4.0
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">
##FORMAT=<ID=FS,Number=2,Type=String,Description=\"Paired tags\">
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1
1\t10\t.\tA\tT\t.\t.\t.\tGT:FS\t0/1:ab,cd
";
        let mut vcf =
            VcfParser::from_reader(Box::new(TWO_STR_VCF), VcfOptions::default()).unwrap();
        let records: Vec<_> = vcf.records().map(|r| r.unwrap()).collect();
        match records[0].call_values("FS").unwrap() {
            CallValues::Strs(samples) => {
                assert_eq!(
                    samples[0].as_ref().unwrap(),
                    &vec![b"ab".to_vec(), b"cd".to_vec()]
                );
            }
            other => panic!("expected strings, got {other:?}"),
        }
    }

    #[test]
    fn both_projections_is_an_error() {
        let err = VcfParser::from_reader(
            Box::new(SMALL_VCF),
            VcfOptions {
                kept_fields: Some(vec!["/calls/GT".into()]),
                ignored_fields: Some(vec!["/calls/GQ".into()]),
                ..VcfOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(SchemaError::BothKeptAndIgnored)
        ));
    }
}
