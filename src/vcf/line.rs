//! # Per-line VCF record parser
//!
//! A [`LineParser`] turns one newline-terminated body line into a
//! [`VariationRecord`], updating a running max-width accumulator so
//! that variable-arity columns and string widths can be sized before
//! any dataset is created. The FORMAT-column decomposition and parsed
//! genotype strings are memoized: the same FORMAT string recurs for
//! nearly every line and a handful of genotype strings (`0/0`, `0/1`…)
//! dominate real call data.
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::missing::{to_float, to_int, DataKind, MISSING_GT};
use crate::vcf::header::{Arity, Projection, VcfMetadata};
use crate::vcf::record::{CallValues, FilterStatus, InfoValues, VariationRecord};

/// Running maxima for variable-arity fields and string lengths,
/// discovered while parsing. Fixed arities are seeded from the header.
#[derive(Debug, Clone, Default)]
pub struct FieldWidths {
    pub alt_arity: usize,
    pub filter_arity: usize,
    pub info_arity: HashMap<String, usize>,
    pub call_arity: HashMap<String, usize>,

    pub chrom_len: usize,
    pub id_len: usize,
    pub ref_len: usize,
    pub alt_len: usize,
    pub info_str_len: HashMap<String, usize>,
    pub call_str_len: HashMap<String, usize>,
}

impl FieldWidths {
    /// Seed from the parsed schema: fixed arities are taken verbatim
    /// (flags count as one), variable arities start at zero and grow as
    /// records are seen.
    pub fn for_schema(metadata: &VcfMetadata) -> FieldWidths {
        let mut widths = FieldWidths {
            id_len: 10,
            ..FieldWidths::default()
        };
        for (tag, meta) in &metadata.info {
            let arity = match meta.number {
                Arity::Fixed(_) if meta.kind == DataKind::Bool => 1,
                Arity::Fixed(n) => n,
                Arity::Variable => 0,
            };
            widths.info_arity.insert(tag.clone(), arity);
            if meta.number == Arity::Variable && meta.kind.is_str() {
                widths.info_str_len.insert(tag.clone(), 0);
            }
        }
        for (tag, meta) in &metadata.calls {
            let arity = match meta.number {
                Arity::Fixed(_) if meta.kind == DataKind::Bool => 1,
                Arity::Fixed(n) => n,
                Arity::Variable => 0,
            };
            widths.call_arity.insert(tag.clone(), arity);
            if meta.kind.is_str() {
                widths.call_str_len.insert(tag.clone(), 0);
            }
        }
        widths
    }

    fn bump(slot: &mut usize, value: usize) {
        if *slot < value {
            *slot = value;
        }
    }

    fn bump_map(map: &mut HashMap<String, usize>, key: &str, value: usize) {
        let slot = map.entry(key.to_string()).or_insert(0);
        if *slot < value {
            *slot = value;
        }
    }
}

/// One FORMAT tag's decomposed declaration, cached per FORMAT string.
#[derive(Debug)]
struct FormatField {
    tag: String,
    kind: DataKind,
    is_list: bool,
    number: Arity,
}

pub struct LineParser {
    metadata: Arc<VcfMetadata>,
    projection: Arc<Projection>,
    empty_gt: Vec<i8>,
    fmt_cache: HashMap<Vec<u8>, Arc<Vec<FormatField>>>,
    gt_cache: HashMap<Vec<u8>, Arc<Vec<i8>>>,
}

impl LineParser {
    pub fn new(metadata: Arc<VcfMetadata>, projection: Arc<Projection>, ploidy: usize) -> LineParser {
        LineParser {
            metadata,
            projection,
            empty_gt: vec![MISSING_GT; ploidy],
            fmt_cache: HashMap::new(),
            gt_cache: HashMap::new(),
        }
    }

    /// Parse one body line. `widths` is the running max-width
    /// accumulator; `None` disables the updates (parse workers run with
    /// widths frozen after the pre-read).
    pub fn parse(
        &mut self,
        line: &[u8],
        mut widths: Option<&mut FieldWidths>,
    ) -> Result<Option<VariationRecord>> {
        let line = trim_newline(line);
        if line.is_empty() {
            return Ok(None);
        }

        let columns: Vec<&[u8]> = line.split(|&b| b == b'\t').collect();
        if columns.len() < 9 {
            return Err(Error::malformed(format!(
                "expected at least 9 columns, got {}: {}",
                columns.len(),
                String::from_utf8_lossy(line)
            )));
        }

        let chrom = columns[0].to_vec();
        let pos = to_int(columns[1])?;
        if pos < 0 {
            return Err(Error::malformed(format!(
                "missing or negative POS column: {}",
                String::from_utf8_lossy(columns[1])
            )));
        }
        let id = if columns[2] == b"." {
            None
        } else {
            Some(columns[2].to_vec())
        };
        let ref_allele = columns[3].to_vec();

        let alt = if columns[4] == b"." {
            None
        } else {
            Some(
                columns[4]
                    .split(|&b| b == b',')
                    .map(<[u8]>::to_vec)
                    .collect::<Vec<_>>(),
            )
        };

        let qual = if columns[5] == b"." {
            None
        } else {
            Some(to_float(columns[5])?)
        };

        let filter = match columns[6] {
            b"PASS" => FilterStatus::Pass,
            b"." => FilterStatus::Missing,
            other => {
                // PASS mixed with explicit tags is treated as the tag list
                let tags: Vec<String> = other
                    .split(|&b| b == b';')
                    .filter(|t| *t != b"PASS")
                    .map(|t| String::from_utf8_lossy(t).into_owned())
                    .collect();
                if tags.is_empty() {
                    FilterStatus::Pass
                } else {
                    FilterStatus::Tags(tags)
                }
            }
        };

        if let Some(w) = widths.as_deref_mut() {
            FieldWidths::bump(&mut w.chrom_len, chrom.len());
            FieldWidths::bump(&mut w.ref_len, ref_allele.len());
            if let Some(id) = &id {
                FieldWidths::bump(&mut w.id_len, id.len());
            }
            if let Some(alt) = &alt {
                FieldWidths::bump(&mut w.alt_arity, alt.len());
                let longest = alt.iter().map(Vec::len).max().unwrap_or(0);
                FieldWidths::bump(&mut w.alt_len, longest);
            }
            if let FilterStatus::Tags(tags) = &filter {
                FieldWidths::bump(&mut w.filter_arity, tags.len());
            }
        }

        let info = self.parse_info(columns[7], widths.as_deref_mut())?;
        let calls = self.parse_calls(columns[8], &columns[9..], widths)?;

        Ok(Some(VariationRecord {
            chrom,
            pos,
            id,
            ref_allele,
            alt,
            qual,
            filter,
            info,
            calls,
        }))
    }

    fn parse_info(
        &self,
        column: &[u8],
        mut widths: Option<&mut FieldWidths>,
    ) -> Result<Vec<(String, InfoValues)>> {
        if column == b"." {
            return Ok(Vec::new());
        }
        let mut parsed = Vec::new();
        for item in column.split(|&b| b == b';') {
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.iter().position(|&b| b == b'=') {
                Some(eq) => (&item[..eq], Some(&item[eq + 1..])),
                None => (item, None),
            };
            let tag = String::from_utf8_lossy(key).into_owned();
            if self.projection.info_ignored(&tag) {
                continue;
            }
            let Some(meta) = self.metadata.info.get(&tag) else {
                return Err(Error::malformed(format!(
                    "INFO metadata was not defined in header: {tag}"
                )));
            };

            let values = match (meta.kind, value) {
                (DataKind::Bool, _) | (_, None) => InfoValues::Flag,
                (DataKind::Float32, Some(raw)) => InfoValues::Floats(
                    raw.split(|&b| b == b',').map(to_float).collect::<Result<_>>()?,
                ),
                (DataKind::Str, Some(raw)) => InfoValues::Strs(
                    raw.split(|&b| b == b',').map(<[u8]>::to_vec).collect(),
                ),
                (_, Some(raw)) => InfoValues::Ints(
                    raw.split(|&b| b == b',').map(to_int).collect::<Result<_>>()?,
                ),
            };

            if let Some(w) = widths.as_deref_mut() {
                if meta.number == Arity::Variable {
                    let arity = match &values {
                        InfoValues::Flag => 1,
                        InfoValues::Ints(v) => v.len(),
                        InfoValues::Floats(v) => v.len(),
                        InfoValues::Strs(v) => v.len(),
                    };
                    FieldWidths::bump_map(&mut w.info_arity, &tag, arity);
                }
                if let InfoValues::Strs(v) = &values {
                    let longest = v.iter().map(Vec::len).max().unwrap_or(0);
                    FieldWidths::bump_map(&mut w.info_str_len, &tag, longest);
                }
            }

            parsed.push((tag, values));
        }
        Ok(parsed)
    }

    fn parse_calls(
        &mut self,
        format_column: &[u8],
        sample_columns: &[&[u8]],
        mut widths: Option<&mut FieldWidths>,
    ) -> Result<Vec<(String, CallValues)>> {
        if sample_columns.is_empty() {
            return Ok(Vec::new());
        }
        let format = self.parse_format(format_column)?;
        let n_tags: usize = format.len();

        // Split every sample column once; `.` marks a fully absent
        // sample and short columns are right-padded with absent tags.
        let mut sample_items: Vec<Vec<Option<&[u8]>>> = Vec::with_capacity(sample_columns.len());
        for column in sample_columns {
            if *column == b"." {
                sample_items.push(vec![None; n_tags]);
            } else {
                let mut items: Vec<Option<&[u8]>> =
                    column.split(|&b| b == b':').map(Some).collect();
                items.resize(n_tags, None);
                sample_items.push(items);
            }
        }

        let mut parsed = Vec::new();
        for (tag_idx, field) in format.iter().enumerate() {
            if self.projection.call_ignored(&field.tag) || !self.projection.call_kept(&field.tag) {
                continue;
            }
            let column = sample_items.iter().map(|items| items[tag_idx]);

            let values = if field.tag == "GT" {
                let mut gts = Vec::with_capacity(sample_columns.len());
                for token in column {
                    gts.push(self.parse_gt(token)?.as_ref().clone());
                }
                CallValues::Gt(gts)
            } else {
                match field.kind {
                    DataKind::Float32 => CallValues::Floats(parse_call_column(
                        column,
                        field.is_list,
                        to_float,
                    )?),
                    DataKind::Str => {
                        if field.number == Arity::Variable {
                            return Err(Error::Unsupported(format!(
                                "variable-length string FORMAT fields are not supported: {}",
                                field.tag
                            )));
                        }
                        CallValues::Strs(
                            column
                                .map(|token| {
                                    token.map(|t| {
                                        t.split(|&b| b == b',').map(<[u8]>::to_vec).collect()
                                    })
                                })
                                .collect(),
                        )
                    }
                    _ => CallValues::Ints(parse_call_column(column, field.is_list, to_int)?),
                }
            };

            if let Some(w) = widths.as_deref_mut() {
                if field.number == Arity::Variable {
                    let max_len = match &values {
                        CallValues::Gt(v) => v.iter().map(Vec::len).max().unwrap_or(0),
                        CallValues::Ints(v) => {
                            v.iter().map(|s| s.as_ref().map_or(0, Vec::len)).max().unwrap_or(0)
                        }
                        CallValues::Floats(v) => {
                            v.iter().map(|s| s.as_ref().map_or(0, Vec::len)).max().unwrap_or(0)
                        }
                        CallValues::Strs(v) => {
                            v.iter().map(|s| s.as_ref().map_or(0, Vec::len)).max().unwrap_or(0)
                        }
                    };
                    FieldWidths::bump_map(&mut w.call_arity, &field.tag, max_len);
                }
                if let CallValues::Strs(v) = &values {
                    let longest = v
                        .iter()
                        .flatten()
                        .flatten()
                        .map(Vec::len)
                        .max()
                        .unwrap_or(0);
                    FieldWidths::bump_map(&mut w.call_str_len, &field.tag, longest);
                }
            }

            parsed.push((field.tag.clone(), values));
        }
        Ok(parsed)
    }

    fn parse_format(&mut self, format_column: &[u8]) -> Result<Arc<Vec<FormatField>>> {
        if let Some(cached) = self.fmt_cache.get(format_column) {
            return Ok(Arc::clone(cached));
        }
        let mut fields = Vec::new();
        for raw in format_column.split(|&b| b == b':') {
            let tag = String::from_utf8_lossy(raw).into_owned();
            let Some(meta) = self.metadata.calls.get(&tag) else {
                return Err(Error::malformed(format!(
                    "FORMAT metadata was not defined in header: {tag}"
                )));
            };
            fields.push(FormatField {
                tag,
                kind: meta.kind,
                is_list: meta.number != Arity::Fixed(1),
                number: meta.number,
            });
        }
        let fields = Arc::new(fields);
        self.fmt_cache
            .insert(format_column.to_vec(), Arc::clone(&fields));
        Ok(fields)
    }

    /// Parse one genotype token into ploidy allele indices. Accepts `|`
    /// or `/` separators; a lone `.` (or an absent sample) yields the
    /// ploidy-length missing vector.
    fn parse_gt(&mut self, token: Option<&[u8]>) -> Result<Arc<Vec<i8>>> {
        let Some(token) = token else {
            return Ok(Arc::new(self.empty_gt.clone()));
        };
        if token == b"." {
            return Ok(Arc::new(self.empty_gt.clone()));
        }
        if let Some(cached) = self.gt_cache.get(token) {
            return Ok(Arc::clone(cached));
        }
        let separator = if token.contains(&b'|') { b'|' } else { b'/' };
        let alleles: Vec<i8> = token
            .split(|&b| b == separator)
            .map(|allele| {
                if allele == b"." {
                    Ok(MISSING_GT)
                } else {
                    let value = to_int(allele)?;
                    i8::try_from(value).map_err(|_| {
                        Error::malformed(format!(
                            "allele index out of range: {}",
                            String::from_utf8_lossy(allele)
                        ))
                    })
                }
            })
            .collect::<Result<_>>()?;
        let alleles = Arc::new(alleles);
        self.gt_cache.insert(token.to_vec(), Arc::clone(&alleles));
        Ok(alleles)
    }
}

fn parse_call_column<'a, T>(
    column: impl Iterator<Item = Option<&'a [u8]>>,
    is_list: bool,
    cast: fn(&[u8]) -> Result<T>,
) -> Result<Vec<Option<Vec<T>>>> {
    column
        .map(|token| {
            token
                .map(|t| {
                    if is_list {
                        t.split(|&b| b == b',').map(cast).collect()
                    } else {
                        Ok(vec![cast(t)?])
                    }
                })
                .transpose()
        })
        .collect()
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
