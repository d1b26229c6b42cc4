//! # VCF header & schema model
//!
//! The header block is parsed into three field catalogs (INFO, CALLS,
//! FILTER) plus the fixed VARIATIONS fields. Each catalog entry carries
//! the declared arity and the semantic dtype the columnar store will
//! use for it.
use std::collections::{BTreeMap, HashSet};

use crate::error::{Result, SchemaError};
use crate::missing::DataKind;

/// Declared number of values per record for a field: an exact count or
/// the VCF "variable" symbols (`A`, `G`, `R`, `.`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variable,
}

#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub id: String,
    pub number: Arity,
    pub kind: DataKind,
    pub description: String,
}

/// Parsed header block: field catalogs, sample names and the loose
/// `##key=value` lines.
#[derive(Debug, Clone, Default)]
pub struct VcfMetadata {
    pub format_version: Option<String>,
    pub samples: Vec<String>,
    pub info: BTreeMap<String, FieldMeta>,
    pub calls: BTreeMap<String, FieldMeta>,
    pub filter: BTreeMap<String, FieldMeta>,
    pub other: BTreeMap<String, String>,
}

/// The six fixed per-variation fields and their dtypes.
pub const VARIATION_FIELDS: &[(&str, DataKind)] = &[
    ("chrom", DataKind::Str),
    ("pos", DataKind::Int32),
    ("id", DataKind::Str),
    ("ref", DataKind::Str),
    ("qual", DataKind::Float32),
    ("alt", DataKind::Str),
];

impl VcfMetadata {
    /// Parse the collected `##` lines plus the `#CHROM` column-header
    /// line (whose 10th-onward fields are the sample names).
    pub fn parse(header_lines: &[Vec<u8>], chrom_line: &[u8]) -> Result<VcfMetadata> {
        let mut meta = VcfMetadata::default();

        let chrom_line = String::from_utf8_lossy(chrom_line);
        let columns: Vec<&str> = chrom_line.trim_end().split('\t').collect();
        if columns.is_empty() || !columns[0].starts_with("#CHROM") {
            return Err(SchemaError::MalformedHeader(chrom_line.into_owned()).into());
        }
        meta.samples = columns.iter().skip(9).map(|s| (*s).to_string()).collect();

        for line in header_lines {
            let line = String::from_utf8_lossy(line);
            let line = line.trim_end();
            if let Some(body) = line.strip_prefix("##FORMAT=<") {
                let field = parse_structured_line(body, line)?;
                meta.calls.insert(field.id.clone(), field);
            } else if let Some(body) = line.strip_prefix("##INFO=<") {
                let field = parse_structured_line(body, line)?;
                meta.info.insert(field.id.clone(), field);
            } else if let Some(body) = line.strip_prefix("##FILTER=<") {
                let mut field = parse_structured_line(body, line)?;
                field.kind = DataKind::Bool;
                meta.filter.insert(field.id.clone(), field);
            } else if let Some(body) = line.strip_prefix("##") {
                let Some((key, value)) = body.split_once('=') else {
                    return Err(SchemaError::MalformedHeader(line.to_string()).into());
                };
                if key == "fileformat" {
                    meta.format_version = Some(value.trim().to_string());
                } else {
                    meta.other.insert(key.to_string(), value.trim().to_string());
                }
            } else {
                return Err(SchemaError::MalformedHeader(line.to_string()).into());
            }
        }

        Ok(meta)
    }

    /// Whether `path` names a known dataset: a fixed variation field,
    /// `/variations/info/TAG`, `/variations/filter/TAG` or `/calls/TAG`.
    pub fn has_path(&self, path: &str) -> bool {
        if let Some(tag) = path.strip_prefix("/calls/") {
            return self.calls.contains_key(tag);
        }
        if let Some(tag) = path.strip_prefix("/variations/info/") {
            return self.info.contains_key(tag);
        }
        if let Some(tag) = path.strip_prefix("/variations/filter/") {
            return tag == "no_filters" || self.filter.contains_key(tag);
        }
        if let Some(field) = path.strip_prefix("/variations/") {
            return VARIATION_FIELDS.iter().any(|(name, _)| *name == field);
        }
        false
    }
}

/// Split the body of a `##INFO=<…>`/`##FORMAT=<…>`/`##FILTER=<…>`
/// declaration on commas, keeping quoted values (which may themselves
/// contain commas) intact.
fn split_header_items(body: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in body.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => {
                current.push(ch);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
            }
            ',' if !in_quotes => {
                items.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        items.push(current);
    }
    items
}

fn parse_structured_line(body: &str, full_line: &str) -> Result<FieldMeta> {
    let body = body.strip_suffix('>').unwrap_or(body);
    let mut id = None;
    let mut number = Arity::Fixed(1);
    let mut kind = DataKind::Str;
    let mut description = String::new();
    for item in split_header_items(body) {
        let Some((key, value)) = item.split_once('=') else {
            return Err(SchemaError::MalformedHeader(full_line.to_string()).into());
        };
        match key.trim() {
            "ID" => id = Some(value.trim().to_string()),
            "Number" => {
                number = match value.trim().parse::<usize>() {
                    Ok(n) => Arity::Fixed(n),
                    Err(_) => Arity::Variable,
                };
            }
            "Type" => {
                kind = match value.trim() {
                    "Integer" => DataKind::Int16,
                    "Float" => DataKind::Float32,
                    "Flag" => DataKind::Bool,
                    _ => DataKind::Str,
                };
            }
            "Description" => description = value.trim().to_string(),
            _ => {}
        }
    }
    let Some(id) = id else {
        return Err(SchemaError::MalformedHeader(format!("header line has no ID: {full_line}")).into());
    };
    Ok(FieldMeta {
        id,
        number,
        kind,
        description,
    })
}

/// Validated kept/ignored field projection over full dataset paths.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    kept: Option<HashSet<String>>,
    ignored: HashSet<String>,
}

impl Projection {
    pub fn new(
        metadata: &VcfMetadata,
        kept_fields: Option<&[String]>,
        ignored_fields: Option<&[String]>,
    ) -> Result<Projection> {
        if kept_fields.is_some() && ignored_fields.is_some() {
            return Err(SchemaError::BothKeptAndIgnored.into());
        }
        let check = |fields: &[String]| -> Result<HashSet<String>> {
            let mut set = HashSet::new();
            for field in fields {
                if !metadata.has_path(field) {
                    return Err(SchemaError::UnknownField(field.clone()).into());
                }
                set.insert(field.clone());
            }
            Ok(set)
        };
        Ok(Projection {
            kept: kept_fields.map(check).transpose()?,
            ignored: ignored_fields.map(check).transpose()?.unwrap_or_default(),
        })
    }

    pub fn keeps(&self, path: &str) -> bool {
        if self.ignored.contains(path) {
            return false;
        }
        match &self.kept {
            Some(kept) => kept.contains(path),
            None => true,
        }
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored.contains(path)
    }

    pub fn kept_set(&self) -> bool {
        self.kept.is_some()
    }

    pub fn kept_contains(&self, path: &str) -> bool {
        self.kept.as_ref().is_some_and(|kept| kept.contains(path))
    }

    /// The line parser drops ignored tags early; kept-field filtering of
    /// INFO happens at shape time, matching how calls and info differ in
    /// the record parser.
    pub fn info_ignored(&self, tag: &str) -> bool {
        self.ignored.contains(&format!("/variations/info/{tag}"))
    }

    pub fn call_ignored(&self, tag: &str) -> bool {
        self.ignored.contains(&format!("/calls/{tag}"))
    }

    pub fn call_kept(&self, tag: &str) -> bool {
        match &self.kept {
            Some(kept) => kept.contains(&format!("/calls/{tag}")),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_lines() -> Vec<Vec<u8>> {
        vec![
            b"##fileformat=VCFv4.0\n".to_vec(),
            b"##source=test\n".to_vec(),
            b"##INFO=<ID=NS,Number=1,Type=Integer,Description=\"Number of Samples With Data\">\n"
                .to_vec(),
            b"##INFO=<ID=AF,Number=.,Type=Float,Description=\"Allele Frequency, per allele\">\n"
                .to_vec(),
            b"##FILTER=<ID=q10,Description=\"Quality below 10\">\n".to_vec(),
            b"##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n".to_vec(),
            b"##FORMAT=<ID=HQ,Number=2,Type=Integer,Description=\"Haplotype Quality\">\n".to_vec(),
        ]
    }

    #[test]
    fn parses_catalogs() {
        let meta = VcfMetadata::parse(
            &header_lines(),
            b"#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tNA1\tNA2\n",
        )
        .unwrap();
        assert_eq!(meta.format_version.as_deref(), Some("VCFv4.0"));
        assert_eq!(meta.samples, vec!["NA1", "NA2"]);
        let ns = &meta.info["NS"];
        assert_eq!(ns.number, Arity::Fixed(1));
        assert_eq!(ns.kind, DataKind::Int16);
        let af = &meta.info["AF"];
        assert_eq!(af.number, Arity::Variable);
        assert_eq!(af.kind, DataKind::Float32);
        // the quoted comma stays inside the description
        assert_eq!(af.description, "Allele Frequency, per allele");
        let hq = &meta.calls["HQ"];
        assert_eq!(hq.number, Arity::Fixed(2));
        assert!(meta.filter.contains_key("q10"));
        assert_eq!(meta.other["source"], "test");
    }

    #[test]
    fn path_lookup() {
        let meta = VcfMetadata::parse(
            &header_lines(),
            b"#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tNA1\n",
        )
        .unwrap();
        assert!(meta.has_path("/calls/GT"));
        assert!(meta.has_path("/variations/info/AF"));
        assert!(meta.has_path("/variations/filter/q10"));
        assert!(meta.has_path("/variations/filter/no_filters"));
        assert!(meta.has_path("/variations/pos"));
        assert!(!meta.has_path("/calls/DP"));
        assert!(!meta.has_path("/variations/info/XX"));
    }

    #[test]
    fn projection_validation() {
        let meta = VcfMetadata::parse(
            &header_lines(),
            b"#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tNA1\n",
        )
        .unwrap();
        let kept = vec!["/calls/GT".to_string()];
        let ignored = vec!["/calls/HQ".to_string()];
        assert!(Projection::new(&meta, Some(&kept), Some(&ignored)).is_err());
        assert!(Projection::new(&meta, Some(&["/calls/NOPE".to_string()]), None).is_err());

        let proj = Projection::new(&meta, None, Some(&ignored)).unwrap();
        assert!(proj.call_ignored("HQ"));
        assert!(!proj.call_ignored("GT"));
        assert!(proj.keeps("/calls/GT"));
        assert!(!proj.keeps("/calls/HQ"));
    }
}
