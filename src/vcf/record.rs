//! # Transient variation records
//!
//! One [`VariationRecord`] per VCF body line. Records exist only
//! between the line parser and the chunk pipeline; afterwards the data
//! lives as columnar slices in a store.

/// The FILTER column of one record. An empty passed list (`PASS`) is
/// distinct from an absent column (`.`).
#[derive(Debug, Clone, PartialEq)]
pub enum FilterStatus {
    Missing,
    Pass,
    Tags(Vec<String>),
}

/// One INFO value, already cast to the dtype the header declared.
/// Scalars are single-element lists; whether the dataset is scalar is
/// decided by the declared arity at shape time.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValues {
    Flag,
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    Strs(Vec<Vec<u8>>),
}

/// One FORMAT tag's per-sample column. `None` marks a sample whose
/// whole call (or this tag of it) was absent.
#[derive(Debug, Clone, PartialEq)]
pub enum CallValues {
    /// Allele indices per sample, always ploidy long, missing = -1.
    /// Phasing is not preserved.
    Gt(Vec<Vec<i8>>),
    Ints(Vec<Option<Vec<i32>>>),
    Floats(Vec<Option<Vec<f32>>>),
    Strs(Vec<Option<Vec<Vec<u8>>>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariationRecord {
    pub chrom: Vec<u8>,
    pub pos: i32,
    pub id: Option<Vec<u8>>,
    pub ref_allele: Vec<u8>,
    pub alt: Option<Vec<Vec<u8>>>,
    pub qual: Option<f32>,
    pub filter: FilterStatus,
    pub info: Vec<(String, InfoValues)>,
    pub calls: Vec<(String, CallValues)>,
}

impl VariationRecord {
    /// Rough in-memory size, used to budget the pre-read cache in bytes.
    pub fn approx_size(&self) -> usize {
        let mut size = std::mem::size_of::<VariationRecord>();
        size += self.chrom.len() + self.ref_allele.len();
        size += self.id.as_ref().map_or(0, Vec::len);
        if let Some(alt) = &self.alt {
            size += alt.iter().map(|a| a.len() + 8).sum::<usize>();
        }
        if let FilterStatus::Tags(tags) = &self.filter {
            size += tags.iter().map(|t| t.len() + 8).sum::<usize>();
        }
        for (tag, values) in &self.info {
            size += tag.len() + 16;
            size += match values {
                InfoValues::Flag => 0,
                InfoValues::Ints(v) => v.len() * 4,
                InfoValues::Floats(v) => v.len() * 4,
                InfoValues::Strs(v) => v.iter().map(|s| s.len() + 8).sum::<usize>(),
            };
        }
        for (tag, values) in &self.calls {
            size += tag.len() + 16;
            size += match values {
                CallValues::Gt(v) => v.iter().map(|g| g.len() + 8).sum::<usize>(),
                CallValues::Ints(v) => v
                    .iter()
                    .map(|s| s.as_ref().map_or(8, |x| x.len() * 4 + 8))
                    .sum::<usize>(),
                CallValues::Floats(v) => v
                    .iter()
                    .map(|s| s.as_ref().map_or(8, |x| x.len() * 4 + 8))
                    .sum::<usize>(),
                CallValues::Strs(v) => v
                    .iter()
                    .map(|s| {
                        s.as_ref()
                            .map_or(8, |x| x.iter().map(|b| b.len() + 8).sum::<usize>() + 8)
                    })
                    .sum(),
            };
        }
        size
    }

    pub fn info_value(&self, tag: &str) -> Option<&InfoValues> {
        self.info
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, v)| v)
    }

    pub fn call_values(&self, tag: &str) -> Option<&CallValues> {
        self.calls
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, v)| v)
    }
}
