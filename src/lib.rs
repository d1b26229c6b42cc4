//! # varmat
//!
//! `varmat` ingests Variant Call Format (VCF) text streams and
//! materializes them as a chunked, columnar, on-disk variation store,
//! with an equivalent in-memory backing, bounded-memory chunk
//! iteration, chunk-wise statistics and a per-sample FASTA haplotype
//! writer. The [`vcf::VcfParser`] discovers column widths through a
//! bounded pre-read before any dataset is shaped; the
//! [`store::VariationStore`] trait is the single read/append contract
//! both backings implement.
pub mod cli;
pub mod error;
pub mod fasta;
pub mod index;
pub mod ingest;
pub mod matrix;
pub mod missing;
pub mod stats;
pub mod store;
pub mod vcf;

pub use error::{Error, Result, SchemaError};

/// Canonical dataset paths.
pub const CHROM_FIELD: &str = "/variations/chrom";
pub const POS_FIELD: &str = "/variations/pos";
pub const ID_FIELD: &str = "/variations/id";
pub const REF_FIELD: &str = "/variations/ref";
pub const QUAL_FIELD: &str = "/variations/qual";
pub const ALT_FIELD: &str = "/variations/alt";
pub const GT_FIELD: &str = "/calls/GT";

/// Default variations per chunk: the first-axis chunk shape of every
/// dataset and the unit of append and iteration.
pub const VARS_PER_CHUNK: usize = 200;

/// Default byte budget for the pre-read cache.
pub const PRE_READ_MAX_SIZE: usize = 10_000_000;
