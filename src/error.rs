//! # Error types for `varmat`
//!
//! All failure modes are distinguishable by kind, not just by message.
//! Binaries wrap these in `anyhow` for context; the library itself only
//! ever returns [`Error`].
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Problems with the VCF header or with field projections checked
/// against the parsed schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("field does not exist in the VCF schema: {0}")]
    UnknownField(String),
    #[error("kept_fields and ignored_fields can not be set at the same time")]
    BothKeptAndIgnored,
    #[error("malformed VCF header line: {0}")]
    MalformedHeader(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A body line that could not be tokenized or cast.
    #[error("malformed VCF record: {0}")]
    MalformedRecord(String),

    #[error("unsupported feature: {0}")]
    Unsupported(String),

    /// Chunks whose fields disagree on their first-axis length, or an
    /// append whose element shape disagrees with the stored dataset.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A row needed more slots than the dataset width discovered at
    /// shape time. Only raised for fields where silent truncation is
    /// unacceptable; other fields log and drop instead.
    #[error(
        "field {field}: row needs width {needed} but the dataset was \
         created with width {width}; pre-read more records or pass \
         max_field_lens {{\"{field}\": {needed}}} to the parser"
    )]
    WidthExceeded {
        field: String,
        width: usize,
        needed: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedRecord(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }
}
