//! # Sentinel & dtype registry
//!
//! Every semantic dtype carries a canonical *missing* value (an absent
//! observation) and a *filling* value (padding up to a column width).
//! Keeping sentinels inside the data avoids a parallel presence mask at
//! the cost of reserving one value per dtype: -1 for integers (it
//! survives narrowing to any signed width), NaN for floats, empty bytes
//! for strings.
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MISSING_INT: i32 = -1;
pub const MISSING_GT: i8 = -1;
pub const MISSING_FLOAT: f32 = f32::NAN;
pub const MISSING_STR: &[u8] = b"";

pub const FILLING_INT: i32 = -1;
pub const FILLING_FLOAT: f32 = f32::NAN;
pub const FILLING_STR: &[u8] = b"";

/// Semantic element type of a dataset.
///
/// VCF `Integer` declarations map to `Int16`, `Float` to `Float32`,
/// `Flag` to `Bool` and everything else to fixed-width byte strings.
/// Genotypes are stored as `Int8` allele indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Int8,
    Int16,
    Int32,
    Float32,
    Bool,
    Str,
}

impl DataKind {
    pub fn is_int(self) -> bool {
        matches!(self, DataKind::Int8 | DataKind::Int16 | DataKind::Int32)
    }

    pub fn is_str(self) -> bool {
        matches!(self, DataKind::Str)
    }

    /// Size in bytes of one scalar element on disk. String elements
    /// have a per-dataset width instead.
    pub fn elem_size(self) -> usize {
        match self {
            DataKind::Int8 | DataKind::Bool => 1,
            DataKind::Int16 => 2,
            DataKind::Int32 | DataKind::Float32 => 4,
            DataKind::Str => 1,
        }
    }
}

/// Cast a raw VCF byte token to an integer, mapping the canonical
/// absence tokens (`.` and the empty string) to [`MISSING_INT`].
///
/// Small non-negative tokens are decoded without going through a UTF-8
/// round trip since they dominate real call data.
pub fn to_int(token: &[u8]) -> Result<i32> {
    match token {
        b"" | b"." => Ok(MISSING_INT),
        [d @ b'0'..=b'9'] => Ok(i32::from(d - b'0')),
        [a @ b'0'..=b'9', b @ b'0'..=b'9'] => Ok(i32::from((a - b'0') * 10 + (b - b'0'))),
        _ => std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                Error::malformed(format!(
                    "can not cast to integer: {}",
                    String::from_utf8_lossy(token)
                ))
            }),
    }
}

/// Cast a raw VCF byte token to a float, mapping the canonical absence
/// tokens to [`MISSING_FLOAT`].
pub fn to_float(token: &[u8]) -> Result<f32> {
    match token {
        b"" | b"." => Ok(MISSING_FLOAT),
        _ => std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                Error::malformed(format!(
                    "can not cast to float: {}",
                    String::from_utf8_lossy(token)
                ))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_tokens() {
        assert_eq!(to_int(b"0").unwrap(), 0);
        assert_eq!(to_int(b"42").unwrap(), 42);
        assert_eq!(to_int(b"142").unwrap(), 142);
        assert_eq!(to_int(b"-3").unwrap(), -3);
        assert_eq!(to_int(b".").unwrap(), MISSING_INT);
        assert_eq!(to_int(b"").unwrap(), MISSING_INT);
        assert!(to_int(b"x").is_err());
    }

    #[test]
    fn float_tokens() {
        assert_eq!(to_float(b"0.5").unwrap(), 0.5);
        assert!(to_float(b".").unwrap().is_nan());
        assert!(to_float(b"abc").is_err());
    }
}
