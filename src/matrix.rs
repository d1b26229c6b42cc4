//! # Columnar matrix slabs
//!
//! A [`Matrix`] is one typed, dense slab of a dataset: the unit both
//! backings store and both the chunk pipeline and the reducers consume.
//! Numeric and boolean slabs are `ndarray` arrays; strings are
//! fixed-width byte rows ([`StrMatrix`]) so that every dataset keeps a
//! rectangular shape with the variation count on the first axis.
use ndarray::{ArrayD, Axis, IxDyn, Slice};

use crate::error::{Error, Result};
use crate::missing::{DataKind, MISSING_FLOAT, MISSING_GT, MISSING_INT};

/// Fixed-width byte strings with a logical shape, numpy `S`-dtype style.
///
/// The stored buffer is row major with `width` bytes per element;
/// shorter values are NUL padded and trimmed again on read.
#[derive(Debug, Clone, PartialEq)]
pub struct StrMatrix {
    shape: Vec<usize>,
    width: usize,
    data: Vec<u8>,
}

impl StrMatrix {
    pub fn filled(shape: &[usize], width: usize, fill: &[u8]) -> StrMatrix {
        let n_elems: usize = shape.iter().product();
        let mut data = vec![0u8; n_elems * width];
        if !fill.is_empty() {
            for elem in data.chunks_mut(width.max(1)) {
                let n = fill.len().min(width);
                elem[..n].copy_from_slice(&fill[..n]);
            }
        }
        StrMatrix {
            shape: shape.to_vec(),
            width,
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn nrows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    fn elems_per_row(&self) -> usize {
        self.shape[1..].iter().product()
    }

    fn offset(&self, index: &[usize]) -> usize {
        assert_eq!(index.len(), self.shape.len(), "index rank mismatch");
        let mut off = 0;
        for (i, (&idx, &dim)) in index.iter().zip(self.shape.iter()).enumerate() {
            assert!(idx < dim, "index {idx} out of bounds for axis {i}");
            off = off * dim + idx;
        }
        off * self.width
    }

    /// One element, trimmed of its trailing NUL padding.
    pub fn get(&self, index: &[usize]) -> &[u8] {
        let off = self.offset(index);
        let elem = &self.data[off..off + self.width];
        let end = elem.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        &elem[..end]
    }

    /// Write one element; values longer than the element width are an
    /// error so that truncation never happens silently here.
    pub fn set(&mut self, index: &[usize], value: &[u8]) -> Result<()> {
        if value.len() > self.width {
            return Err(Error::shape(format!(
                "string of length {} does not fit in element width {}",
                value.len(),
                self.width
            )));
        }
        let off = self.offset(index);
        let elem = &mut self.data[off..off + self.width];
        elem.fill(0);
        elem[..value.len()].copy_from_slice(value);
        Ok(())
    }

    pub fn append(&mut self, other: &StrMatrix) -> Result<()> {
        if self.shape[1..] != other.shape[1..] || self.width != other.width {
            return Err(Error::shape(format!(
                "can not append string rows of shape {:?} (width {}) to {:?} (width {})",
                other.shape, other.width, self.shape, self.width
            )));
        }
        self.data.extend_from_slice(&other.data);
        self.shape[0] += other.nrows();
        Ok(())
    }

    pub fn slice_rows(&self, start: usize, stop: usize) -> StrMatrix {
        let row_bytes = self.elems_per_row() * self.width;
        let mut shape = self.shape.clone();
        shape[0] = stop - start;
        StrMatrix {
            shape,
            width: self.width,
            data: self.data[start * row_bytes..stop * row_bytes].to_vec(),
        }
    }

    pub fn select_rows(&self, rows: &[usize]) -> StrMatrix {
        let row_bytes = self.elems_per_row() * self.width;
        let mut shape = self.shape.clone();
        shape[0] = rows.len();
        let mut data = Vec::with_capacity(rows.len() * row_bytes);
        for &row in rows {
            data.extend_from_slice(&self.data[row * row_bytes..(row + 1) * row_bytes]);
        }
        StrMatrix {
            shape,
            width: self.width,
            data,
        }
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn from_raw_bytes(shape: &[usize], width: usize, data: Vec<u8>) -> Result<StrMatrix> {
        let expect: usize = shape.iter().product::<usize>() * width;
        if data.len() != expect {
            return Err(Error::shape(format!(
                "string buffer of {} bytes does not match shape {:?} with width {}",
                data.len(),
                shape,
                width
            )));
        }
        Ok(StrMatrix {
            shape: shape.to_vec(),
            width,
            data,
        })
    }
}

/// One typed dataset slab.
#[derive(Debug, Clone)]
pub enum Matrix {
    Int8(ArrayD<i8>),
    Int16(ArrayD<i16>),
    Int32(ArrayD<i32>),
    Float32(ArrayD<f32>),
    Bool(ArrayD<bool>),
    Str(StrMatrix),
}

macro_rules! for_each_numeric {
    ($self:expr, $arr:ident => $body:expr) => {
        match $self {
            Matrix::Int8($arr) => $body,
            Matrix::Int16($arr) => $body,
            Matrix::Int32($arr) => $body,
            Matrix::Float32($arr) => $body,
            Matrix::Bool($arr) => $body,
            Matrix::Str(_) => unreachable!("string slabs are handled separately"),
        }
    };
}

impl Matrix {
    /// A slab of the given logical shape filled with the dtype's
    /// missing sentinel. `str_width` is only meaningful for `Str`.
    pub fn filled_missing(kind: DataKind, shape: &[usize], str_width: usize) -> Matrix {
        let dim = IxDyn(shape);
        match kind {
            DataKind::Int8 => Matrix::Int8(ArrayD::from_elem(dim, MISSING_GT)),
            DataKind::Int16 => Matrix::Int16(ArrayD::from_elem(dim, MISSING_INT as i16)),
            DataKind::Int32 => Matrix::Int32(ArrayD::from_elem(dim, MISSING_INT)),
            DataKind::Float32 => Matrix::Float32(ArrayD::from_elem(dim, MISSING_FLOAT)),
            DataKind::Bool => Matrix::Bool(ArrayD::from_elem(dim, false)),
            DataKind::Str => Matrix::Str(StrMatrix::filled(shape, str_width, b"")),
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            Matrix::Int8(_) => DataKind::Int8,
            Matrix::Int16(_) => DataKind::Int16,
            Matrix::Int32(_) => DataKind::Int32,
            Matrix::Float32(_) => DataKind::Float32,
            Matrix::Bool(_) => DataKind::Bool,
            Matrix::Str(_) => DataKind::Str,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Matrix::Str(s) => s.shape().to_vec(),
            other => for_each_numeric!(other, a => a.shape().to_vec()),
        }
    }

    pub fn nrows(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    pub fn row_shape(&self) -> Vec<usize> {
        self.shape()[1..].to_vec()
    }

    pub fn str_width(&self) -> usize {
        match self {
            Matrix::Str(s) => s.width(),
            _ => 0,
        }
    }

    /// Grow the first axis by the rows of `other`, reallocating as
    /// needed. Kind and element shape must agree.
    pub fn append(&mut self, other: &Matrix) -> Result<()> {
        if self.kind() != other.kind() {
            return Err(Error::shape(format!(
                "can not append {:?} data to a {:?} dataset",
                other.kind(),
                self.kind()
            )));
        }
        match (self, other) {
            (Matrix::Int8(a), Matrix::Int8(b)) => append_nd(a, b),
            (Matrix::Int16(a), Matrix::Int16(b)) => append_nd(a, b),
            (Matrix::Int32(a), Matrix::Int32(b)) => append_nd(a, b),
            (Matrix::Float32(a), Matrix::Float32(b)) => append_nd(a, b),
            (Matrix::Bool(a), Matrix::Bool(b)) => append_nd(a, b),
            (Matrix::Str(a), Matrix::Str(b)) => a.append(b),
            _ => unreachable!("kinds were checked above"),
        }
    }

    pub fn slice_rows(&self, start: usize, stop: usize) -> Matrix {
        match self {
            Matrix::Str(s) => Matrix::Str(s.slice_rows(start, stop)),
            Matrix::Int8(a) => Matrix::Int8(slice_nd(a, start, stop)),
            Matrix::Int16(a) => Matrix::Int16(slice_nd(a, start, stop)),
            Matrix::Int32(a) => Matrix::Int32(slice_nd(a, start, stop)),
            Matrix::Float32(a) => Matrix::Float32(slice_nd(a, start, stop)),
            Matrix::Bool(a) => Matrix::Bool(slice_nd(a, start, stop)),
        }
    }

    pub fn select_rows(&self, rows: &[usize]) -> Matrix {
        match self {
            Matrix::Str(s) => Matrix::Str(s.select_rows(rows)),
            Matrix::Int8(a) => Matrix::Int8(a.select(Axis(0), rows)),
            Matrix::Int16(a) => Matrix::Int16(a.select(Axis(0), rows)),
            Matrix::Int32(a) => Matrix::Int32(a.select(Axis(0), rows)),
            Matrix::Float32(a) => Matrix::Float32(a.select(Axis(0), rows)),
            Matrix::Bool(a) => Matrix::Bool(a.select(Axis(0), rows)),
        }
    }

    /// Element-wise equality with NaN treated as equal to NaN, so that
    /// float datasets holding missing sentinels compare as identical.
    pub fn eq_data(&self, other: &Matrix) -> bool {
        match (self, other) {
            (Matrix::Int8(a), Matrix::Int8(b)) => a == b,
            (Matrix::Int16(a), Matrix::Int16(b)) => a == b,
            (Matrix::Int32(a), Matrix::Int32(b)) => a == b,
            (Matrix::Bool(a), Matrix::Bool(b)) => a == b,
            (Matrix::Str(a), Matrix::Str(b)) => a == b,
            (Matrix::Float32(a), Matrix::Float32(b)) => {
                a.shape() == b.shape()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
            }
            _ => false,
        }
    }

    /// Serialize the slab to little-endian bytes in logical row-major
    /// order. Booleans are one byte each.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Matrix::Int8(a) => a.iter().map(|&v| v as u8).collect(),
            Matrix::Int16(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Matrix::Int32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Matrix::Float32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Matrix::Bool(a) => a.iter().map(|&v| u8::from(v)).collect(),
            Matrix::Str(s) => s.raw_bytes().to_vec(),
        }
    }

    pub fn from_le_bytes(
        kind: DataKind,
        shape: &[usize],
        str_width: usize,
        bytes: &[u8],
    ) -> Result<Matrix> {
        let n_elems: usize = shape.iter().product();
        let elem_size = if kind.is_str() {
            str_width
        } else {
            kind.elem_size()
        };
        if bytes.len() != n_elems * elem_size {
            return Err(Error::shape(format!(
                "{} bytes do not decode to shape {shape:?} of {kind:?}",
                bytes.len()
            )));
        }
        let dim = IxDyn(shape);
        let matrix = match kind {
            DataKind::Int8 => Matrix::Int8(
                ArrayD::from_shape_vec(dim, bytes.iter().map(|&b| b as i8).collect())
                    .map_err(|e| Error::shape(e.to_string()))?,
            ),
            DataKind::Int16 => Matrix::Int16(
                ArrayD::from_shape_vec(
                    dim,
                    bytes
                        .chunks_exact(2)
                        .map(|c| i16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                )
                .map_err(|e| Error::shape(e.to_string()))?,
            ),
            DataKind::Int32 => Matrix::Int32(
                ArrayD::from_shape_vec(
                    dim,
                    bytes
                        .chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
                .map_err(|e| Error::shape(e.to_string()))?,
            ),
            DataKind::Float32 => Matrix::Float32(
                ArrayD::from_shape_vec(
                    dim,
                    bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
                .map_err(|e| Error::shape(e.to_string()))?,
            ),
            DataKind::Bool => Matrix::Bool(
                ArrayD::from_shape_vec(dim, bytes.iter().map(|&b| b != 0).collect())
                    .map_err(|e| Error::shape(e.to_string()))?,
            ),
            DataKind::Str => Matrix::Str(StrMatrix::from_raw_bytes(shape, str_width, bytes.to_vec())?),
        };
        Ok(matrix)
    }

    pub fn as_i8(&self) -> Option<&ArrayD<i8>> {
        match self {
            Matrix::Int8(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<&ArrayD<i16>> {
        match self {
            Matrix::Int16(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&ArrayD<i32>> {
        match self {
            Matrix::Int32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Matrix::Float32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&ArrayD<bool>> {
        match self {
            Matrix::Bool(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&StrMatrix> {
        match self {
            Matrix::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str_mut(&mut self) -> Option<&mut StrMatrix> {
        match self {
            Matrix::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool_mut(&mut self) -> Option<&mut ArrayD<bool>> {
        match self {
            Matrix::Bool(a) => Some(a),
            _ => None,
        }
    }

    /// Write one integer element, narrowing to the slab's dtype. The
    /// missing sentinel survives every narrowing by construction.
    pub fn set_int(&mut self, index: &[usize], value: i32) {
        let index = IxDyn(index);
        match self {
            Matrix::Int8(a) => a[index] = value as i8,
            Matrix::Int16(a) => a[index] = value as i16,
            Matrix::Int32(a) => a[index] = value,
            Matrix::Float32(a) => a[index] = value as f32,
            Matrix::Bool(a) => a[index] = value != 0,
            Matrix::Str(_) => {}
        }
    }

    pub fn set_float(&mut self, index: &[usize], value: f32) {
        let index = IxDyn(index);
        match self {
            Matrix::Float32(a) => a[index] = value,
            Matrix::Int8(a) => a[index] = value as i8,
            Matrix::Int16(a) => a[index] = value as i16,
            Matrix::Int32(a) => a[index] = value as i32,
            Matrix::Bool(_) | Matrix::Str(_) => {}
        }
    }

    pub fn set_bool(&mut self, index: &[usize], value: bool) {
        if let Matrix::Bool(a) = self {
            a[IxDyn(index)] = value;
        }
    }
}

fn append_nd<T: Clone>(a: &mut ArrayD<T>, b: &ArrayD<T>) -> Result<()> {
    a.append(Axis(0), b.view())
        .map_err(|e| Error::shape(format!("can not append rows: {e}")))
}

fn slice_nd<T: Clone>(a: &ArrayD<T>, start: usize, stop: usize) -> ArrayD<T> {
    a.slice_axis(Axis(0), Slice::from(start..stop)).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_matrix_roundtrip() {
        let mut m = StrMatrix::filled(&[2, 2], 5, b"");
        m.set(&[0, 0], b"G").unwrap();
        m.set(&[0, 1], b"GTACT").unwrap();
        assert_eq!(m.get(&[0, 0]), b"G");
        assert_eq!(m.get(&[0, 1]), b"GTACT");
        assert_eq!(m.get(&[1, 0]), b"");
        assert!(m.set(&[1, 1], b"TOOLONGG").is_err());
    }

    #[test]
    fn append_and_slice() {
        let mut m = Matrix::filled_missing(DataKind::Int16, &[2, 3], 0);
        let other = Matrix::filled_missing(DataKind::Int16, &[1, 3], 0);
        m.append(&other).unwrap();
        assert_eq!(m.shape(), vec![3, 3]);
        let s = m.slice_rows(1, 3);
        assert_eq!(s.shape(), vec![2, 3]);

        let bad = Matrix::filled_missing(DataKind::Int16, &[1, 4], 0);
        assert!(m.append(&bad).is_err());
        let bad_kind = Matrix::filled_missing(DataKind::Int32, &[1, 3], 0);
        assert!(m.append(&bad_kind).is_err());
    }

    #[test]
    fn le_bytes_roundtrip() {
        let m = Matrix::Int16(ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1i16, -1, 300, 7]).unwrap());
        let bytes = m.to_le_bytes();
        let back = Matrix::from_le_bytes(DataKind::Int16, &[2, 2], 0, &bytes).unwrap();
        assert!(m.eq_data(&back));

        let f = Matrix::filled_missing(DataKind::Float32, &[3], 0);
        let back = Matrix::from_le_bytes(DataKind::Float32, &[3], 0, &f.to_le_bytes()).unwrap();
        assert!(f.eq_data(&back));
    }
}
