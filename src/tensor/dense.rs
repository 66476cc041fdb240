use super::types::{DType, TensorData};
use crate::error::{KvError, Result};

use serde::{Deserialize, Serialize};

/// Dense row-major tensor. The leading dimension indexes rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let tensor = Self { shape, data };
        tensor.validate()?;
        Ok(tensor)
    }

    /// Checks that the shape is non-empty and matches the element count.
    /// Deserialized tensors skip `new`, so decoders call this explicitly.
    pub fn validate(&self) -> Result<()> {
        if self.shape.is_empty() {
            return Err(KvError::InvalidArgument(
                "tensor shape cannot be empty".to_string(),
            ));
        }
        let expected = self
            .shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                KvError::InvalidArgument(format!("shape {:?} overflows", self.shape))
            })?;
        if expected != self.data.len() {
            return Err(KvError::InvalidArgument(format!(
                "shape {:?} needs {} elements, got {}",
                self.shape,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Result<Self> {
        let len = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| KvError::InvalidArgument(format!("shape {:?} overflows", shape)))?;
        Self::new(shape.to_vec(), TensorData::zeros(dtype, len))
    }

    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        Self::new(shape, TensorData::Float32(values))
    }

    pub fn from_i64(shape: Vec<usize>, values: Vec<i64>) -> Result<Self> {
        Self::new(shape, TensorData::Int64(values))
    }

    /// One-dimensional float tensor; each element is one row.
    pub fn vector_f32(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            data: TensorData::Float32(values),
        }
    }

    /// One-dimensional integer tensor; each element is one row.
    pub fn vector_i64(values: Vec<i64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: TensorData::Int64(values),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Shape of a single row (every dimension but the first).
    pub fn row_shape(&self) -> &[usize] {
        &self.shape[1..]
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn row_len(&self) -> usize {
        self.row_shape().iter().product()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::Float32(v) => Some(v),
            TensorData::Int64(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::Int64(v) => Some(v),
            TensorData::Float32(_) => None,
        }
    }

    /// Reads `rows` in the given order into a new tensor.
    pub fn gather(&self, rows: &[usize]) -> Result<Tensor> {
        self.check_rows(rows)?;
        let row_len = self.row_len();
        let data = match &self.data {
            TensorData::Int64(v) => TensorData::Int64(gather_rows(v, row_len, rows)),
            TensorData::Float32(v) => TensorData::Float32(gather_rows(v, row_len, rows)),
        };

        let mut shape = Vec::with_capacity(self.shape.len());
        shape.push(rows.len());
        shape.extend_from_slice(self.row_shape());

        Ok(Tensor { shape, data })
    }

    /// Overwrites `rows` with the rows of `values`. Duplicate rows: last one wins.
    pub fn scatter(&mut self, rows: &[usize], values: &Tensor) -> Result<()> {
        self.check_update(rows, values)?;
        let row_len = self.row_len();
        let target = self.dtype();
        match (&mut self.data, &values.data) {
            (TensorData::Int64(dst), TensorData::Int64(src)) => {
                scatter_rows(dst, src, row_len, rows, |d, s| *d = s)
            }
            (TensorData::Float32(dst), TensorData::Float32(src)) => {
                scatter_rows(dst, src, row_len, rows, |d, s| *d = s)
            }
            _ => return Err(dtype_mismatch(target, values)),
        }
        Ok(())
    }

    /// Adds the rows of `values` onto `rows`, element-wise.
    pub fn scatter_add(&mut self, rows: &[usize], values: &Tensor) -> Result<()> {
        self.check_update(rows, values)?;
        let row_len = self.row_len();
        let target = self.dtype();
        match (&mut self.data, &values.data) {
            (TensorData::Int64(dst), TensorData::Int64(src)) => {
                scatter_rows(dst, src, row_len, rows, |d: &mut i64, s| {
                    *d = d.wrapping_add(s)
                })
            }
            (TensorData::Float32(dst), TensorData::Float32(src)) => {
                scatter_rows(dst, src, row_len, rows, |d: &mut f32, s| *d += s)
            }
            _ => return Err(dtype_mismatch(target, values)),
        }
        Ok(())
    }

    /// Stacks tensors along the row dimension.
    pub fn concat(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts.first().ok_or_else(|| {
            KvError::InvalidArgument("cannot concatenate zero tensors".to_string())
        })?;

        for part in &parts[1..] {
            if part.dtype() != first.dtype() || part.row_shape() != first.row_shape() {
                return Err(KvError::InvalidArgument(format!(
                    "cannot concatenate {} {:?} with {} {:?}",
                    first.dtype(),
                    first.shape,
                    part.dtype(),
                    part.shape
                )));
            }
        }

        let rows: usize = parts.iter().map(|p| p.rows()).sum();
        let data = match first.dtype() {
            DType::Int64 => TensorData::Int64(
                parts
                    .iter()
                    .filter_map(|p| p.as_i64())
                    .flatten()
                    .copied()
                    .collect(),
            ),
            DType::Float32 => TensorData::Float32(
                parts
                    .iter()
                    .filter_map(|p| p.as_f32())
                    .flatten()
                    .copied()
                    .collect(),
            ),
        };

        let mut shape = Vec::with_capacity(first.shape.len());
        shape.push(rows);
        shape.extend_from_slice(first.row_shape());

        Tensor::new(shape, data)
    }

    fn check_rows(&self, rows: &[usize]) -> Result<()> {
        let limit = self.rows();
        if let Some(bad) = rows.iter().find(|&&r| r >= limit) {
            return Err(KvError::InvalidArgument(format!(
                "row {} out of range for tensor with {} rows",
                bad, limit
            )));
        }
        Ok(())
    }

    fn check_update(&self, rows: &[usize], values: &Tensor) -> Result<()> {
        if values.dtype() != self.dtype() {
            return Err(dtype_mismatch(self.dtype(), values));
        }
        if values.rows() != rows.len() {
            return Err(KvError::InvalidArgument(format!(
                "{} rows of values for {} row indices",
                values.rows(),
                rows.len()
            )));
        }
        if values.row_shape() != self.row_shape() {
            return Err(KvError::InvalidArgument(format!(
                "row shape {:?} does not match target row shape {:?}",
                values.row_shape(),
                self.row_shape()
            )));
        }
        self.check_rows(rows)
    }
}

fn dtype_mismatch(target: DType, values: &Tensor) -> KvError {
    KvError::InvalidArgument(format!(
        "value dtype {} does not match target dtype {}",
        values.dtype(),
        target
    ))
}

fn gather_rows<T: Copy>(src: &[T], row_len: usize, rows: &[usize]) -> Vec<T> {
    let mut out = Vec::with_capacity(rows.len() * row_len);
    for &row in rows {
        out.extend_from_slice(&src[row * row_len..(row + 1) * row_len]);
    }
    out
}

fn scatter_rows<T: Copy>(
    dst: &mut [T],
    src: &[T],
    row_len: usize,
    rows: &[usize],
    op: impl Fn(&mut T, T),
) {
    for (i, &row) in rows.iter().enumerate() {
        let target = &mut dst[row * row_len..(row + 1) * row_len];
        let source = &src[i * row_len..(i + 1) * row_len];
        for (d, s) in target.iter_mut().zip(source) {
            op(d, *s);
        }
    }
}
