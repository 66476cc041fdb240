use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Int64,
    Float32,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Int64 => "int64",
            DType::Float32 => "float32",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "int64" => Some(DType::Int64),
            "float32" => Some(DType::Float32),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat element buffer of a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    Int64(Vec<i64>),
    Float32(Vec<f32>),
}

impl TensorData {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Int64 => TensorData::Int64(vec![0; len]),
            DType::Float32 => TensorData::Float32(vec![0.0; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Int64(_) => DType::Int64,
            TensorData::Float32(_) => DType::Float32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Int64(v) => v.len(),
            TensorData::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
