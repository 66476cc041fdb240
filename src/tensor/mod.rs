//! Tensor Module
//!
//! A minimal dense, row-major tensor used as the unit of storage and transfer.
//!
//! ## Core Concepts
//! - **Rows**: The leading dimension is the key space. Every other dimension forms one row.
//! - **Gather / Scatter**: `gather` reads a list of rows, `scatter` writes them (last writer wins).
//! - **Element Types**: Only `int64` (id tables) and `float32` (features) are stored.

pub mod dense;
pub mod types;

pub use dense::Tensor;
pub use types::{DType, TensorData};
