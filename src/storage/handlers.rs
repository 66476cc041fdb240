//! Push / Pull Handlers
//!
//! The row-level operations applied to a data tensor once ids have been
//! translated to local rows. Servers and the client's local fast path share
//! these functions, so both paths produce identical results.

use super::memory::DataStore;
use super::shared::{read_tensor, write_tensor};
use crate::error::Result;
use crate::tensor::Tensor;

/// How a PUSH combines incoming rows with stored rows.
pub trait PushHandler: Send + Sync {
    fn apply(&self, target: &mut Tensor, rows: &[usize], values: &Tensor) -> Result<()>;
}

/// Replaces stored rows (the default).
#[derive(Debug, Default, Clone, Copy)]
pub struct Overwrite;

impl PushHandler for Overwrite {
    fn apply(&self, target: &mut Tensor, rows: &[usize], values: &Tensor) -> Result<()> {
        target.scatter(rows, values)
    }
}

/// Adds incoming rows onto stored rows, e.g. for sparse gradient updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct Accumulate;

impl PushHandler for Accumulate {
    fn apply(&self, target: &mut Tensor, rows: &[usize], values: &Tensor) -> Result<()> {
        target.scatter_add(rows, values)
    }
}

pub fn apply_push(
    store: &DataStore,
    handler: &dyn PushHandler,
    name: &str,
    ids: &[u64],
    values: &Tensor,
) -> Result<()> {
    let rows = store.local_rows(name, ids)?;
    let mut target = write_tensor(store.data(name)?)?;
    handler.apply(&mut target, &rows, values)
}

pub fn apply_pull(store: &DataStore, name: &str, ids: &[u64]) -> Result<Tensor> {
    let rows = store.local_rows(name, ids)?;
    let source = read_tensor(store.data(name)?)?;
    source.gather(&rows)
}
