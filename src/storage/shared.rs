//! Named, shareable tensor blocks.
//!
//! Backup servers on one machine attach to the same block instead of holding
//! their own copy, so every replica sees every write. There is no cross-replica
//! locking beyond the per-block `RwLock`; two replicas writing the same row is
//! last-writer-wins.

use crate::error::{KvError, Result};
use crate::tensor::{DType, Tensor};

use dashmap::DashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type SharedTensor = Arc<RwLock<Tensor>>;

/// Machine-wide namespace of tensor blocks.
pub trait SharedMemory: Send + Sync {
    /// Creates (or resets to zero) the block `name`.
    fn create(&self, name: &str, shape: &[usize], dtype: DType) -> Result<SharedTensor>;

    /// Attaches to an existing block; shape and dtype must match exactly.
    fn attach(&self, name: &str, shape: &[usize], dtype: DType) -> Result<SharedTensor>;

    /// Returns the block if it exists, whatever its shape.
    fn lookup(&self, name: &str) -> Option<SharedTensor>;
}

/// In-process implementation: every server and client holding the same
/// `Arc<LocalSharedMemory>` behaves as if it ran on the same machine.
#[derive(Default)]
pub struct LocalSharedMemory {
    blocks: DashMap<String, SharedTensor>,
}

impl LocalSharedMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl SharedMemory for LocalSharedMemory {
    fn create(&self, name: &str, shape: &[usize], dtype: DType) -> Result<SharedTensor> {
        if name.is_empty() {
            return Err(KvError::InvalidArgument(
                "shared tensor name cannot be empty".to_string(),
            ));
        }
        let fresh = Tensor::zeros(shape, dtype)?;

        // Reuse the existing block when the layout matches so earlier
        // attachments keep observing the same storage.
        if let Some(existing) = self.blocks.get(name) {
            let mut guard = write_tensor(existing.value())?;
            if guard.shape() == shape && guard.dtype() == dtype {
                *guard = fresh;
                return Ok(existing.value().clone());
            }
        }

        let block = Arc::new(RwLock::new(fresh));
        self.blocks.insert(name.to_string(), block.clone());
        tracing::debug!("Created shared tensor {} {:?} {}", name, shape, dtype);
        Ok(block)
    }

    fn attach(&self, name: &str, shape: &[usize], dtype: DType) -> Result<SharedTensor> {
        let block = self.lookup(name).ok_or_else(|| {
            KvError::Configuration(format!(
                "shared tensor '{}' has not been created on this machine",
                name
            ))
        })?;

        {
            let guard = read_tensor(&block)?;
            if guard.shape() != shape || guard.dtype() != dtype {
                return Err(KvError::Configuration(format!(
                    "shared tensor '{}' is {:?} {}, expected {:?} {}",
                    name,
                    guard.shape(),
                    guard.dtype(),
                    shape,
                    dtype
                )));
            }
        }

        Ok(block)
    }

    fn lookup(&self, name: &str) -> Option<SharedTensor> {
        self.blocks.get(name).map(|entry| entry.value().clone())
    }
}

pub fn read_tensor(block: &SharedTensor) -> Result<RwLockReadGuard<'_, Tensor>> {
    block
        .read()
        .map_err(|_| KvError::Storage("shared tensor lock poisoned".to_string()))
}

pub fn write_tensor(block: &SharedTensor) -> Result<RwLockWriteGuard<'_, Tensor>> {
    block
        .write()
        .map_err(|_| KvError::Storage("shared tensor lock poisoned".to_string()))
}
