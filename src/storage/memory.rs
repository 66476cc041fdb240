use super::shared::{SharedTensor, read_tensor};
use crate::error::{KvError, Result};

use std::collections::BTreeMap;

/// What a stored tensor holds for a named key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TensorRole {
    /// Row values.
    Data,
    /// Global id -> owning machine id.
    Partition,
    /// Global id -> row index in the local shard.
    LocalMap,
}

impl TensorRole {
    pub const ALL: [TensorRole; 3] = [TensorRole::Data, TensorRole::Partition, TensorRole::LocalMap];

    /// Suffix used for the block name in the machine-wide shared namespace.
    pub fn suffix(&self) -> &'static str {
        match self {
            TensorRole::Data => "-data-",
            TensorRole::Partition => "-part-",
            TensorRole::LocalMap => "-g2l-",
        }
    }

    pub fn shared_name(&self, name: &str) -> String {
        format!("{}{}", name, self.suffix())
    }

    /// Splits a shared block name back into `(tensor name, role)`.
    pub fn split_shared_name(full: &str) -> Option<(&str, TensorRole)> {
        Self::ALL.iter().find_map(|role| {
            full.strip_suffix(role.suffix())
                .filter(|name| !name.is_empty())
                .map(|name| (name, *role))
        })
    }
}

/// Tensors held by one server or client, keyed by `(name, role)`.
#[derive(Default)]
pub struct DataStore {
    tensors: BTreeMap<(String, TensorRole), SharedTensor>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, role: TensorRole, tensor: SharedTensor) {
        self.tensors.insert((name.to_string(), role), tensor);
    }

    pub fn get(&self, name: &str, role: TensorRole) -> Option<&SharedTensor> {
        self.tensors.get(&(name.to_string(), role))
    }

    pub fn contains(&self, name: &str, role: TensorRole) -> bool {
        self.get(name, role).is_some()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Entries in `(name, role)` order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, TensorRole, &SharedTensor)> {
        self.tensors
            .iter()
            .map(|((name, role), tensor)| (name.as_str(), *role, tensor))
    }

    /// Data tensor for `name`, or an error naming the missing tensor.
    pub fn data(&self, name: &str) -> Result<&SharedTensor> {
        self.get(name, TensorRole::Data).ok_or_else(|| {
            KvError::InvalidArgument(format!("no data tensor named '{}'", name))
        })
    }

    /// Translates global ids into local rows through the `LocalMap` table when
    /// one is installed; otherwise the global id is the row.
    pub fn local_rows(&self, name: &str, ids: &[u64]) -> Result<Vec<usize>> {
        match self.get(name, TensorRole::LocalMap) {
            Some(table) => {
                let table = read_tensor(table)?;
                let map = table.as_i64().ok_or_else(|| {
                    KvError::Configuration(format!("local map of '{}' is not int64", name))
                })?;
                ids.iter()
                    .map(|&id| {
                        let local = usize::try_from(id)
                            .ok()
                            .and_then(|idx| map.get(idx))
                            .ok_or_else(|| {
                                KvError::InvalidArgument(format!(
                                    "id {} outside local map of '{}' ({} entries)",
                                    id,
                                    name,
                                    map.len()
                                ))
                            })?;
                        usize::try_from(*local).map_err(|_| {
                            KvError::Configuration(format!(
                                "local map of '{}' holds negative row {}",
                                name, local
                            ))
                        })
                    })
                    .collect()
            }
            None => ids
                .iter()
                .map(|&id| {
                    usize::try_from(id).map_err(|_| {
                        KvError::InvalidArgument(format!("id {} does not fit a row index", id))
                    })
                })
                .collect(),
        }
    }
}
