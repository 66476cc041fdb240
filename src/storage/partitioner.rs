use crate::error::{KvError, Result};
use crate::tensor::Tensor;

use std::collections::HashMap;
use std::sync::Arc;

/// Global id -> owning machine id. Immutable once installed.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    owners: Arc<[u32]>,
}

impl PartitionTable {
    pub fn new(owners: Vec<u32>) -> Result<Self> {
        if owners.is_empty() {
            return Err(KvError::Configuration(
                "partition book cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            owners: owners.into(),
        })
    }

    /// Builds a table from an int64 tensor of machine ids.
    pub fn from_tensor(table: &Tensor) -> Result<Self> {
        let values = table.as_i64().ok_or_else(|| {
            KvError::Configuration("partition book must be an int64 tensor".to_string())
        })?;
        let owners = values
            .iter()
            .map(|&m| {
                u32::try_from(m).map_err(|_| {
                    KvError::Configuration(format!("invalid machine id {} in partition book", m))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(owners)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn owner(&self, key: u64) -> Result<u32> {
        usize::try_from(key)
            .ok()
            .and_then(|idx| self.owners.get(idx))
            .copied()
            .ok_or_else(|| {
                KvError::InvalidArgument(format!(
                    "key {} outside partition book of {} ids",
                    key,
                    self.owners.len()
                ))
            })
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.owners
    }
}

/// Contiguous run of keys owned by one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineGroup {
    pub machine_id: u32,
    /// Keys in caller order, restricted to this machine.
    pub keys: Vec<u64>,
    /// Position of each key in the caller's batch.
    pub positions: Vec<usize>,
}

/// Result of partitioning a batch: groups ordered by machine id, plus the
/// permutation that maps the concatenated group rows back to caller order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPlan {
    groups: Vec<MachineGroup>,
    restore: Vec<usize>,
}

impl RoutingPlan {
    pub fn groups(&self) -> &[MachineGroup] {
        &self.groups
    }

    /// `restore[i]` is the row of the concatenated result holding key `i`.
    pub fn restore_order(&self) -> &[usize] {
        &self.restore
    }

    pub fn len(&self) -> usize {
        self.restore.len()
    }

    pub fn is_empty(&self) -> bool {
        self.restore.is_empty()
    }

    /// Concatenates one result per group (in group order) and restores the
    /// caller's key order.
    pub fn reassemble(&self, parts: Vec<Tensor>) -> Result<Tensor> {
        if parts.len() != self.groups.len() {
            return Err(KvError::Protocol(format!(
                "expected {} partial results, got {}",
                self.groups.len(),
                parts.len()
            )));
        }
        for (group, part) in self.groups.iter().zip(&parts) {
            if part.rows() != group.keys.len() {
                return Err(KvError::Protocol(format!(
                    "machine {} returned {} rows for {} keys",
                    group.machine_id,
                    part.rows(),
                    group.keys.len()
                )));
            }
        }
        Tensor::concat(&parts)?.gather(&self.restore)
    }
}

/// Per-tensor partition books held by a client.
#[derive(Debug, Default)]
pub struct PartitionDirectory {
    tables: HashMap<String, PartitionTable>,
}

impl PartitionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_partition(&mut self, name: &str, owners: Vec<u32>) -> Result<()> {
        let table = PartitionTable::new(owners)?;
        self.install(name, table)
    }

    pub fn install(&mut self, name: &str, table: PartitionTable) -> Result<()> {
        if name.is_empty() {
            return Err(KvError::InvalidArgument("name cannot be empty".to_string()));
        }
        self.tables.insert(name.to_string(), table);
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&PartitionTable> {
        self.tables.get(name)
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Groups `keys` by owning machine.
    ///
    /// Keys are stably sorted by machine id, so keys owned by the same machine
    /// keep their relative caller order and identical inputs always produce
    /// identical groups.
    pub fn resolve_batch(&self, name: &str, keys: &[u64]) -> Result<RoutingPlan> {
        let table = self.tables.get(name).ok_or_else(|| {
            KvError::InvalidArgument(format!("no partition book installed for '{}'", name))
        })?;

        let owners = keys
            .iter()
            .map(|&key| table.owner(key))
            .collect::<Result<Vec<u32>>>()?;

        let mut order: Vec<usize> = (0..keys.len()).collect();
        order.sort_by_key(|&i| owners[i]);

        let mut restore = vec![0; keys.len()];
        let mut groups: Vec<MachineGroup> = Vec::new();

        for (sorted_pos, &orig) in order.iter().enumerate() {
            restore[orig] = sorted_pos;
            let machine_id = owners[orig];
            match groups.last_mut() {
                Some(group) if group.machine_id == machine_id => {
                    group.keys.push(keys[orig]);
                    group.positions.push(orig);
                }
                _ => groups.push(MachineGroup {
                    machine_id,
                    keys: vec![keys[orig]],
                    positions: vec![orig],
                }),
            }
        }

        Ok(RoutingPlan { groups, restore })
    }
}
