//! Replica selection for remote requests.
//!
//! Every backup replica on a machine serves the whole shard, so any choice is
//! correct; the strategy only spreads load.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

pub trait ReplicaSelector: Send {
    /// Returns the server rank that should receive a request for `machine_id`.
    /// Replicas of machine `m` hold ranks `m * backup_count .. (m + 1) * backup_count`.
    fn choose_replica(&mut self, machine_id: u32, backup_count: usize) -> usize;
}

fn first_rank(machine_id: u32, backup_count: usize) -> usize {
    machine_id as usize * backup_count
}

/// Uniform random choice. Each instance seeds from OS entropy so clients
/// started in the same instant do not make correlated picks.
pub struct RandomReplica {
    rng: StdRng,
}

impl RandomReplica {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaSelector for RandomReplica {
    fn choose_replica(&mut self, machine_id: u32, backup_count: usize) -> usize {
        let offset = self.rng.gen_range(0..backup_count.max(1));
        first_rank(machine_id, backup_count) + offset
    }
}

/// Cycles through the replicas of each machine independently.
#[derive(Default)]
pub struct RoundRobinReplica {
    next: HashMap<u32, usize>,
}

impl RoundRobinReplica {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicaSelector for RoundRobinReplica {
    fn choose_replica(&mut self, machine_id: u32, backup_count: usize) -> usize {
        let slot = self.next.entry(machine_id).or_insert(0);
        let offset = *slot % backup_count.max(1);
        *slot = slot.wrapping_add(1);
        first_rank(machine_id, backup_count) + offset
    }
}

/// Always the first replica of the machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedReplica;

impl ReplicaSelector for FixedReplica {
    fn choose_replica(&mut self, machine_id: u32, backup_count: usize) -> usize {
        first_rank(machine_id, backup_count)
    }
}
