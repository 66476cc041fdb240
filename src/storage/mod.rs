//! Storage Module
//!
//! Holds tensor shards and decides where every key lives.
//!
//! ## Core Concepts
//! - **Partitioning**: `PartitionDirectory` maps each global id to its owning machine and
//!   groups a batch of ids per destination.
//! - **Shared Blocks**: Backup servers on one machine attach to the same `SharedMemory`
//!   block, presenting one logical shard.
//! - **Tagged Store**: `DataStore` keys tensors by `(name, TensorRole)` instead of
//!   string suffixes; suffixes only appear in the shared namespace.
//! - **Handlers**: `apply_push` / `apply_pull` run the row-level update, identically
//!   on servers and on the client's local fast path.
//! - **Replica Choice**: `ReplicaSelector` spreads remote requests over a machine's replicas.

pub mod handlers;
pub mod memory;
pub mod partitioner;
pub mod selector;
pub mod shared;
