//! Client Module
//!
//! `KvClient` presents push, pull and barrier over the whole cluster and
//! hides where each row lives.
//!
//! ## Request Path
//! - **Routing**: Ids are grouped per owning machine through the partition book.
//! - **Local Fast Path**: Groups owned by the client's own machine are applied
//!   directly to shared storage with the same handler the servers use.
//! - **Remote Groups**: One message per machine, sent to a replica picked by the
//!   `ReplicaSelector`.
//! - **Reassembly**: Pull results are concatenated in group order and permuted
//!   back to the caller's id order.

pub mod client;

pub use client::{KvClient, PartitionBook, outbound_ip};

#[cfg(test)]
mod tests;
