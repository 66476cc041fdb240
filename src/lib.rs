//! Sharded Tensor Key-Value Store Library
//!
//! Splits large tensors (node or edge features of a graph, embedding tables)
//! across the machines of a training cluster and serves row-level push and
//! pull against the whole cluster. The binary (`main.rs`) wraps it in
//! `server` and `client` commands.
//!
//! ## Architecture Modules
//! - **`tensor`**: Dense row-major tensors with gather/scatter, the unit of storage and transfer.
//! - **`storage`**: Shared tensor blocks, the tagged per-process store, push/pull handlers,
//!   the partition directory that routes ids to machines, and replica selection.
//! - **`network`**: The message envelope, its length-prefixed bincode framing, and the
//!   TCP and in-process transports.
//! - **`membership`**: The static cluster file and the bootstrap handshake (client ranks,
//!   tensor manifest).
//! - **`server`**: One replica serving a machine's shard until told to stop.
//! - **`client`**: Push, pull, barrier and shutdown over the whole cluster, with a local
//!   fast path for co-located rows.
//! - **`config`** / **`error`**: Tunables and the error taxonomy shared by all of the above.

pub mod client;
pub mod config;
pub mod error;
pub mod membership;
pub mod network;
pub mod server;
pub mod storage;
pub mod tensor;
