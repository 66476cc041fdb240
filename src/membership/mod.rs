//! Membership & Bootstrap Module
//!
//! Static cluster layout and the one-time handshake that turns it into a
//! running cluster. Membership never changes after startup.
//!
//! ## Core Mechanisms
//! - **Namebook**: The cluster file lists machines; each line expands into
//!   `server_count` replicas on consecutive ports, giving server rank ->
//!   `machine_id|ip:port`. Replicas of a machine hold contiguous ranks.
//! - **Rank Assignment**: Servers collect one announcement per client and rank
//!   clients by sorted address, so every server agrees without coordination.
//! - **Manifest**: The coordinating server (rank 0) tells each client which
//!   shared tensors exist so co-located clients can attach to them.

pub mod bootstrap;
pub mod namebook;

pub use bootstrap::{ClientPhase, Manifest, ManifestEntry, ServerPhase, assign_client_ranks};
pub use namebook::{ServerAddr, ServerNamebook, parse_ip_config, read_ip_config};
