//! Network Module
//!
//! Message envelope, wire codec and the point-to-point endpoints that carry it.
//!
//! ## Core Concepts
//! - **Envelope**: `KvMessage` is the only thing on the wire. Its `kind` decides
//!   which optional fields must be present.
//! - **Framing**: `[u32 BE length][bincode payload]`, with a configurable size cap.
//! - **Endpoints**: `Transport` hides whether peers are reached over TCP
//!   (`TcpTransport`) or an in-process fabric (`MemoryTransport`). Peers are
//!   addressed by rank once registered.

pub mod codec;
pub mod memory;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use protocol::{KvMessage, MessageKind};
pub use tcp::TcpTransport;
pub use transport::{Transport, recv_within};
