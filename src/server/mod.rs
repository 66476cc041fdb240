//! Server Module
//!
//! A server replica owns one machine's shard of each named tensor and answers
//! remote requests for it.
//!
//! ## Lifecycle
//! 1. **Setup**: `init_data` / `set_global2local` create shared blocks (first
//!    replica) or attach to them (backup replicas).
//! 2. **Bootstrap**: `start` waits for every client's announcement, ranks clients
//!    by address and, on server 0 only, sends each client its rank and the
//!    tensor manifest.
//! 3. **Service Loop**: PUSH writes rows, PULL replies with PULL_BACK, BARRIER
//!    replies to every client once all of them arrived, FINAL stops the loop.
//!    Any other message type aborts the server with a protocol error.

pub mod server;

pub use server::{KvServer, TensorInit};
