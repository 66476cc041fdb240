use super::protocol::KvMessage;
use crate::error::{KvError, Result};

use async_trait::async_trait;
use std::time::Duration;

/// Point-to-point endpoint owned by exactly one server or client.
///
/// Messages to one peer arrive in the order they were sent. Every message is
/// delivered at most once: implementations never resend, so a PUSH is never
/// applied twice.
#[async_trait]
pub trait Transport: Send {
    /// Starts receiving on `addr` and returns the bound address, which differs
    /// from `addr` when port 0 was requested.
    async fn listen(&mut self, addr: &str) -> Result<String>;

    /// Registers an outgoing peer; takes effect on the next `connect`.
    fn add_peer(&mut self, rank: usize, addr: &str);

    /// Opens connections to every registered peer not yet connected.
    async fn connect(&mut self) -> Result<()>;

    async fn send(&mut self, rank: usize, msg: &KvMessage) -> Result<()>;

    async fn recv(&mut self) -> Result<KvMessage>;

    fn local_addr(&self) -> Option<&str>;
}

/// `recv` bounded by `timeout`; `None` waits forever.
pub async fn recv_within(
    transport: &mut dyn Transport,
    timeout: Option<Duration>,
    what: &str,
) -> Result<KvMessage> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, transport.recv())
            .await
            .map_err(|_| KvError::Timeout(format!("{} not received within {:?}", what, limit)))?,
        None => transport.recv().await,
    }
}
