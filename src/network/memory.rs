use super::codec::{decode_message, encode_message};
use super::protocol::KvMessage;
use super::transport::Transport;
use crate::config::StoreConfig;
use crate::error::{KvError, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::sync::mpsc;

const FIRST_EPHEMERAL_PORT: u16 = 40000;

/// In-process fabric connecting `MemoryTransport`s by address.
///
/// Every message is still encoded and decoded, so the wire format is exercised
/// exactly as over TCP.
pub struct MemoryNetwork {
    endpoints: DashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
        })
    }

    pub fn transport(self: &Arc<Self>, config: &StoreConfig) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            config: config.clone(),
            local_addr: None,
            inbox: None,
            peers: BTreeMap::new(),
            links: HashMap::new(),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn bind(&self, addr: &str) -> Result<(String, mpsc::UnboundedReceiver<Vec<u8>>)> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| KvError::Transport(format!("invalid address '{}'", addr)))?;
        let bound = if port == "0" {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            format!("{}:{}", host, port)
        } else {
            addr.to_string()
        };

        match self.endpoints.entry(bound.clone()) {
            Entry::Occupied(_) => Err(KvError::Transport(format!(
                "address {} already in use",
                bound
            ))),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(tx);
                Ok((bound, rx))
            }
        }
    }

    fn lookup(&self, addr: &str) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.endpoints.get(addr).map(|entry| entry.value().clone())
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    config: StoreConfig,
    local_addr: Option<String>,
    inbox: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    peers: BTreeMap<usize, String>,
    links: HashMap<usize, mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&mut self, addr: &str) -> Result<String> {
        let (bound, inbox) = self.network.bind(addr)?;
        tracing::debug!("Memory endpoint bound at {}", bound);
        self.local_addr = Some(bound.clone());
        self.inbox = Some(inbox);
        Ok(bound)
    }

    fn add_peer(&mut self, rank: usize, addr: &str) {
        self.peers.insert(rank, addr.to_string());
    }

    async fn connect(&mut self) -> Result<()> {
        let attempts = self.config.connect_attempts.max(1);
        let pending: Vec<(usize, String)> = self
            .peers
            .iter()
            .filter(|(rank, _)| !self.links.contains_key(rank))
            .map(|(rank, addr)| (*rank, addr.clone()))
            .collect();

        for (rank, addr) in pending {
            let mut attempt = 0;
            let link = loop {
                if let Some(link) = self.network.lookup(&addr) {
                    break link;
                }
                attempt += 1;
                if attempt >= attempts {
                    return Err(KvError::Transport(format!(
                        "could not connect to rank {} at {} after {} attempts",
                        rank, addr, attempts
                    )));
                }
                tokio::time::sleep(self.config.connect_delay(attempt - 1)).await;
            };
            self.links.insert(rank, link);
        }
        Ok(())
    }

    async fn send(&mut self, rank: usize, msg: &KvMessage) -> Result<()> {
        let bytes = encode_message(msg)?;
        if bytes.len() > self.config.max_message_bytes {
            return Err(KvError::Transport(format!(
                "frame of {} bytes exceeds limit of {}",
                bytes.len(),
                self.config.max_message_bytes
            )));
        }
        let link = self
            .links
            .get(&rank)
            .ok_or_else(|| KvError::Transport(format!("no connection to rank {}", rank)))?;
        link.send(bytes)
            .map_err(|_| KvError::Transport(format!("rank {} has hung up", rank)))
    }

    async fn recv(&mut self) -> Result<KvMessage> {
        let inbox = self
            .inbox
            .as_mut()
            .ok_or_else(|| KvError::Transport("endpoint is not listening".to_string()))?;
        match inbox.recv().await {
            Some(frame) => decode_message(&frame),
            None => Err(KvError::Transport("inbox closed".to_string())),
        }
    }

    fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(addr) = self.local_addr.take() {
            self.network.endpoints.remove(&addr);
        }
    }
}
