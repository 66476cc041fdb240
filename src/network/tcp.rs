use super::codec::{decode_message, encode_message, read_frame, write_frame};
use super::protocol::KvMessage;
use super::transport::Transport;
use crate::config::StoreConfig;
use crate::error::{KvError, Result};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

type Inbound = Result<Vec<u8>>;

/// TCP endpoint.
///
/// One listener task accepts connections and spawns a reader per connection;
/// all readers feed a single inbox, so `recv` sees messages from every peer.
/// Outgoing connections are write-only.
pub struct TcpTransport {
    config: StoreConfig,
    local_addr: Option<String>,
    peers: BTreeMap<usize, String>,
    writers: HashMap<usize, TcpStream>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,
    listener_task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(config: StoreConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            config,
            local_addr: None,
            peers: BTreeMap::new(),
            writers: HashMap::new(),
            inbox_tx,
            inbox_rx,
            listener_task: None,
        }
    }

    async fn connect_with_retry(&self, rank: usize, addr: &str) -> Result<TcpStream> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    if attempt + 1 < attempts {
                        let delay = self.config.connect_delay(attempt);
                        tracing::warn!(
                            "Connect to rank {} at {} failed (attempt {}/{}), retrying in {:?}",
                            rank,
                            addr,
                            attempt + 1,
                            attempts,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(KvError::Transport(format!(
            "could not connect to rank {} at {} after {} attempts: {}",
            rank,
            addr,
            attempts,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

async fn read_loop(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    max_bytes: usize,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        match read_frame(&mut stream, max_bytes).await {
            Ok(Some(frame)) => {
                if inbox.send(Ok(frame)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!("Connection from {} closed", peer);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to read frame from {}: {}", peer, e);
                let _ = inbox.send(Err(e));
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&mut self, addr: &str) -> Result<String> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?.to_string();
        let inbox = self.inbox_tx.clone();
        let max_bytes = self.config.max_message_bytes;

        self.listener_task = Some(tokio::spawn(async move {
            // Dropping the set aborts every reader with the listener.
            let mut readers = JoinSet::new();
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        tracing::debug!("Accepted connection from {}", peer);
                        readers.spawn(read_loop(stream, peer, max_bytes, inbox.clone()));
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                        break;
                    }
                }
            }
            readers.abort_all();
        }));

        tracing::info!("Listening on {}", bound);
        self.local_addr = Some(bound.clone());
        Ok(bound)
    }

    fn add_peer(&mut self, rank: usize, addr: &str) {
        self.peers.insert(rank, addr.to_string());
    }

    async fn connect(&mut self) -> Result<()> {
        let pending: Vec<(usize, String)> = self
            .peers
            .iter()
            .filter(|(rank, _)| !self.writers.contains_key(rank))
            .map(|(rank, addr)| (*rank, addr.clone()))
            .collect();

        for (rank, addr) in pending {
            let stream = self.connect_with_retry(rank, &addr).await?;
            tracing::debug!("Connected to rank {} at {}", rank, addr);
            self.writers.insert(rank, stream);
        }
        Ok(())
    }

    async fn send(&mut self, rank: usize, msg: &KvMessage) -> Result<()> {
        let bytes = encode_message(msg)?;
        let max_bytes = self.config.max_message_bytes;
        let stream = self
            .writers
            .get_mut(&rank)
            .ok_or_else(|| KvError::Transport(format!("no connection to rank {}", rank)))?;
        write_frame(stream, &bytes, max_bytes).await
    }

    async fn recv(&mut self) -> Result<KvMessage> {
        match self.inbox_rx.recv().await {
            Some(frame) => decode_message(&frame?),
            None => Err(KvError::Transport("inbox closed".to_string())),
        }
    }

    fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
    }
}
