use crate::config::StoreConfig;
use crate::error::{KvError, Result};
use crate::membership::bootstrap::{Manifest, ServerPhase, assign_client_ranks};
use crate::membership::namebook::ServerAddr;
use crate::network::transport::{Transport, recv_within};
use crate::network::{KvMessage, MessageKind};
use crate::storage::handlers::{Overwrite, PushHandler, apply_pull, apply_push};
use crate::storage::memory::{DataStore, TensorRole};
use crate::storage::shared::{SharedMemory, read_tensor, write_tensor};
use crate::tensor::{DType, Tensor};

use std::sync::Arc;
use tokio::time::Instant;

/// How a server obtains a tensor partition.
#[derive(Debug, Clone)]
pub enum TensorInit {
    /// Create the shared block and fill it. Used by the first replica on a machine.
    Values(Tensor),
    /// Attach to a block another replica on this machine already created.
    Shape { shape: Vec<usize>, dtype: DType },
}

impl TensorInit {
    fn layout(&self) -> (Vec<usize>, DType) {
        match self {
            TensorInit::Values(t) => (t.shape().to_vec(), t.dtype()),
            TensorInit::Shape { shape, dtype } => (shape.clone(), *dtype),
        }
    }
}

/// One server replica. Owns its transport and runs a single service loop.
pub struct KvServer {
    server_id: usize,
    addr: ServerAddr,
    client_count: usize,
    transport: Box<dyn Transport>,
    shared: Arc<dyn SharedMemory>,
    config: StoreConfig,
    store: DataStore,
    push_handler: Box<dyn PushHandler>,
    clients: Vec<String>,
    phase: ServerPhase,
    barrier_count: usize,
    retired: Vec<KvMessage>,
}

impl KvServer {
    /// `server_addr` is this replica's namebook entry, `machine_id|ip:port`.
    pub fn new(
        server_id: usize,
        server_addr: &str,
        client_count: usize,
        transport: Box<dyn Transport>,
        shared: Arc<dyn SharedMemory>,
        config: StoreConfig,
    ) -> Result<Self> {
        let addr: ServerAddr = server_addr.parse()?;
        if client_count == 0 {
            return Err(KvError::Configuration(
                "a server needs at least one client".to_string(),
            ));
        }

        Ok(Self {
            server_id,
            addr,
            client_count,
            transport,
            shared,
            config,
            store: DataStore::new(),
            push_handler: Box::new(Overwrite),
            clients: Vec::new(),
            phase: ServerPhase::Unconnected,
            barrier_count: 0,
            retired: Vec::new(),
        })
    }

    pub fn get_id(&self) -> usize {
        self.server_id
    }

    /// `ip:port` this server listens on.
    pub fn get_addr(&self) -> String {
        self.addr.socket_addr()
    }

    pub fn get_machine_id(&self) -> u32 {
        self.addr.machine_id
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    /// Client addresses in rank order, known once bootstrap completes.
    pub fn clients(&self) -> &[String] {
        &self.clients
    }

    /// Processed messages not yet released.
    pub fn retained_messages(&self) -> usize {
        self.retired.len()
    }

    pub fn set_push_handler(&mut self, handler: Box<dyn PushHandler>) {
        self.push_handler = handler;
    }

    /// Creates or attaches the data partition of `name`.
    pub fn init_data(&mut self, name: &str, init: TensorInit) -> Result<()> {
        self.install(name, TensorRole::Data, init)
    }

    /// Creates or attaches the global-to-local table of `name`. The table is a
    /// 1-D int64 tensor indexed by global id.
    pub fn set_global2local(&mut self, name: &str, init: TensorInit) -> Result<()> {
        let (shape, dtype) = init.layout();
        if shape.len() != 1 || dtype != DType::Int64 {
            return Err(KvError::InvalidArgument(format!(
                "global-to-local table of '{}' must be 1-D int64, got {:?} {}",
                name, shape, dtype
            )));
        }
        self.install(name, TensorRole::LocalMap, init)
    }

    fn install(&mut self, name: &str, role: TensorRole, init: TensorInit) -> Result<()> {
        validate_name(name)?;
        if self.phase != ServerPhase::Unconnected {
            return Err(KvError::InvalidArgument(format!(
                "cannot add '{}' to a server that is {}",
                name, self.phase
            )));
        }

        let shared_name = role.shared_name(name);
        let block = match init {
            TensorInit::Values(values) => {
                let block = self
                    .shared
                    .create(&shared_name, values.shape(), values.dtype())?;
                *write_tensor(&block)? = values;
                block
            }
            TensorInit::Shape { shape, dtype } => self.shared.attach(&shared_name, &shape, dtype)?,
        };

        tracing::debug!("Server {} holds {}", self.server_id, shared_name);
        self.store.insert(name, role, block);
        Ok(())
    }

    /// Runs bootstrap and then serves requests until FINAL arrives.
    ///
    /// Protocol violations, storage failures and lost clients end the loop.
    /// A PUSH or PULL the shard cannot serve is logged and rejected instead;
    /// a rejected PULL is answered with an empty `PullBack`.
    pub async fn start(&mut self) -> Result<()> {
        if self.phase != ServerPhase::Unconnected {
            return Err(KvError::InvalidArgument(format!(
                "server {} already started",
                self.server_id
            )));
        }

        self.bootstrap().await?;
        self.serve().await
    }

    async fn bootstrap(&mut self) -> Result<()> {
        self.transport.listen(&self.addr.socket_addr()).await?;
        self.phase = ServerPhase::AwaitingClients;
        tracing::info!(
            "Server {} waiting for {} clients on {}",
            self.server_id,
            self.client_count,
            self.addr
        );

        let announced = self.await_announcements().await?;
        self.clients = assign_client_ranks(announced)?;

        for (rank, addr) in self.clients.iter().enumerate() {
            self.transport.add_peer(rank, addr);
        }
        self.transport.connect().await?;
        self.phase = ServerPhase::Ready;

        if self.server_id == 0 {
            let manifest = self.manifest()?.encode();
            for rank in 0..self.clients.len() {
                self.transport
                    .send(rank, &KvMessage::ip_id(self.server_id, rank.to_string()))
                    .await?;
            }
            for rank in 0..self.clients.len() {
                self.transport
                    .send(rank, &KvMessage::ip_id(self.server_id, manifest.clone()))
                    .await?;
            }
        }

        tracing::info!(
            "KVStore service {} started with {} clients",
            self.server_id,
            self.clients.len()
        );
        Ok(())
    }

    async fn await_announcements(&mut self) -> Result<Vec<String>> {
        let deadline = self.config.bootstrap_timeout().map(|t| Instant::now() + t);
        let mut announced = Vec::with_capacity(self.client_count);

        while announced.len() < self.client_count {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let msg = match recv_within(self.transport.as_mut(), remaining, "client announcement").await
            {
                Ok(msg) => msg,
                Err(KvError::Timeout(_)) => {
                    let err = KvError::Timeout(format!(
                        "server {} received {} of {} client announcements; missing clients never connected",
                        self.server_id,
                        announced.len(),
                        self.client_count
                    ));
                    tracing::error!("{}", err);
                    return Err(err);
                }
                Err(e) => return Err(e),
            };

            if msg.kind != MessageKind::IpId {
                return Err(self.protocol_violation(&msg, "during bootstrap"));
            }
            let addr = msg.require_name()?.to_string();
            tracing::debug!("Server {} got announcement from {}", self.server_id, addr);
            announced.push(addr);
        }

        Ok(announced)
    }

    fn manifest(&self) -> Result<Manifest> {
        let mut manifest = Manifest::new();
        for (name, role, block) in self.store.entries() {
            let tensor = read_tensor(block)?;
            manifest.push(&role.shared_name(name), tensor.shape(), tensor.dtype());
        }
        Ok(manifest)
    }

    async fn serve(&mut self) -> Result<()> {
        self.phase = ServerPhase::Serving;

        loop {
            let msg = self.transport.recv().await?;

            match msg.kind {
                MessageKind::Push => {
                    let name = msg.require_name()?;
                    let ids = msg.require_ids()?;
                    let values = msg.require_payload()?;
                    tracing::debug!(
                        "Server {} PUSH {} x{} from {}",
                        self.server_id,
                        name,
                        ids.len(),
                        msg.sender_rank
                    );
                    match apply_push(&self.store, self.push_handler.as_ref(), name, ids, values) {
                        Ok(()) => {}
                        Err(KvError::InvalidArgument(reason)) => {
                            tracing::warn!(
                                "Server {} rejected PUSH {} from {}: {}",
                                self.server_id,
                                name,
                                msg.sender_rank,
                                reason
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                MessageKind::Pull => {
                    let name = msg.require_name()?;
                    let ids = msg.require_ids()?;
                    let reply = match apply_pull(&self.store, name, ids) {
                        Ok(rows) => KvMessage::pull_back(self.server_id, name, ids.to_vec(), rows),
                        Err(KvError::InvalidArgument(reason)) => {
                            tracing::warn!(
                                "Server {} rejected PULL {} from {}: {}",
                                self.server_id,
                                name,
                                msg.sender_rank,
                                reason
                            );
                            KvMessage::pull_rejected(self.server_id, name, ids.to_vec())
                        }
                        Err(e) => return Err(e),
                    };
                    self.transport.send(msg.sender_rank, &reply).await?;
                }
                MessageKind::Barrier => {
                    self.barrier_count += 1;
                    if self.barrier_count == self.client_count {
                        let reply = KvMessage::barrier(self.server_id);
                        for rank in 0..self.client_count {
                            self.transport.send(rank, &reply).await?;
                        }
                        self.barrier_count = 0;
                    }
                }
                MessageKind::Final => {
                    tracing::info!("Exit KVStore service {}", self.server_id);
                    self.phase = ServerPhase::Stopped;
                    return Ok(());
                }
                MessageKind::IpId | MessageKind::PullBack => {
                    return Err(self.protocol_violation(&msg, "in the service loop"));
                }
            }

            self.retired.push(msg);
            if self.retired.len() >= self.config.gc_threshold {
                tracing::debug!(
                    "Server {} releasing {} messages",
                    self.server_id,
                    self.retired.len()
                );
                self.retired.clear();
            }
        }
    }

    fn protocol_violation(&self, msg: &KvMessage, context: &str) -> KvError {
        let err = KvError::Protocol(format!(
            "server {} got unexpected {} message from rank {} {}",
            self.server_id, msg.kind, msg.sender_rank, context
        ));
        tracing::error!("{}", err);
        err
    }
}

/// Names travel inside the manifest text, so its delimiters are reserved.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(KvError::InvalidArgument("name cannot be empty".to_string()));
    }
    if name.contains('/') || name.contains('|') {
        return Err(KvError::InvalidArgument(format!(
            "name '{}' cannot contain '/' or '|'",
            name
        )));
    }
    Ok(())
}
