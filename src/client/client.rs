use crate::config::StoreConfig;
use crate::error::{KvError, Result};
use crate::membership::bootstrap::{ClientPhase, Manifest, ManifestEntry, parse_rank};
use crate::membership::namebook::ServerNamebook;
use crate::network::transport::{Transport, recv_within};
use crate::network::{KvMessage, MessageKind};
use crate::server::server::validate_name;
use crate::storage::handlers::{Overwrite, PushHandler, apply_pull, apply_push};
use crate::storage::memory::{DataStore, TensorRole};
use crate::storage::partitioner::{PartitionDirectory, PartitionTable};
use crate::storage::selector::{RandomReplica, ReplicaSelector};
use crate::storage::shared::{SharedMemory, read_tensor, write_tensor};
use crate::tensor::{DType, Tensor};

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;

/// Source of a client's partition book.
#[derive(Debug, Clone)]
pub enum PartitionBook {
    /// Owning machine per global id. Also published to shared memory so
    /// co-located clients can attach with `Shared`.
    Table(Vec<u32>),
    /// Attach to a book another client on this machine published.
    Shared { len: usize },
}

/// Row layout of a data tensor as listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RowLayout {
    row_shape: Vec<usize>,
    dtype: DType,
}

/// Cluster-wide push/pull front end.
///
/// Not shareable between tasks: one client owns one transport and every
/// blocking call waits on that transport's inbox.
pub struct KvClient {
    namebook: ServerNamebook,
    transport: Box<dyn Transport>,
    shared: Arc<dyn SharedMemory>,
    config: StoreConfig,
    selector: Box<dyn ReplicaSelector>,
    push_handler: Box<dyn PushHandler>,
    directory: PartitionDirectory,
    store: DataStore,
    layouts: HashMap<String, RowLayout>,
    machine_id: u32,
    listen_addr: Option<String>,
    addr: Option<String>,
    client_id: Option<usize>,
    phase: ClientPhase,
}

impl KvClient {
    pub fn new(
        namebook: ServerNamebook,
        transport: Box<dyn Transport>,
        shared: Arc<dyn SharedMemory>,
        config: StoreConfig,
    ) -> Self {
        let machine_id = detect_machine_id(&namebook);

        Self {
            namebook,
            transport,
            shared,
            config,
            selector: Box::new(RandomReplica::new()),
            push_handler: Box::new(Overwrite),
            directory: PartitionDirectory::new(),
            store: DataStore::new(),
            layouts: HashMap::new(),
            machine_id,
            listen_addr: None,
            addr: None,
            client_id: None,
            phase: ClientPhase::Unconnected,
        }
    }

    pub fn with_machine_id(mut self, machine_id: u32) -> Self {
        self.machine_id = machine_id;
        self
    }

    pub fn with_selector(mut self, selector: Box<dyn ReplicaSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Handler for the local fast path. Must match the servers' handler.
    pub fn with_push_handler(mut self, handler: Box<dyn PushHandler>) -> Self {
        self.push_handler = handler;
        self
    }

    /// Address to listen on; defaults to the outbound IP with an ephemeral port.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Rank assigned by the servers; `None` before `connect`.
    pub fn get_id(&self) -> Option<usize> {
        self.client_id
    }

    /// Announced `ip:port`; `None` before `connect`.
    pub fn get_addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    pub fn get_machine_id(&self) -> u32 {
        self.machine_id
    }

    pub fn backup_count(&self) -> usize {
        self.namebook.backup_count()
    }

    pub fn server_count(&self) -> usize {
        self.namebook.len()
    }

    pub fn machine_count(&self) -> usize {
        self.namebook.machine_count()
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// Installs the partition book of `name`.
    pub fn set_partition_book(&mut self, name: &str, book: PartitionBook) -> Result<()> {
        validate_name(name)?;
        let shared_name = TensorRole::Partition.shared_name(name);

        let (table, block) = match book {
            PartitionBook::Table(owners) => {
                let table = PartitionTable::new(owners)?;
                self.check_owners(name, &table)?;
                let block = self
                    .shared
                    .create(&shared_name, &[table.len()], DType::Int64)?;
                let values: Vec<i64> = table.as_slice().iter().map(|&m| m as i64).collect();
                *write_tensor(&block)? = Tensor::vector_i64(values);
                (table, block)
            }
            PartitionBook::Shared { len } => {
                let block = self.shared.attach(&shared_name, &[len], DType::Int64)?;
                let table = {
                    let guard = read_tensor(&block)?;
                    PartitionTable::from_tensor(&guard)?
                };
                self.check_owners(name, &table)?;
                (table, block)
            }
        };

        self.directory.install(name, table)?;
        self.store.insert(name, TensorRole::Partition, block);
        Ok(())
    }

    fn check_owners(&self, name: &str, table: &PartitionTable) -> Result<()> {
        let machines = self.namebook.machine_count();
        match table.as_slice().iter().find(|&&m| m as usize >= machines) {
            Some(bad) => Err(KvError::Configuration(format!(
                "partition book of '{}' names machine {} but the cluster has {} machines",
                name, bad, machines
            ))),
            None => Ok(()),
        }
    }

    /// Bootstrap: announce to every server, then receive rank and manifest
    /// from server 0.
    pub async fn connect(&mut self) -> Result<()> {
        if self.phase != ClientPhase::Unconnected {
            return Err(KvError::InvalidArgument("client already connected".to_string()));
        }

        let listen = match &self.listen_addr {
            Some(addr) => addr.clone(),
            None => format!("{}:0", outbound_ip()),
        };
        let addr = self.transport.listen(&listen).await?;
        self.addr = Some(addr.clone());

        for (rank, server) in self.namebook.iter() {
            self.transport.add_peer(rank, &server.socket_addr());
        }
        self.transport.connect().await?;

        // Rank is unknown until the servers answer; 0 is a placeholder.
        let announce = KvMessage::ip_id(0, addr.clone());
        for rank in 0..self.namebook.len() {
            self.transport.send(rank, &announce).await?;
        }
        self.phase = ClientPhase::Announced;

        let timeout = self.config.bootstrap_timeout();
        let msg = recv_within(self.transport.as_mut(), timeout, "rank assignment").await?;
        let rank = parse_rank(self.bootstrap_body(&msg)?)?;
        self.client_id = Some(rank);
        self.phase = ClientPhase::RankAssigned;

        let msg = recv_within(self.transport.as_mut(), timeout, "tensor manifest").await?;
        let manifest = Manifest::decode(self.bootstrap_body(&msg)?)?;
        self.phase = ClientPhase::ManifestReceived;

        for entry in &manifest.entries {
            self.attach_entry(entry)?;
        }
        self.attach_local_maps();
        self.phase = ClientPhase::Ready;

        tracing::info!(
            "KVClient {} connected to kvstore at {} (machine {})",
            rank,
            addr,
            self.machine_id
        );
        Ok(())
    }

    /// Only server 0 may drive bootstrap.
    fn bootstrap_body<'a>(&self, msg: &'a KvMessage) -> Result<&'a str> {
        if msg.kind != MessageKind::IpId || msg.sender_rank != 0 {
            let err = KvError::Protocol(format!(
                "expected bootstrap message from server 0, got {} from rank {}",
                msg.kind, msg.sender_rank
            ));
            tracing::error!("{}", err);
            return Err(err);
        }
        msg.require_name()
    }

    /// Attaches to the local block of a manifest entry when this machine has
    /// one. Shards differ in length between machines, so only element type
    /// and row shape must agree.
    fn attach_entry(&mut self, entry: &ManifestEntry) -> Result<()> {
        let (name, role) = TensorRole::split_shared_name(&entry.name).ok_or_else(|| {
            KvError::Protocol(format!("manifest entry '{}' has no role suffix", entry.name))
        })?;
        if role == TensorRole::Data {
            self.layouts.insert(
                name.to_string(),
                RowLayout {
                    row_shape: entry.shape[1..].to_vec(),
                    dtype: entry.dtype,
                },
            );
        }

        let Some(block) = self.shared.lookup(&entry.name) else {
            tracing::debug!("No local block for {}, using the network path", entry.name);
            return Ok(());
        };

        {
            let local = read_tensor(&block)?;
            if local.dtype() != entry.dtype || local.row_shape() != &entry.shape[1..] {
                return Err(KvError::Protocol(format!(
                    "local block {} is {:?} {}, manifest lists {:?} {}",
                    entry.name,
                    local.shape(),
                    local.dtype(),
                    entry.shape,
                    entry.dtype
                )));
            }
        }

        self.store.insert(name, role, block);
        Ok(())
    }

    /// A machine's global-to-local table may be absent from the coordinator's
    /// manifest when only some machines remap ids.
    fn attach_local_maps(&mut self) {
        let names: Vec<String> = self
            .store
            .entries()
            .filter(|(_, role, _)| *role == TensorRole::Data)
            .map(|(name, _, _)| name.to_string())
            .collect();

        for name in names {
            if self.store.contains(&name, TensorRole::LocalMap) {
                continue;
            }
            if let Some(block) = self.shared.lookup(&TensorRole::LocalMap.shared_name(&name)) {
                self.store.insert(&name, TensorRole::LocalMap, block);
            }
        }
    }

    fn require_rank(&self) -> Result<usize> {
        self.client_id
            .ok_or_else(|| KvError::InvalidArgument("client is not connected".to_string()))
    }

    /// Rejects requests the servers could not serve, before anything is sent.
    fn check_layout(&self, name: &str, values: Option<&Tensor>) -> Result<()> {
        let layout = self.layouts.get(name).ok_or_else(|| {
            KvError::InvalidArgument(format!("no tensor named '{}' in the cluster", name))
        })?;
        if let Some(values) = values {
            if values.dtype() != layout.dtype || values.row_shape() != layout.row_shape.as_slice() {
                return Err(KvError::InvalidArgument(format!(
                    "values for '{}' have rows {:?} {}, expected {:?} {}",
                    name,
                    values.row_shape(),
                    values.dtype(),
                    layout.row_shape,
                    layout.dtype
                )));
            }
        }
        Ok(())
    }

    fn is_local(&self, machine_id: u32, name: &str) -> bool {
        self.config.local_fast_path
            && machine_id == self.machine_id
            && self.store.contains(name, TensorRole::Data)
    }

    /// Writes `values` (one row per id) to the owners of `ids`.
    ///
    /// Returns once remote requests are handed to the transport; use `barrier`
    /// before relying on them from another client.
    pub async fn push(&mut self, name: &str, ids: &[u64], values: &Tensor) -> Result<()> {
        let rank = self.require_rank()?;
        validate_name(name)?;
        self.check_layout(name, Some(values))?;
        if ids.len() != values.rows() {
            return Err(KvError::InvalidArgument(format!(
                "push to '{}' has {} ids but {} value rows",
                name,
                ids.len(),
                values.rows()
            )));
        }
        if ids.is_empty() {
            return Ok(());
        }

        let plan = self.directory.resolve_batch(name, ids)?;
        let backups = self.namebook.backup_count();

        for group in plan.groups() {
            let rows = values.gather(&group.positions)?;
            if self.is_local(group.machine_id, name) {
                apply_push(
                    &self.store,
                    self.push_handler.as_ref(),
                    name,
                    &group.keys,
                    &rows,
                )?;
            } else {
                let server = self.selector.choose_replica(group.machine_id, backups);
                tracing::debug!(
                    "Client {} PUSH {} x{} -> server {}",
                    rank,
                    name,
                    group.keys.len(),
                    server
                );
                let msg = KvMessage::push(rank, name, group.keys.clone(), rows);
                self.transport.send(server, &msg).await?;
            }
        }
        Ok(())
    }

    /// Reads one row per id, in the order of `ids`.
    pub async fn pull(&mut self, name: &str, ids: &[u64]) -> Result<Tensor> {
        let rank = self.require_rank()?;
        validate_name(name)?;
        self.check_layout(name, None)?;
        if ids.is_empty() {
            return Err(KvError::InvalidArgument(format!(
                "pull from '{}' needs at least one id",
                name
            )));
        }

        let plan = self.directory.resolve_batch(name, ids)?;
        let backups = self.namebook.backup_count();
        let mut parts: Vec<Option<Tensor>> = vec![None; plan.groups().len()];
        let mut pending: HashMap<u32, usize> = HashMap::new();

        for (idx, group) in plan.groups().iter().enumerate() {
            if self.is_local(group.machine_id, name) {
                parts[idx] = Some(apply_pull(&self.store, name, &group.keys)?);
            } else {
                let server = self.selector.choose_replica(group.machine_id, backups);
                let msg = KvMessage::pull(rank, name, group.keys.clone());
                self.transport.send(server, &msg).await?;
                pending.insert(group.machine_id, idx);
            }
        }

        // Exactly one reply per remote group, rejected or not, so no stale
        // reply is left behind for the next request.
        let mut rejected = None;
        while !pending.is_empty() {
            let timeout = self.config.request_timeout();
            let msg = recv_within(self.transport.as_mut(), timeout, "pull reply").await?;
            if msg.kind != MessageKind::PullBack || msg.name.as_deref() != Some(name) {
                return Err(self.unexpected(&msg, "while waiting for pull replies"));
            }
            let idx = self
                .namebook
                .machine_of(msg.sender_rank)
                .and_then(|machine| pending.remove(&machine))
                .ok_or_else(|| self.unexpected(&msg, "from a machine with no pending pull"))?;
            match msg.payload {
                Some(rows) => parts[idx] = Some(rows),
                None => rejected = Some(msg.sender_rank),
            }
        }
        if let Some(server) = rejected {
            return Err(KvError::InvalidArgument(format!(
                "server {} rejected pull from '{}'",
                server, name
            )));
        }

        let parts = parts
            .into_iter()
            .collect::<Option<Vec<Tensor>>>()
            .ok_or_else(|| KvError::Protocol("pull finished with missing results".to_string()))?;
        plan.reassemble(parts)
    }

    /// Blocks until every client reached its barrier.
    ///
    /// Goes through every server replica: pushes are spread over replicas, and
    /// each replica's inbox is ordered, so a reply from all of them means every
    /// earlier push has been applied.
    pub async fn barrier(&mut self) -> Result<()> {
        let rank = self.require_rank()?;
        let msg = KvMessage::barrier(rank);
        for server in 0..self.namebook.len() {
            self.transport.send(server, &msg).await?;
        }

        let timeout = self.config.request_timeout();
        for _ in 0..self.namebook.len() {
            let reply = recv_within(self.transport.as_mut(), timeout, "barrier reply").await?;
            if reply.kind != MessageKind::Barrier {
                return Err(self.unexpected(&reply, "while waiting at a barrier"));
            }
        }
        tracing::debug!("Client {} passed barrier", rank);
        Ok(())
    }

    /// Stops every server replica. Usually called by a single client.
    pub async fn shut_down(&mut self) -> Result<()> {
        let rank = self.require_rank()?;
        let msg = KvMessage::final_msg(rank);
        for server in 0..self.namebook.len() {
            self.transport.send(server, &msg).await?;
        }
        tracing::info!("Client {} sent shutdown to {} servers", rank, self.namebook.len());
        Ok(())
    }

    /// Human-readable dump of identity and locally attached tensors.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let id = self
            .client_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(out, "Client ID: {}", id);
        let _ = writeln!(out, "Machine ID: {}", self.machine_id);
        let _ = writeln!(out, "Backup count: {}", self.backup_count());
        for (name, role, block) in self.store.entries() {
            match read_tensor(block) {
                Ok(tensor) => {
                    let _ = writeln!(
                        out,
                        "  {} {:?} {:?} {}",
                        role.shared_name(name),
                        role,
                        tensor.shape(),
                        tensor.dtype()
                    );
                }
                Err(e) => {
                    let _ = writeln!(out, "  {} {:?} <{}>", role.shared_name(name), role, e);
                }
            }
        }
        out
    }

    fn unexpected(&self, msg: &KvMessage, context: &str) -> KvError {
        let err = KvError::Protocol(format!(
            "client {:?} got unexpected {} from rank {} {}",
            self.client_id, msg.kind, msg.sender_rank, context
        ));
        tracing::error!("{}", err);
        err
    }
}

/// IP of the interface that routes outward; loopback when there is none.
pub fn outbound_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        // Nothing is sent; connect only selects a route.
        socket.connect("10.255.255.255:1")?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Binding succeeds only for addresses assigned to one of this host's interfaces.
fn is_local_ip(ip: &str) -> bool {
    UdpSocket::bind((ip, 0)).is_ok()
}

/// Outbound IP first, then the first listed server whose IP belongs to any
/// local interface (multi-homed hosts, loopback clusters), else machine 0.
pub(crate) fn detect_machine_id(namebook: &ServerNamebook) -> u32 {
    let ip = outbound_ip().to_string();
    namebook
        .machine_with_ip(&ip)
        .or_else(|| {
            namebook
                .iter()
                .find(|(_, server)| is_local_ip(&server.ip))
                .map(|(_, server)| server.machine_id)
        })
        .unwrap_or(0)
}
