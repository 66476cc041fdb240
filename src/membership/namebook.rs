use crate::error::{KvError, Result};

use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

/// Address of one server replica, written as `machine_id|ip:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub machine_id: u32,
    pub ip: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(machine_id: u32, ip: impl Into<String>, port: u16) -> Self {
        Self {
            machine_id,
            ip: ip.into(),
            port,
        }
    }

    /// `ip:port`, the form transports connect to.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}:{}", self.machine_id, self.ip, self.port)
    }
}

impl FromStr for ServerAddr {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || KvError::Configuration(format!("invalid server address '{}'", s));

        let (machine, socket) = s.split_once('|').ok_or_else(invalid)?;
        let (ip, port) = socket.rsplit_once(':').ok_or_else(invalid)?;
        if ip.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            machine_id: machine.trim().parse().map_err(|_| invalid())?,
            ip: ip.to_string(),
            port: port.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Server rank -> address registry, identical on every participant.
///
/// Replicas of machine `m` hold the contiguous ranks
/// `m * backup_count .. (m + 1) * backup_count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNamebook {
    servers: Vec<ServerAddr>,
    backup_count: usize,
}

impl ServerNamebook {
    /// Validates that replicas are grouped per machine, machines are numbered
    /// from 0 without gaps, and every machine has the same replica count.
    pub fn from_addrs(servers: Vec<ServerAddr>) -> Result<Self> {
        if servers.is_empty() {
            return Err(KvError::Configuration(
                "server namebook cannot be empty".to_string(),
            ));
        }

        // Leading run of machine 0.
        let backup_count = servers.iter().take_while(|s| s.machine_id == 0).count();
        if backup_count == 0 {
            return Err(KvError::Configuration(format!(
                "first server must belong to machine 0, found machine {}",
                servers[0].machine_id
            )));
        }
        if servers.len() % backup_count != 0 {
            return Err(KvError::Configuration(format!(
                "{} servers cannot be split into machines of {} replicas",
                servers.len(),
                backup_count
            )));
        }

        for (rank, server) in servers.iter().enumerate() {
            let expected = (rank / backup_count) as u32;
            if server.machine_id != expected {
                return Err(KvError::Configuration(format!(
                    "server rank {} ({}) should belong to machine {}; every machine must list {} replicas in order",
                    rank, server, expected, backup_count
                )));
            }
        }

        Ok(Self {
            servers,
            backup_count,
        })
    }

    /// Parses `machine_id|ip:port` entries in rank order.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let servers = entries
            .iter()
            .map(|entry| entry.as_ref().parse())
            .collect::<Result<Vec<ServerAddr>>>()?;
        Self::from_addrs(servers)
    }

    pub fn get(&self, rank: usize) -> Option<&ServerAddr> {
        self.servers.get(rank)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ServerAddr)> {
        self.servers.iter().enumerate()
    }

    pub fn backup_count(&self) -> usize {
        self.backup_count
    }

    pub fn machine_count(&self) -> usize {
        self.servers.len() / self.backup_count
    }

    pub fn machine_of(&self, rank: usize) -> Option<u32> {
        self.servers.get(rank).map(|s| s.machine_id)
    }

    pub fn replicas_of(&self, machine_id: u32) -> Range<usize> {
        let first = machine_id as usize * self.backup_count;
        first..first + self.backup_count
    }

    /// First machine whose servers listen on `ip`.
    pub fn machine_with_ip(&self, ip: &str) -> Option<u32> {
        self.servers
            .iter()
            .find(|s| s.ip == ip)
            .map(|s| s.machine_id)
    }
}

/// Reads a cluster file with lines `machine_id ip port server_count`.
pub fn read_ip_config(path: impl AsRef<Path>) -> Result<ServerNamebook> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        KvError::Configuration(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_ip_config(&text)
}

/// Expands each machine line into `server_count` replicas on consecutive
/// ports. Any malformed line rejects the whole file.
pub fn parse_ip_config(text: &str) -> Result<ServerNamebook> {
    let mut servers = Vec::new();
    let mut next_machine = 0u32;
    let mut replicas: Option<usize> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let lineno = idx + 1;
        let bad = |what: &str| KvError::Configuration(format!("line {}: {} in '{}'", lineno, what, line));

        let fields: Vec<&str> = line.split_whitespace().collect();
        let [machine, ip, port, count] = fields.as_slice() else {
            return Err(bad("expected 'machine_id ip port server_count'"));
        };

        let machine_id: u32 = machine.parse().map_err(|_| bad("invalid machine id"))?;
        let base_port: u16 = port.parse().map_err(|_| bad("invalid port"))?;
        let server_count: usize = count.parse().map_err(|_| bad("invalid server count"))?;

        if machine_id != next_machine {
            return Err(bad(&format!(
                "machine ids must increase from 0 without gaps, expected {}",
                next_machine
            )));
        }
        if server_count == 0 {
            return Err(bad("server count must be at least 1"));
        }
        match replicas {
            Some(expected) if expected != server_count => {
                return Err(bad(&format!(
                    "inconsistent server count, every machine must run {}",
                    expected
                )));
            }
            _ => replicas = Some(server_count),
        }

        for offset in 0..server_count {
            let port = u16::try_from(base_port as usize + offset)
                .map_err(|_| bad("port range exceeds 65535"))?;
            servers.push(ServerAddr::new(machine_id, *ip, port));
        }
        next_machine += 1;
    }

    ServerNamebook::from_addrs(servers)
}
