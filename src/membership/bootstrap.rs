use crate::error::{KvError, Result};
use crate::tensor::DType;

use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Unconnected,
    AwaitingClients,
    /// Every client registered; connections back to clients are open.
    Ready,
    Serving,
    Stopped,
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerPhase::Unconnected => "unconnected",
            ServerPhase::AwaitingClients => "awaiting-clients",
            ServerPhase::Ready => "ready",
            ServerPhase::Serving => "serving",
            ServerPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Unconnected,
    Announced,
    RankAssigned,
    ManifestReceived,
    Ready,
}

impl fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientPhase::Unconnected => "unconnected",
            ClientPhase::Announced => "announced",
            ClientPhase::RankAssigned => "rank-assigned",
            ClientPhase::ManifestReceived => "manifest-received",
            ClientPhase::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Orders announced client addresses into ranks.
///
/// The sort key is the address string compared byte by byte, so the result
/// does not depend on arrival order. Every server computes the same table.
pub fn assign_client_ranks(announced: Vec<String>) -> Result<Vec<String>> {
    let count = announced.len();
    let unique: BTreeSet<String> = announced.into_iter().collect();
    if unique.len() != count {
        return Err(KvError::Protocol(format!(
            "{} clients announced only {} distinct addresses",
            count,
            unique.len()
        )));
    }
    Ok(unique.into_iter().collect())
}

/// Parses the rank a coordinating server assigned to this client.
pub fn parse_rank(body: &str) -> Result<usize> {
    body.trim()
        .parse()
        .map_err(|_| KvError::Protocol(format!("invalid rank assignment '{}'", body)))
}

/// One shared tensor listed by the coordinating server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Shared block name, including its role suffix.
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Shared tensors a machine's servers own, sent to every client after ranks.
///
/// Text form: `name/dim0/dim1/.../dtype` per entry, each followed by `|`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, shape: &[usize], dtype: DType) {
        self.entries.push(ManifestEntry {
            name: name.to_string(),
            shape: shape.to_vec(),
            dtype,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.name);
            for dim in &entry.shape {
                out.push('/');
                out.push_str(&dim.to_string());
            }
            out.push('/');
            out.push_str(entry.dtype.as_str());
            out.push('|');
        }
        out
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut manifest = Self::new();

        for raw in text.split('|').filter(|s| !s.is_empty()) {
            let invalid = |what: &str| {
                KvError::Protocol(format!("invalid manifest entry '{}': {}", raw, what))
            };

            let parts: Vec<&str> = raw.split('/').collect();
            let [name, dims @ .., dtype] = parts.as_slice() else {
                return Err(invalid("too few fields"));
            };
            if name.is_empty() {
                return Err(invalid("empty name"));
            }
            if dims.is_empty() {
                return Err(invalid("empty shape"));
            }

            let dtype = DType::parse(dtype).ok_or_else(|| invalid("unsupported dtype"))?;
            let shape = dims
                .iter()
                .map(|d| d.parse::<usize>().map_err(|_| invalid("invalid dimension")))
                .collect::<Result<Vec<_>>>()?;

            manifest.push(name, &shape, dtype);
        }

        Ok(manifest)
    }
}
