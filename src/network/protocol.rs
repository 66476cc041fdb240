use crate::error::{KvError, Result};
use crate::tensor::Tensor;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message types exchanged between clients and servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Client announcement during bootstrap; servers reuse it for the rank
    /// reply and the manifest.
    IpId,
    Push,
    Pull,
    /// Reply to `Pull`.
    PullBack,
    Barrier,
    /// Stops the receiving server.
    Final,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::IpId => "IP_ID",
            MessageKind::Push => "PUSH",
            MessageKind::Pull => "PULL",
            MessageKind::PullBack => "PULL_BACK",
            MessageKind::Barrier => "BARRIER",
            MessageKind::Final => "FINAL",
        };
        f.write_str(s)
    }
}

/// One envelope on the wire. Immutable once built and consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvMessage {
    pub kind: MessageKind,
    pub sender_rank: usize,
    pub name: Option<String>,
    pub ids: Option<Vec<u64>>,
    pub payload: Option<Tensor>,
}

impl KvMessage {
    fn bare(kind: MessageKind, sender_rank: usize) -> Self {
        Self {
            kind,
            sender_rank,
            name: None,
            ids: None,
            payload: None,
        }
    }

    /// Bootstrap message carrying a text body (address, rank or manifest).
    pub fn ip_id(sender_rank: usize, body: impl Into<String>) -> Self {
        Self {
            name: Some(body.into()),
            ..Self::bare(MessageKind::IpId, sender_rank)
        }
    }

    pub fn push(sender_rank: usize, name: &str, ids: Vec<u64>, values: Tensor) -> Self {
        Self {
            name: Some(name.to_string()),
            ids: Some(ids),
            payload: Some(values),
            ..Self::bare(MessageKind::Push, sender_rank)
        }
    }

    pub fn pull(sender_rank: usize, name: &str, ids: Vec<u64>) -> Self {
        Self {
            name: Some(name.to_string()),
            ids: Some(ids),
            ..Self::bare(MessageKind::Pull, sender_rank)
        }
    }

    pub fn pull_back(sender_rank: usize, name: &str, ids: Vec<u64>, values: Tensor) -> Self {
        Self {
            name: Some(name.to_string()),
            ids: Some(ids),
            payload: Some(values),
            ..Self::bare(MessageKind::PullBack, sender_rank)
        }
    }

    /// `PullBack` without a payload: the server could not serve the request
    /// (unknown tensor, id outside its shard).
    pub fn pull_rejected(sender_rank: usize, name: &str, ids: Vec<u64>) -> Self {
        Self {
            name: Some(name.to_string()),
            ids: Some(ids),
            ..Self::bare(MessageKind::PullBack, sender_rank)
        }
    }

    pub fn barrier(sender_rank: usize) -> Self {
        Self::bare(MessageKind::Barrier, sender_rank)
    }

    pub fn final_msg(sender_rank: usize) -> Self {
        Self::bare(MessageKind::Final, sender_rank)
    }

    pub fn require_name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| self.missing("name"))
    }

    pub fn require_ids(&self) -> Result<&[u64]> {
        self.ids.as_deref().ok_or_else(|| self.missing("ids"))
    }

    pub fn require_payload(&self) -> Result<&Tensor> {
        self.payload.as_ref().ok_or_else(|| self.missing("payload"))
    }

    /// Moves the payload out, for replies the receiver keeps.
    pub fn into_payload(self) -> Result<Tensor> {
        let err = self.missing("payload");
        self.payload.ok_or(err)
    }

    fn missing(&self, field: &str) -> KvError {
        KvError::Protocol(format!(
            "{} message from rank {} has no {}",
            self.kind, self.sender_rank, field
        ))
    }
}
