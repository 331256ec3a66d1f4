//! Control and status RPC surface of a sequencer's conductor and rollup node.
//!
//! [Conductor] and [Node] capture the calls the fleet needs from each process. A [Connector]
//! builds a pair of them from endpoint URLs; [HttpConnector] does so over JSON-RPC/HTTP.

use alloy_primitives::B256;
use jsonrpsee::core::ClientError;
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use thiserror::Error;

mod http;
pub use http::{ConductorClient, HttpConnector, NodeClient};
mod tls;
pub use tls::{Identity, Tls};

/// Errors that can occur when talking to a conductor or node.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid endpoint {url}: {source}")]
    Build { url: String, source: ClientError },
    #[error("invalid bearer token")]
    InvalidToken,
    #[error("invalid tls settings: {0}")]
    Tls(String),
    #[error("{method} failed: {source}")]
    Call {
        method: &'static str,
        source: ClientError,
    },
    #[error("{method} timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },
}

/// Number and hash of a block.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockId {
    pub hash: B256,
    pub number: u64,
}

/// Reference to an execution block, anchored to the base-layer block it derives from.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct L2BlockRef {
    pub hash: B256,
    pub number: u64,
    pub parent_hash: B256,
    pub timestamp: u64,
    #[serde(rename = "l1origin")]
    pub l1_origin: BlockId,
    #[serde(default)]
    pub sequence_number: u64,
}

/// Subset of a rollup node's sync status.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub unsafe_l2: L2BlockRef,
    #[serde(default)]
    pub safe_l2: L2BlockRef,
    #[serde(default)]
    pub finalized_l2: L2BlockRef,
}

/// Whether a consensus member counts toward quorum.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

impl TryFrom<u8> for Suffrage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Voter),
            1 => Ok(Self::Nonvoter),
            other => Err(format!("unknown suffrage: {other}")),
        }
    }
}

impl From<Suffrage> for u8 {
    fn from(value: Suffrage) -> Self {
        match value {
            Suffrage::Voter => 0,
            Suffrage::Nonvoter => 1,
        }
    }
}

/// A member of the consensus cluster as reported by a conductor.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub addr: String,
    pub suffrage: Suffrage,
}

/// Consensus cluster membership and the log version it was read at.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterMembership {
    pub servers: Vec<ServerInfo>,
    pub version: u64,
}

/// Calls served by a conductor.
pub trait Conductor: Send + Sync + 'static {
    /// Whether the conductor is participating (neither paused nor stopped).
    fn active(&self) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Whether the conductor is the consensus leader.
    fn leader(&self) -> impl Future<Output = Result<bool, Error>> + Send;

    fn paused(&self) -> impl Future<Output = Result<bool, Error>> + Send;

    fn stopped(&self) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Whether the conductor considers its sequencer healthy.
    fn sequencer_healthy(&self) -> impl Future<Output = Result<bool, Error>> + Send;

    fn pause(&self) -> impl Future<Output = Result<(), Error>> + Send;

    fn resume(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Hand leadership to any other voter. Only meaningful on the leader.
    fn transfer_leader(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Hand leadership to a specific server. Only meaningful on the leader.
    fn transfer_leader_to_server(
        &self,
        id: &str,
        addr: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Set or clear an out-of-band leadership claim.
    fn override_leader(&self, value: bool) -> impl Future<Output = Result<(), Error>> + Send;

    fn leader_with_id(&self) -> impl Future<Output = Result<ServerInfo, Error>> + Send;

    fn cluster_membership(&self) -> impl Future<Output = Result<ClusterMembership, Error>> + Send;

    /// Add a voting member, fenced on the membership `version`.
    fn add_server_as_voter(
        &self,
        id: &str,
        addr: &str,
        version: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Add a non-voting member, fenced on the membership `version`.
    fn add_server_as_nonvoter(
        &self,
        id: &str,
        addr: &str,
        version: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove a member, fenced on the membership `version`.
    fn remove_server(&self, id: &str, version: u64)
        -> impl Future<Output = Result<(), Error>> + Send;
}

/// Calls served by a rollup node.
pub trait Node: Send + Sync + 'static {
    /// Whether the node is producing blocks.
    fn sequencer_active(&self) -> impl Future<Output = Result<bool, Error>> + Send;

    fn sync_status(&self) -> impl Future<Output = Result<SyncStatus, Error>> + Send;

    /// Stop block production, returning the hash of the last block produced.
    fn stop_sequencer(&self) -> impl Future<Output = Result<B256, Error>> + Send;

    /// Resume block production on top of `hash`.
    fn start_sequencer(&self, hash: B256) -> impl Future<Output = Result<(), Error>> + Send;

    /// Claim leadership on the node side (pairs with [Conductor::override_leader]).
    fn override_leader(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Builds conductor and node handles for a sequencer's endpoints.
///
/// Building a handle must not perform I/O: connections are established by the first call.
pub trait Connector: Clone + Send + Sync + 'static {
    type Conductor: Conductor;
    type Node: Node;

    fn connect(
        &self,
        conductor_url: &str,
        node_url: &str,
    ) -> Result<(Self::Conductor, Self::Node), Error>;
}
