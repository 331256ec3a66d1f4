//! Discover, monitor, and control fleets of conductor-managed sequencers.
//!
//! A fleet is organized into [network::Network]s, each a fixed set of
//! [sequencer::Sequencer]s (a conductor paired with a rollup node). The
//! [repository::Repository] resolves the fleet from cluster metadata through a
//! [discovery::Provider], keeps the topology and each member's status fresh under two
//! independent TTLs, and serves stale data when a refresh fails. Mutating operations
//! are exposed per sequencer and, with precondition checks, through
//! [actions::Controller].
//!
//! # Status
//!
//! `seqctl-fleet` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use std::{fmt, sync::Arc};
use thiserror::Error;

pub mod actions;
pub mod config;
pub mod context;
pub mod discovery;
pub mod network;
pub mod repository;
pub mod rpc;
pub mod selector;
pub mod sequencer;

#[cfg(test)]
mod mocks;

pub use config::Config;
pub use context::Context;
pub use network::{Network, NetworkView};
pub use repository::Repository;
pub use sequencer::{Sequencer, SequencerView, Status};

/// A sequencer that failed to refresh and why.
#[derive(Clone, Debug)]
pub struct Failure {
    pub sequencer: String,
    pub error: Arc<Error>,
}

/// Every member failure from a single network refresh.
#[derive(Clone, Debug)]
pub struct Failures(pub Vec<Failure>);

impl Failures {
    /// The first failure observed.
    pub fn first(&self) -> Option<&Failure> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Failures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .0
            .iter()
            .map(|failure| format!("{}: {}", failure.sequencer, failure.error))
            .collect::<Vec<_>>();
        write!(f, "{} sequencer(s) failed ({})", self.0.len(), parts.join("; "))
    }
}

/// Errors that can occur when operating on the fleet.
#[derive(Error, Debug)]
pub enum Error {
    #[error("sequencer {id} not initialized: {source}")]
    NotInitialized {
        id: String,
        source: Arc<rpc::Error>,
    },
    #[error("sequencer {id}: {source}")]
    Rpc { id: String, source: rpc::Error },
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("network not found: {0}")]
    NetworkNotFound(String),
    #[error("sequencer {sequencer} not found in network {network}")]
    SequencerNotFound { network: String, sequencer: String },
    #[error("no cached networks: {0}")]
    CacheEmpty(Box<Error>),
    #[error("discovery failed: {0}")]
    Discovery(#[from] discovery::Error),
    #[error("refresh failed: {0}")]
    Refresh(Failures),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("refresh task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    /// Convert into a shareable handle without re-wrapping an already shared error.
    pub fn into_shared(self) -> Arc<Error> {
        match self {
            Self::Shared(error) => error,
            other => Arc::new(other),
        }
    }
}
