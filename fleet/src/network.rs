//! A named group of sequencers that share a consensus cluster.
//!
//! Membership is fixed when a [Network] is constructed; discovery builds a new [Network]
//! whenever membership changes.

use crate::{
    context::Context,
    rpc::Connector,
    sequencer::{Sequencer, SequencerView},
    Error, Failure, Failures,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, warn};

#[derive(Default)]
struct State {
    updated_at: Option<DateTime<Utc>>,
    last_error: Option<Arc<Error>>,
}

/// A named, fixed set of [Sequencer]s.
pub struct Network<C: Connector> {
    name: String,
    sequencers: Vec<Arc<Sequencer<C>>>,
    state: Mutex<State>,
}

impl<C: Connector> fmt::Debug for Network<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field(
                "sequencers",
                &self.sequencers.iter().map(|s| s.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<C: Connector> Network<C> {
    pub fn new(name: String, sequencers: Vec<Arc<Sequencer<C>>>) -> Self {
        Self {
            name,
            sequencers,
            state: Mutex::new(State::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members in discovery order.
    pub fn sequencers(&self) -> Vec<Arc<Sequencer<C>>> {
        self.sequencers.clone()
    }

    pub fn sequencer(&self, id: &str) -> Option<Arc<Sequencer<C>>> {
        self.sequencers.iter().find(|s| s.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sequencers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequencers.is_empty()
    }

    /// First member that reports itself as the consensus leader.
    pub fn leader(&self) -> Option<Arc<Sequencer<C>>> {
        self.sequencers.iter().find(|s| s.is_leader()).cloned()
    }

    /// First member that reports block production as active.
    pub fn active(&self) -> Option<Arc<Sequencer<C>>> {
        self.sequencers.iter().find(|s| s.is_active()).cloned()
    }

    /// Whether every member reports a healthy sequencer.
    pub fn healthy(&self) -> bool {
        self.sequencers.iter().all(|s| s.is_healthy())
    }

    /// Time of the last bulk refresh (successful or not).
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().updated_at
    }

    /// Error from the last bulk refresh, if it failed.
    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.state.lock().unwrap().last_error.clone()
    }

    /// Whether any member's status is older than `ttl` (or was never fetched).
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.sequencers.iter().any(|s| s.is_stale(ttl))
    }

    /// Refresh every member concurrently.
    ///
    /// All members share one scope: the first failure cancels the others' in-flight calls,
    /// but every member still records its own outcome. Returns every failure observed.
    pub async fn update(&self, ctx: &Context) -> Result<(), Error> {
        let scope = ctx.child();
        let tasks = self.sequencers.iter().cloned().map(|sequencer| {
            let scope = scope.clone();
            tokio::spawn(async move {
                let result = sequencer.update(&scope).await;
                if result.is_err() {
                    scope.cancel();
                }
                result.map_err(|err| Failure {
                    sequencer: sequencer.id().to_string(),
                    error: err.into_shared(),
                })
            })
        });
        let ids = self
            .sequencers
            .iter()
            .map(|s| s.id().to_string())
            .collect::<Vec<_>>();
        let mut failures = Vec::new();
        for (id, joined) in ids.into_iter().zip(join_all(tasks).await) {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => failures.push(failure),
                Err(err) => failures.push(Failure {
                    sequencer: id,
                    error: Arc::new(Error::Join(err)),
                }),
            }
        }

        let error = if failures.is_empty() {
            debug!(network = self.name.as_str(), members = self.len(), "refreshed network");
            None
        } else {
            warn!(
                network = self.name.as_str(),
                failed = failures.len(),
                members = self.len(),
                "network refresh incomplete"
            );
            Some(Arc::new(Error::Refresh(Failures(failures))))
        };
        let mut state = self.state.lock().unwrap();
        state.updated_at = Some(Utc::now());
        state.last_error = error.clone();
        match error {
            Some(error) => Err(Error::Shared(error)),
            None => Ok(()),
        }
    }

    /// Snapshot of the network and all members.
    pub fn view(&self) -> NetworkView {
        let (updated_at, error) = {
            let state = self.state.lock().unwrap();
            (
                state.updated_at,
                state.last_error.as_ref().map(|e| e.to_string()),
            )
        };
        NetworkView {
            name: self.name.clone(),
            healthy: self.healthy(),
            leader: self.leader().map(|s| s.id().to_string()),
            active: self.active().map(|s| s.id().to_string()),
            updated_at,
            error,
            sequencers: self.sequencers.iter().map(|s| s.view()).collect(),
        }
    }
}

/// Serializable snapshot of a [Network].
#[derive(Serialize, Clone, Debug)]
pub struct NetworkView {
    pub name: String,
    pub healthy: bool,
    pub leader: Option<String>,
    pub active: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub sequencers: Vec<SequencerView>,
}
