//! A single fleet member: a conductor paired with a rollup node.
//!
//! A [Sequencer] owns its RPC handles (built lazily through a [Connector]) and the last
//! [Status] it fetched. Status is only ever replaced as a whole: a refresh either updates
//! every field from the same cycle or leaves the previous value untouched and records the
//! failure separately.

use crate::{
    context::Context,
    rpc::{self, ClusterMembership, Conductor as _, Connector, L2BlockRef, Node as _, ServerInfo},
    Error,
};
use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identity and transport settings of a [Sequencer].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Stable identifier (also the consensus server ID).
    pub id: String,
    pub network: String,
    /// `host:port` other members use to reach this member's consensus transport.
    pub raft_addr: String,
    pub conductor_url: String,
    pub node_url: String,
    /// Whether this member is eligible to vote.
    pub voting: bool,
    /// Upper bound on each RPC call.
    pub timeout: Duration,
}

/// Status fetched in a single refresh cycle.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub conductor_active: bool,
    pub conductor_leader: bool,
    pub sequencer_healthy: bool,
    pub sequencer_active: bool,
    /// Latest block known to the node. `None` until the first successful refresh.
    pub unsafe_l2: Option<L2BlockRef>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The most recent failed refresh.
#[derive(Clone, Debug)]
pub struct LastError {
    pub error: Arc<Error>,
    pub at: DateTime<Utc>,
}

/// RPC handles for one sequencer.
pub struct Clients<C: Connector> {
    pub conductor: Arc<C::Conductor>,
    pub node: Arc<C::Node>,
}

impl<C: Connector> Clone for Clients<C> {
    fn clone(&self) -> Self {
        Self {
            conductor: self.conductor.clone(),
            node: self.node.clone(),
        }
    }
}

/// Lifecycle of a sequencer's RPC handles.
pub enum Connection<C: Connector> {
    Uninitialized,
    Connected(Clients<C>),
    Failed(Arc<rpc::Error>),
}

impl<C: Connector> Connection<C> {
    /// Short name of the state (used in views and logs).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connected(_) => "connected",
            Self::Failed(_) => "failed",
        }
    }
}

struct State<C: Connector> {
    connection: Connection<C>,
    status: Status,
    last_error: Option<LastError>,
    /// When `status` was last replaced.
    refreshed: Option<Instant>,
    /// Refreshes started so far.
    issued: u64,
    /// Ticket of the refresh whose outcome is currently recorded.
    applied: u64,
}

/// A fleet member.
pub struct Sequencer<C: Connector> {
    cfg: Config,
    connector: C,
    state: Mutex<State<C>>,
}

impl<C: Connector> Sequencer<C> {
    /// Create a [Sequencer] without connecting to it.
    pub fn new(cfg: Config, connector: C) -> Self {
        Self {
            cfg,
            connector,
            state: Mutex::new(State {
                connection: Connection::Uninitialized,
                status: Status::default(),
                last_error: None,
                refreshed: None,
                issued: 0,
                applied: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    pub fn network(&self) -> &str {
        &self.cfg.network
    }

    pub fn raft_addr(&self) -> &str {
        &self.cfg.raft_addr
    }

    pub fn conductor_url(&self) -> &str {
        &self.cfg.conductor_url
    }

    pub fn node_url(&self) -> &str {
        &self.cfg.node_url
    }

    pub fn voting(&self) -> bool {
        self.cfg.voting
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Copy of the last successfully fetched [Status].
    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status.clone()
    }

    /// The last refresh failure, if the most recent refresh failed.
    pub fn last_error(&self) -> Option<LastError> {
        self.state.lock().unwrap().last_error.clone()
    }

    /// Time of the last successful refresh.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().status.updated_at
    }

    /// Whether the last successful refresh is older than `ttl` (or never happened).
    pub fn is_stale(&self, ttl: Duration) -> bool {
        match self.state.lock().unwrap().refreshed {
            Some(refreshed) => refreshed.elapsed() >= ttl,
            None => true,
        }
    }

    /// Name of the current [Connection] state.
    pub fn connection(&self) -> &'static str {
        self.state.lock().unwrap().connection.name()
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().unwrap().status.conductor_leader
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().status.sequencer_active
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().unwrap().status.sequencer_healthy
    }

    /// Build RPC handles, replacing any existing ones.
    pub fn connect(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        self.establish(&mut state).map(|_| ())
    }

    /// Drop the RPC handles so the next call rebuilds them.
    pub fn reset_clients(&self) {
        let mut state = self.state.lock().unwrap();
        state.connection = Connection::Uninitialized;
        debug!(sequencer = self.cfg.id.as_str(), "reset rpc clients");
    }

    fn establish(&self, state: &mut State<C>) -> Result<Clients<C>, Error> {
        match self
            .connector
            .connect(&self.cfg.conductor_url, &self.cfg.node_url)
        {
            Ok((conductor, node)) => {
                let clients = Clients {
                    conductor: Arc::new(conductor),
                    node: Arc::new(node),
                };
                state.connection = Connection::Connected(clients.clone());
                Ok(clients)
            }
            Err(err) => {
                let err = Arc::new(err);
                warn!(sequencer = self.cfg.id.as_str(), error = %err, "failed to build rpc clients");
                state.connection = Connection::Failed(err.clone());
                Err(Error::NotInitialized {
                    id: self.cfg.id.clone(),
                    source: err,
                })
            }
        }
    }

    /// Return the current handles, building them on demand.
    fn clients(&self) -> Result<Clients<C>, Error> {
        let mut state = self.state.lock().unwrap();
        if let Connection::Connected(clients) = &state.connection {
            return Ok(clients.clone());
        }
        self.establish(&mut state)
    }

    /// Bound a single RPC call by the configured timeout.
    async fn call<T>(
        &self,
        method: &'static str,
        future: impl Future<Output = Result<T, rpc::Error>>,
    ) -> Result<T, Error> {
        let result = match tokio::time::timeout(self.cfg.timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(rpc::Error::Timeout {
                method,
                timeout: self.cfg.timeout,
            }),
        };
        result.map_err(|source| Error::Rpc {
            id: self.cfg.id.clone(),
            source,
        })
    }

    /// Run a single control call against this sequencer.
    async fn invoke<T, F, Fut>(&self, ctx: &Context, method: &'static str, f: F) -> Result<T, Error>
    where
        F: FnOnce(Clients<C>) -> Fut,
        Fut: Future<Output = Result<T, rpc::Error>>,
    {
        let clients = self.clients()?;
        let result = ctx.run(self.call(method, f(clients))).await;
        match &result {
            Ok(_) => info!(sequencer = self.cfg.id.as_str(), method, "call succeeded"),
            Err(err) => warn!(sequencer = self.cfg.id.as_str(), method, error = %err, "call failed"),
        }
        result
    }

    async fn fetch(&self, ctx: &Context) -> Result<Status, Error> {
        let clients = self.clients()?;
        let (conductor, node) = (&clients.conductor, &clients.node);
        let (conductor_active, conductor_leader, sequencer_healthy, sequencer_active, sync) = ctx
            .run(async {
                futures::try_join!(
                    self.call("conductor_active", conductor.active()),
                    self.call("conductor_leader", conductor.leader()),
                    self.call("conductor_sequencerHealthy", conductor.sequencer_healthy()),
                    self.call("admin_sequencerActive", node.sequencer_active()),
                    self.call("optimism_syncStatus", node.sync_status()),
                )
            })
            .await?;
        Ok(Status {
            conductor_active,
            conductor_leader,
            sequencer_healthy,
            sequencer_active,
            unsafe_l2: Some(sync.unsafe_l2),
            updated_at: Some(Utc::now()),
        })
    }

    /// Fetch a fresh [Status], replacing the previous one only if every query succeeds.
    ///
    /// On failure the previous [Status] is kept and the error is recorded (see
    /// [Sequencer::last_error]). Overlapping refreshes apply in start order: a refresh that
    /// completes after a later-started one is discarded.
    pub async fn update(&self, ctx: &Context) -> Result<(), Error> {
        let ticket = {
            let mut state = self.state.lock().unwrap();
            state.issued += 1;
            state.issued
        };
        let result = self.fetch(ctx).await;
        let mut state = self.state.lock().unwrap();
        if ticket < state.applied {
            debug!(sequencer = self.cfg.id.as_str(), ticket, "discarding superseded refresh");
            return result.map(|_| ());
        }
        state.applied = ticket;
        match result {
            Ok(status) => {
                debug!(
                    sequencer = self.cfg.id.as_str(),
                    leader = status.conductor_leader,
                    active = status.sequencer_active,
                    healthy = status.sequencer_healthy,
                    "refreshed status"
                );
                state.status = status;
                state.refreshed = Some(Instant::now());
                state.last_error = None;
                Ok(())
            }
            Err(err) => {
                let err = err.into_shared();
                debug!(sequencer = self.cfg.id.as_str(), error = %err, "refresh failed");
                state.last_error = Some(LastError {
                    error: err.clone(),
                    at: Utc::now(),
                });
                Err(Error::Shared(err))
            }
        }
    }

    pub async fn pause(&self, ctx: &Context) -> Result<(), Error> {
        self.invoke(ctx, "conductor_pause", |c| async move {
            c.conductor.pause().await
        })
        .await
    }

    pub async fn resume(&self, ctx: &Context) -> Result<(), Error> {
        self.invoke(ctx, "conductor_resume", |c| async move {
            c.conductor.resume().await
        })
        .await
    }

    pub async fn paused(&self, ctx: &Context) -> Result<bool, Error> {
        self.invoke(ctx, "conductor_paused", |c| async move {
            c.conductor.paused().await
        })
        .await
    }

    pub async fn stopped(&self, ctx: &Context) -> Result<bool, Error> {
        self.invoke(ctx, "conductor_stopped", |c| async move {
            c.conductor.stopped().await
        })
        .await
    }

    /// Ask this sequencer (which must be the leader) to hand leadership to any voter.
    pub async fn transfer_leader(&self, ctx: &Context) -> Result<(), Error> {
        self.invoke(ctx, "conductor_transferLeader", |c| async move {
            c.conductor.transfer_leader().await
        })
        .await
    }

    /// Ask this sequencer (which must be the leader) to hand leadership to `id` at `addr`.
    pub async fn transfer_leader_to_server(
        &self,
        ctx: &Context,
        id: &str,
        addr: &str,
    ) -> Result<(), Error> {
        let (id, addr) = (id.to_string(), addr.to_string());
        self.invoke(ctx, "conductor_transferLeaderToServer", |c| async move {
            c.conductor.transfer_leader_to_server(&id, &addr).await
        })
        .await
    }

    /// Set or clear the conductor's leadership override.
    ///
    /// Forcing leadership also requires [Sequencer::override_node_leader]; this call does not
    /// keep the two sides in sync.
    pub async fn override_leader(&self, ctx: &Context, force: bool) -> Result<(), Error> {
        self.invoke(ctx, "conductor_overrideLeader", |c| async move {
            c.conductor.override_leader(force).await
        })
        .await
    }

    /// Claim leadership on the node side.
    pub async fn override_node_leader(&self, ctx: &Context) -> Result<(), Error> {
        self.invoke(ctx, "admin_overrideLeader", |c| async move {
            c.node.override_leader().await
        })
        .await
    }

    pub async fn leader_with_id(&self, ctx: &Context) -> Result<ServerInfo, Error> {
        self.invoke(ctx, "conductor_leaderWithID", |c| async move {
            c.conductor.leader_with_id().await
        })
        .await
    }

    pub async fn cluster_membership(&self, ctx: &Context) -> Result<ClusterMembership, Error> {
        self.invoke(ctx, "conductor_clusterMembership", |c| async move {
            c.conductor.cluster_membership().await
        })
        .await
    }

    /// Add `id` at `addr` as a voter, fenced on membership version `prev_index`.
    pub async fn add_server_as_voter(
        &self,
        ctx: &Context,
        id: &str,
        addr: &str,
        prev_index: u64,
    ) -> Result<(), Error> {
        let (id, addr) = (id.to_string(), addr.to_string());
        self.invoke(ctx, "conductor_addServerAsVoter", |c| async move {
            c.conductor.add_server_as_voter(&id, &addr, prev_index).await
        })
        .await
    }

    /// Add `id` at `addr` as a non-voter, fenced on membership version `prev_index`.
    pub async fn add_server_as_nonvoter(
        &self,
        ctx: &Context,
        id: &str,
        addr: &str,
        prev_index: u64,
    ) -> Result<(), Error> {
        let (id, addr) = (id.to_string(), addr.to_string());
        self.invoke(ctx, "conductor_addServerAsNonvoter", |c| async move {
            c.conductor
                .add_server_as_nonvoter(&id, &addr, prev_index)
                .await
        })
        .await
    }

    /// Remove `id`, fenced on membership version `prev_index`.
    pub async fn remove_server(&self, ctx: &Context, id: &str, prev_index: u64) -> Result<(), Error> {
        let id = id.to_string();
        self.invoke(ctx, "conductor_removeServer", |c| async move {
            c.conductor.remove_server(&id, prev_index).await
        })
        .await
    }

    /// Stop block production, returning the hash of the last block produced.
    pub async fn stop_sequencer(&self, ctx: &Context) -> Result<B256, Error> {
        self.invoke(ctx, "admin_stopSequencer", |c| async move {
            c.node.stop_sequencer().await
        })
        .await
    }

    /// Resume block production on top of `hash`.
    pub async fn start_sequencer(&self, ctx: &Context, hash: B256) -> Result<(), Error> {
        self.invoke(ctx, "admin_startSequencer", |c| async move {
            c.node.start_sequencer(hash).await
        })
        .await
    }

    /// Snapshot of identity, status, and error state.
    pub fn view(&self) -> SequencerView {
        let state = self.state.lock().unwrap();
        SequencerView {
            id: self.cfg.id.clone(),
            network: self.cfg.network.clone(),
            raft_addr: self.cfg.raft_addr.clone(),
            conductor_url: self.cfg.conductor_url.clone(),
            node_url: self.cfg.node_url.clone(),
            voting: self.cfg.voting,
            connection: state.connection.name(),
            status: state.status.clone(),
            error: state.last_error.as_ref().map(|e| e.error.to_string()),
            error_at: state.last_error.as_ref().map(|e| e.at),
        }
    }
}

/// Serializable snapshot of a [Sequencer].
#[derive(Serialize, Clone, Debug)]
pub struct SequencerView {
    pub id: String,
    pub network: String,
    pub raft_addr: String,
    pub conductor_url: String,
    pub node_url: String,
    pub voting: bool,
    pub connection: &'static str,
    #[serde(flatten)]
    pub status: Status,
    pub error: Option<String>,
    pub error_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{self, Query};

    fn sequencer(connector: &mocks::Connector, id: &str) -> Sequencer<mocks::Connector> {
        Sequencer::new(mocks::config(id, "alpha", true), connector.clone())
    }

    #[tokio::test]
    async fn test_update_success() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-0");
        connector.set_leader("seq-0", true);

        assert!(seq.status().unsafe_l2.is_none());
        seq.update(&Context::new()).await.unwrap();

        let status = seq.status();
        assert!(status.conductor_active);
        assert!(status.conductor_leader);
        assert!(status.sequencer_healthy);
        assert!(status.sequencer_active);
        assert_eq!(status.unsafe_l2.unwrap().number, 100);
        assert!(status.updated_at.is_some());
        assert!(seq.last_error().is_none());
        assert_eq!(seq.connection(), "connected");
    }

    #[tokio::test]
    async fn test_update_atomic_on_each_query_failure() {
        for query in Query::STATUS {
            let connector = mocks::Connector::default();
            let seq = sequencer(&connector, "seq-0");
            seq.update(&Context::new()).await.unwrap();
            let before = seq.status();

            // Change every answer so a partial write would be visible
            connector.set_leader("seq-0", true);
            connector.set_active("seq-0", false);
            connector.set_healthy("seq-0", false);
            connector.set_head("seq-0", 200);
            connector.fail("seq-0", query);

            let result = seq.update(&Context::new()).await;
            assert!(result.is_err(), "{query:?} failure not reported");
            assert_eq!(seq.status(), before, "{query:?} failure mutated status");
            assert!(seq.last_error().is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_sync_status_timeout() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-0");
        seq.update(&Context::new()).await.unwrap();
        let before = seq.status();

        connector.stall("seq-0", Query::SyncStatus, Duration::from_secs(60));
        let err = seq.update(&Context::new()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert_eq!(seq.status(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_refresh_does_not_overwrite_newer() {
        let connector = mocks::Connector::default();
        let seq = Arc::new(sequencer(&connector, "seq-0"));
        seq.update(&Context::new()).await.unwrap();

        // The first refresh reads head 100 but is delivered late
        connector.stall("seq-0", Query::SyncStatus, Duration::from_millis(500));
        let slow = {
            let seq = seq.clone();
            tokio::spawn(async move { seq.update(&Context::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A later refresh lands first with head 200
        connector.recover("seq-0");
        connector.set_head("seq-0", 200);
        seq.update(&Context::new()).await.unwrap();
        assert_eq!(seq.status().unsafe_l2.unwrap().number, 200);

        slow.await.unwrap().unwrap();
        assert_eq!(seq.status().unsafe_l2.unwrap().number, 200);
        assert!(!seq.is_stale(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_stale_until_first_success() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-0");
        assert!(seq.is_stale(Duration::from_secs(60)));

        connector.fail("seq-0", Query::Leader);
        seq.update(&Context::new()).await.unwrap_err();
        assert!(seq.is_stale(Duration::from_secs(60)));

        connector.recover("seq-0");
        seq.update(&Context::new()).await.unwrap();
        assert!(!seq.is_stale(Duration::from_secs(60)));
        assert!(seq.is_stale(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_update_cancelled_records_error() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-0");
        let ctx = Context::new();
        ctx.cancel();

        let err = seq.update(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Shared(ref e) if matches!(**e, Error::Cancelled)));
        assert_eq!(seq.status(), Status::default());
        assert!(matches!(
            *seq.last_error().unwrap().error,
            Error::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_success_clears_error() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-0");
        connector.fail("seq-0", Query::Leader);
        seq.update(&Context::new()).await.unwrap_err();
        assert!(seq.last_error().is_some());

        connector.recover("seq-0");
        seq.update(&Context::new()).await.unwrap();
        assert!(seq.last_error().is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_not_initialized() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-0");
        connector.refuse_connect("seq-0");

        let err = seq.pause(&Context::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized { .. }));
        assert_eq!(seq.connection(), "failed");

        connector.allow_connect("seq-0");
        seq.connect().unwrap();
        assert_eq!(seq.connection(), "connected");
    }

    #[tokio::test]
    async fn test_reset_clients_reconnects() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-0");
        seq.update(&Context::new()).await.unwrap();
        assert_eq!(connector.connects("seq-0"), 1);

        seq.reset_clients();
        assert_eq!(seq.connection(), "uninitialized");
        seq.update(&Context::new()).await.unwrap();
        assert_eq!(connector.connects("seq-0"), 2);
    }

    #[tokio::test]
    async fn test_control_calls_forwarded() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-0");
        let ctx = Context::new();

        seq.pause(&ctx).await.unwrap();
        assert!(seq.paused(&ctx).await.unwrap());
        seq.resume(&ctx).await.unwrap();
        assert!(!seq.paused(&ctx).await.unwrap());

        let hash = seq.stop_sequencer(&ctx).await.unwrap();
        assert_eq!(hash, mocks::hash(100));
        seq.start_sequencer(&ctx, hash).await.unwrap();

        seq.override_leader(&ctx, true).await.unwrap();
        seq.override_node_leader(&ctx).await.unwrap();
        seq.add_server_as_voter(&ctx, "seq-9", "seq-9:50050", 0)
            .await
            .unwrap();
        seq.remove_server(&ctx, "seq-9", 1).await.unwrap();

        let calls = connector.calls("seq-0");
        assert_eq!(
            calls,
            vec![
                "conductor_pause",
                "conductor_paused",
                "conductor_resume",
                "conductor_paused",
                "admin_stopSequencer",
                "admin_startSequencer",
                "conductor_overrideLeader",
                "admin_overrideLeader",
                "conductor_addServerAsVoter",
                "conductor_removeServer",
            ]
        );
    }

    #[tokio::test]
    async fn test_control_error_carries_identity() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-3");
        connector.fail("seq-3", Query::Control);

        let err = seq.resume(&Context::new()).await.unwrap_err();
        assert!(matches!(err, Error::Rpc { ref id, .. } if id == "seq-3"));
        assert!(err.to_string().contains("seq-3"));
    }

    #[tokio::test]
    async fn test_view_reports_error() {
        let connector = mocks::Connector::default();
        let seq = sequencer(&connector, "seq-0");
        connector.fail("seq-0", Query::Active);
        seq.update(&Context::new()).await.unwrap_err();

        let view = seq.view();
        assert_eq!(view.id, "seq-0");
        assert!(view.voting);
        assert!(view.error.is_some());
        assert!(view.error_at.is_some());
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["conductor_leader"], false);
        assert_eq!(json["connection"], "connected");
    }
}
