//! Named operator actions with precondition checks.
//!
//! A [Registry] lists the actions an operator surface exposes. The [Controller] resolves
//! the target through a [Repository], checks the action's preconditions against the
//! member's cached status, performs the calls, and returns the member's refreshed view.
//!
//! Membership changes are always issued to the network's current leader and fenced on the
//! membership version it reports, so a concurrent change makes the call fail rather than
//! apply on top of a configuration the operator never saw.

use crate::{
    context::Context,
    discovery::Provider,
    network::Network,
    repository::Repository,
    rpc::{ClusterMembership, Connector, Suffrage},
    sequencer::{Sequencer, SequencerView},
    Error,
};
use alloy_primitives::B256;
use serde::Serialize;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, info};

/// Default bound on a single action.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An operator action on a single sequencer.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Pause,
    Resume,
    TransferLeader,
    OverrideLeader,
    ClearOverride,
    Halt,
    ForceActive,
    AddVoter,
    AddNonvoter,
    RemoveServer,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::Pause,
        Action::Resume,
        Action::TransferLeader,
        Action::OverrideLeader,
        Action::ClearOverride,
        Action::Halt,
        Action::ForceActive,
        Action::AddVoter,
        Action::AddNonvoter,
        Action::RemoveServer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::TransferLeader => "transfer-leader",
            Self::OverrideLeader => "override-leader",
            Self::ClearOverride => "clear-override",
            Self::Halt => "halt",
            Self::ForceActive => "force-active",
            Self::AddVoter => "add-voter",
            Self::AddNonvoter => "add-nonvoter",
            Self::RemoveServer => "remove-server",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Pause => "Pause the conductor so it stops managing its sequencer",
            Self::Resume => "Resume a paused conductor",
            Self::TransferLeader => "Hand consensus leadership to another member",
            Self::OverrideLeader => "Force the member to act as leader (disaster recovery)",
            Self::ClearOverride => "Clear a previous leader override",
            Self::Halt => "Stop block production on the member's node",
            Self::ForceActive => "Start block production on the member's node",
            Self::AddVoter => "Add the member to the consensus cluster as a voter",
            Self::AddNonvoter => "Add the member to the consensus cluster as a non-voter",
            Self::RemoveServer => "Remove the member from the consensus cluster",
        }
    }

    /// Whether the action can interrupt block production.
    pub fn disruptive(&self) -> bool {
        matches!(
            self,
            Self::TransferLeader
                | Self::OverrideLeader
                | Self::Halt
                | Self::ForceActive
                | Self::RemoveServer
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.name() == s)
            .ok_or_else(|| Error::UnknownAction(s.to_string()))
    }
}

/// The set of actions exposed to operators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registry {
    actions: Vec<Action>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Action::ALL)
    }
}

impl Registry {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        let mut registered = Vec::new();
        for action in actions {
            if !registered.contains(&action) {
                registered.push(action);
            }
        }
        Self {
            actions: registered,
        }
    }

    /// Registered actions in registration order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn contains(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }

    /// Resolve a registered action by name.
    pub fn lookup(&self, name: &str) -> Result<Action, Error> {
        let action = Action::from_str(name)?;
        if !self.contains(action) {
            return Err(Error::UnknownAction(name.to_string()));
        }
        Ok(action)
    }
}

/// Target and arguments of an action.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    pub network: String,
    pub sequencer: String,
    /// Member to hand leadership to ([Action::TransferLeader]).
    pub target: Option<String>,
    /// Block to resume production from ([Action::ForceActive]).
    pub hash: Option<B256>,
}

/// Result of a completed action.
#[derive(Serialize, Clone, Debug)]
pub struct Outcome {
    pub action: Action,
    /// Block hash returned by or passed to the node, if any.
    pub hash: Option<B256>,
    pub sequencer: SequencerView,
}

fn require(condition: bool, reason: impl FnOnce() -> String) -> Result<(), Error> {
    if condition {
        Ok(())
    } else {
        Err(Error::Precondition(reason()))
    }
}

/// Executes registered [Action]s against the fleet.
pub struct Controller<P: Provider> {
    repository: Arc<Repository<P>>,
    registry: Registry,
    timeout: Duration,
}

impl<P: Provider> Controller<P> {
    pub fn new(repository: Arc<Repository<P>>, registry: Registry, timeout: Duration) -> Self {
        Self {
            repository,
            registry,
            timeout,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn repository(&self) -> &Arc<Repository<P>> {
        &self.repository
    }

    async fn resolve(
        &self,
        ctx: &Context,
        request: &Request,
    ) -> Result<(Arc<Network<P::Connector>>, Arc<Sequencer<P::Connector>>), Error> {
        let network = self.repository.get_network(ctx, &request.network).await?;
        let sequencer =
            network
                .sequencer(&request.sequencer)
                .ok_or_else(|| Error::SequencerNotFound {
                    network: request.network.clone(),
                    sequencer: request.sequencer.clone(),
                })?;
        Ok((network, sequencer))
    }

    /// Current consensus membership of `network`, read from its leader.
    pub async fn membership(&self, ctx: &Context, network: &str) -> Result<ClusterMembership, Error> {
        let ctx = ctx.or_timeout(self.timeout);
        let network = self.repository.get_network(&ctx, network).await?;
        let leader = leader(&network)?;
        leader.cluster_membership(&ctx).await
    }

    /// Run `action` against the member named in `request`.
    pub async fn execute(
        &self,
        ctx: &Context,
        action: Action,
        request: &Request,
    ) -> Result<Outcome, Error> {
        if !self.registry.contains(action) {
            return Err(Error::UnknownAction(action.name().to_string()));
        }
        let ctx = ctx.or_timeout(self.timeout);
        let (network, sequencer) = self.resolve(&ctx, request).await?;
        let hash = self.perform(&ctx, action, request, &network, &sequencer).await?;
        info!(
            action = action.name(),
            network = network.name(),
            sequencer = sequencer.id(),
            "executed action"
        );

        if let Err(err) = sequencer.update(&ctx).await {
            debug!(sequencer = sequencer.id(), error = %err, "post-action refresh failed");
        }
        Ok(Outcome {
            action,
            hash,
            sequencer: sequencer.view(),
        })
    }

    async fn perform(
        &self,
        ctx: &Context,
        action: Action,
        request: &Request,
        network: &Network<P::Connector>,
        sequencer: &Sequencer<P::Connector>,
    ) -> Result<Option<B256>, Error> {
        let id = sequencer.id();
        let status = sequencer.status();
        match action {
            Action::Pause => {
                require(status.conductor_active, || format!("{id} is already paused"))?;
                sequencer.pause(ctx).await?;
            }
            Action::Resume => {
                require(!status.conductor_active, || format!("{id} is not paused"))?;
                sequencer.resume(ctx).await?;
            }
            Action::TransferLeader => {
                require(status.conductor_leader, || format!("{id} is not the leader"))?;
                match &request.target {
                    Some(target) => {
                        require(target != id, || {
                            "cannot transfer leadership to the current leader".to_string()
                        })?;
                        let target = network.sequencer(target).ok_or_else(|| {
                            Error::SequencerNotFound {
                                network: network.name().to_string(),
                                sequencer: target.clone(),
                            }
                        })?;
                        require(target.voting(), || {
                            format!("{} is not eligible to vote", target.id())
                        })?;
                        sequencer
                            .transfer_leader_to_server(ctx, target.id(), target.raft_addr())
                            .await?;
                    }
                    None => sequencer.transfer_leader(ctx).await?,
                }
            }
            Action::OverrideLeader => {
                sequencer.override_leader(ctx, true).await?;
                sequencer.override_node_leader(ctx).await?;
            }
            Action::ClearOverride => {
                sequencer.override_leader(ctx, false).await?;
            }
            Action::Halt => {
                require(status.sequencer_active, || format!("{id} is not sequencing"))?;
                return Ok(Some(sequencer.stop_sequencer(ctx).await?));
            }
            Action::ForceActive => {
                require(!status.sequencer_active, || format!("{id} is already sequencing"))?;
                let hash = request
                    .hash
                    .or(status.unsafe_l2.map(|block| block.hash))
                    .ok_or_else(|| {
                        Error::Precondition(format!("no block hash known for {id}"))
                    })?;
                sequencer.start_sequencer(ctx, hash).await?;
                return Ok(Some(hash));
            }
            Action::AddVoter | Action::AddNonvoter | Action::RemoveServer => {
                let leader = leader(network)?;
                let membership = leader.cluster_membership(ctx).await?;
                let member = membership.servers.iter().find(|s| s.id == id);
                match action {
                    Action::AddVoter => {
                        require(sequencer.voting(), || {
                            format!("{id} is not eligible to vote")
                        })?;
                        require(
                            member.map_or(true, |m| m.suffrage != Suffrage::Voter),
                            || format!("{id} is already a voter"),
                        )?;
                        leader
                            .add_server_as_voter(ctx, id, sequencer.raft_addr(), membership.version)
                            .await?;
                    }
                    Action::AddNonvoter => {
                        require(member.is_none(), || format!("{id} is already a member"))?;
                        leader
                            .add_server_as_nonvoter(
                                ctx,
                                id,
                                sequencer.raft_addr(),
                                membership.version,
                            )
                            .await?;
                    }
                    _ => {
                        require(member.is_some(), || format!("{id} is not a member"))?;
                        require(leader.id() != id, || {
                            format!("{id} is the leader; transfer leadership first")
                        })?;
                        leader.remove_server(ctx, id, membership.version).await?;
                    }
                }
            }
        }
        Ok(None)
    }
}

fn leader<C: Connector>(network: &Network<C>) -> Result<Arc<Sequencer<C>>, Error> {
    network
        .leader()
        .ok_or_else(|| Error::Precondition(format!("network {} has no leader", network.name())))
}
